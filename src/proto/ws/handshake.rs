//! WebSocket opening handshake (RFC 6455 §4).

use base64::Engine;
use bytes::{BufMut, BytesMut};
use http::header::{HeaderMap, SEC_WEBSOCKET_PROTOCOL};
use http::StatusCode;
use rand::RngCore;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

use crate::common::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::headers;
use crate::proto::h1::io::BufferedIo;
use crate::proto::h1::parse;
use crate::request::Request;

use super::extension;

const WS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Bound on a non-101 diagnostic body.
const MAX_ERROR_BODY: usize = 4 * 1024;

pub(crate) struct HandshakeOutcome {
    pub(crate) deflate: bool,
    pub(crate) subprotocol: Option<String>,
}

/// Drives the upgrade request/response over an established transport.
pub(crate) async fn handshake<T>(
    io: &mut BufferedIo<T>,
    req: &Request,
    offer_deflate: bool,
    cancel: &CancelToken,
) -> Result<HandshakeOutcome>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let key = generate_key();
    let head = build_upgrade_request(req, &key, offer_deflate)?;

    tokio::select! {
        res = async {
            io.write_all(&head).await?;
            io.flush().await
        } => res.map_err(Error::new_io)?,
        _ = cancel.canceled() => return Err(cancel.error()),
    }

    let head = tokio::select! {
        res = parse::read_head(io, parse::DEFAULT_MAX_HEAD_BYTES) => res?,
        _ = cancel.canceled() => return Err(cancel.error()),
    };

    if head.status != StatusCode::SWITCHING_PROTOCOLS {
        let body = read_error_body(io, &head).await;
        debug!("websocket upgrade refused with {}", head.status);
        return Err(Error::new_http(head.status).with(format!(
            "upgrade refused: {}",
            String::from_utf8_lossy(&body)
        )));
    }

    validate_upgrade_headers(&head.headers)?;
    validate_accept(&head.headers, &key)?;

    let subprotocol = validate_subprotocol(&head.headers, req.headers())?;

    let extensions = extension::parse_all(&head.headers)?;
    let deflate = if offer_deflate {
        extension::accept_deflate(&extensions)?
    } else if extensions.is_empty() {
        false
    } else {
        return Err(Error::new_extension(
            "server accepted extensions that were never offered",
        ));
    };

    trace!(
        "websocket established; deflate={} subprotocol={:?}",
        deflate,
        subprotocol
    );
    Ok(HandshakeOutcome {
        deflate,
        subprotocol,
    })
}

fn generate_key() -> String {
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);
    base64::engine::general_purpose::STANDARD.encode(nonce)
}

/// The expected `Sec-WebSocket-Accept` for a key.
pub(crate) fn accept_for(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(WS_GUID);
    base64::engine::general_purpose::STANDARD.encode(sha.finalize())
}

fn build_upgrade_request(req: &Request, key: &str, offer_deflate: bool) -> Result<BytesMut> {
    // Custom headers must be CRLF-free ASCII; the builder already refused
    // CR/LF and NUL, non-ascii is refused here.
    for (name, value) in req.headers() {
        if value.as_bytes().iter().any(|&b| b >= 0x80) {
            return Err(Error::new_invalid_request(format!(
                "non-ascii value for header {}",
                name
            )));
        }
    }

    let mut head = BytesMut::with_capacity(256);
    head.put_slice(b"GET ");
    // Uri carries no fragment, so the target is already fragment-free.
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    head.put_slice(path.as_bytes());
    head.put_slice(b" HTTP/1.1\r\nhost: ");
    put_host(req, &mut head);
    head.put_slice(b"\r\nupgrade: websocket\r\nconnection: Upgrade\r\nsec-websocket-key: ");
    head.put_slice(key.as_bytes());
    head.put_slice(b"\r\nsec-websocket-version: 13\r\n");
    if offer_deflate {
        head.put_slice(b"sec-websocket-extensions: ");
        head.put_slice(extension::DEFLATE_OFFER.as_bytes());
        head.put_slice(b"\r\n");
    }
    for (name, value) in req.headers() {
        if *name == http::header::HOST {
            continue;
        }
        head.put_slice(name.as_str().as_bytes());
        head.put_slice(b": ");
        head.put_slice(value.as_bytes());
        head.put_slice(b"\r\n");
    }
    head.put_slice(b"\r\n");
    Ok(head)
}

fn put_host(req: &Request, head: &mut BytesMut) {
    let host = req.uri().host().expect("validated at build");
    let bracketed = host.contains(':') && !host.starts_with('[');
    if bracketed {
        head.put_u8(b'[');
    }
    head.put_slice(host.as_bytes());
    if bracketed {
        head.put_u8(b']');
    }
    if let Some(port) = req.uri().port_u16() {
        let default = if req.is_tls() { 443 } else { 80 };
        if port != default {
            head.put_slice(format!(":{}", port).as_bytes());
        }
    }
}

/// `Upgrade` and `Connection` are token lists; membership is checked per
/// comma-separated token, case-insensitively.
fn validate_upgrade_headers(response: &HeaderMap) -> Result<()> {
    let has_upgrade = response
        .get_all(http::header::UPGRADE)
        .iter()
        .any(|v| headers::connection_has(v, "websocket"));
    if !has_upgrade {
        return Err(Error::new_protocol("response missing Upgrade: websocket"));
    }
    let has_connection = response
        .get_all(http::header::CONNECTION)
        .iter()
        .any(|v| headers::connection_has(v, "upgrade"));
    if !has_connection {
        return Err(Error::new_protocol("response missing Connection: Upgrade"));
    }
    Ok(())
}

fn validate_accept(response: &HeaderMap, key: &str) -> Result<()> {
    let accept = response
        .get("sec-websocket-accept")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::new_protocol("response missing Sec-WebSocket-Accept"))?;
    let expected = accept_for(key);
    if !constant_time_eq(accept.trim().as_bytes(), expected.as_bytes()) {
        return Err(Error::new_protocol("Sec-WebSocket-Accept mismatch"));
    }
    Ok(())
}

fn validate_subprotocol(
    response: &HeaderMap,
    requested: &HeaderMap,
) -> Result<Option<String>> {
    let Some(selected) = response.get(SEC_WEBSOCKET_PROTOCOL) else {
        return Ok(None);
    };
    let selected = selected
        .to_str()
        .map_err(|_| Error::new_protocol("subprotocol is not ascii"))?
        .trim()
        .to_owned();

    let offered = requested
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .any(|offer| offer.eq_ignore_ascii_case(&selected));
    if !offered {
        return Err(Error::new_protocol(format!(
            "server selected unoffered subprotocol {}",
            selected
        )));
    }
    Ok(Some(selected))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

async fn read_error_body<T>(io: &mut BufferedIo<T>, head: &parse::ResponseHead) -> Vec<u8>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut body = Vec::new();
    let limit = match headers::content_length_parse_all(&head.headers) {
        Ok(Some(len)) => (len as usize).min(MAX_ERROR_BODY),
        _ => MAX_ERROR_BODY,
    };
    while body.len() < limit {
        if !io.has_buffered_input() {
            match io.fill().await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
        let taken = io.take(limit - body.len());
        body.extend_from_slice(&taken);
    }
    body
}
