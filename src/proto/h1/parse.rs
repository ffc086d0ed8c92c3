//! HTTP/1.1 response head parser.

use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode, Version};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::trace;

use crate::error::{Error, Result};

use super::io::BufferedIo;

/// Default bound on a buffered response head.
pub(crate) const DEFAULT_MAX_HEAD_BYTES: usize = 16 * 1024;

const MAX_HEADERS: usize = 100;

#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub(crate) status: StatusCode,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
}

/// Reads one response head from the buffered transport.
///
/// The reason phrase is parsed tolerantly (anything up to CRLF); header
/// count and total head size are bounded.
pub(crate) async fn read_head<T>(
    io: &mut BufferedIo<T>,
    max_bytes: usize,
) -> Result<ResponseHead>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        if let Some(head) = try_parse(io)? {
            return Ok(head);
        }
        if io.data().len() >= max_bytes {
            return Err(Error::new_network("response head too large"));
        }
        if io.fill().await.map_err(Error::new_io)? == 0 {
            return Err(Error::new_network(
                "connection closed before a complete response head",
            ));
        }
    }
}

fn try_parse<T>(io: &mut BufferedIo<T>) -> Result<Option<ResponseHead>>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut header_storage);
    let consumed = match parsed.parse(io.data()) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(err) => return Err(Error::new_network(format!("invalid response head: {}", err))),
    };

    let status = StatusCode::from_u16(parsed.code.expect("complete parse has code"))
        .map_err(|_| Error::new_network("invalid response status"))?;
    let version = match parsed.version.expect("complete parse has version") {
        0 => Version::HTTP_10,
        1 => Version::HTTP_11,
        _ => return Err(Error::new_network("unsupported http version")),
    };

    let mut headers = HeaderMap::with_capacity(parsed.headers.len());
    for header in parsed.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| Error::new_network("invalid response header name"))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|_| Error::new_network("invalid response header value"))?;
        headers.append(name, value);
    }

    trace!("parsed response head: {} ({} headers)", status, headers.len());
    io.advance(consumed);
    Ok(Some(ResponseHead {
        status,
        version,
        headers,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn parse(raw: &'static [u8]) -> Result<ResponseHead> {
        let (client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            server.write_all(raw).await.unwrap();
        });
        let mut io = BufferedIo::new(client);
        read_head(&mut io, DEFAULT_MAX_HEAD_BYTES).await
    }

    #[tokio::test]
    async fn simple_head() {
        let head = parse(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(head.version, Version::HTTP_11);
        assert_eq!(head.headers["content-length"], "0");
    }

    #[tokio::test]
    async fn tolerant_reason_phrase() {
        let head = parse(b"HTTP/1.1 200 OK  and then  some\r\n\r\n").await.unwrap();
        assert_eq!(head.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn multi_value_headers_preserved() {
        let head = parse(b"HTTP/1.1 200 OK\r\nset-cookie: a=1\r\nset-cookie: b=2\r\n\r\n")
            .await
            .unwrap();
        let cookies: Vec<_> = head.headers.get_all("set-cookie").iter().collect();
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies[0], "a=1");
        assert_eq!(cookies[1], "b=2");
    }

    #[tokio::test]
    async fn oversized_head_rejected() {
        let (client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            server.write_all(b"HTTP/1.1 200 OK\r\n").await.unwrap();
            let filler = vec![b'a'; 64];
            loop {
                if server.write_all(b"x-fill: ").await.is_err() {
                    break;
                }
                if server.write_all(&filler).await.is_err() {
                    break;
                }
                if server.write_all(b"\r\n").await.is_err() {
                    break;
                }
            }
        });
        let mut io = BufferedIo::new(client);
        let err = read_head(&mut io, 1024).await.unwrap_err();
        assert!(err.is_network());
    }

    #[tokio::test]
    async fn early_close_is_network_error() {
        let err = parse(b"HTTP/1.1 200").await.unwrap_err();
        assert!(err.is_network());
    }
}
