//! `Sec-WebSocket-Extensions` grammar (RFC 7230 list syntax) and the
//! permessage-deflate negotiation rules.

use http::HeaderMap;

use crate::error::{Error, Result};
use crate::headers;

pub(crate) const PERMESSAGE_DEFLATE: &str = "permessage-deflate";

/// What we put on the wire when offering compression. Context takeover is
/// disabled in both directions; no sliding-window state survives a message.
pub(crate) const DEFLATE_OFFER: &str =
    "permessage-deflate; client_no_context_takeover; server_no_context_takeover";

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Extension {
    pub(crate) name: String,
    pub(crate) params: Vec<(String, Option<String>)>,
}

/// Parses every `Sec-WebSocket-Extensions` header in `headers`.
pub(crate) fn parse_all(headers: &HeaderMap) -> Result<Vec<Extension>> {
    let mut extensions = Vec::new();
    for value in headers.get_all("sec-websocket-extensions") {
        let raw = value
            .to_str()
            .map_err(|_| Error::new_extension("extension header is not ascii"))?;
        parse_list(raw, &mut extensions)?;
    }
    Ok(extensions)
}

fn parse_list(raw: &str, out: &mut Vec<Extension>) -> Result<()> {
    for item in split_unquoted(raw, ',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let mut parts = split_unquoted(item, ';').into_iter();
        let name = parts
            .next()
            .map(str::trim)
            .filter(|name| headers::is_token(name.as_bytes()))
            .ok_or_else(|| Error::new_extension("invalid extension name"))?;

        let mut params = Vec::new();
        for param in parts {
            let param = param.trim();
            if param.is_empty() {
                return Err(Error::new_extension("empty extension parameter"));
            }
            match param.split_once('=') {
                Some((key, value)) => {
                    let key = key.trim();
                    if !headers::is_token(key.as_bytes()) {
                        return Err(Error::new_extension("invalid parameter name"));
                    }
                    params.push((key.to_ascii_lowercase(), Some(unquote(value.trim())?)));
                }
                None => {
                    if !headers::is_token(param.as_bytes()) {
                        return Err(Error::new_extension("invalid parameter name"));
                    }
                    params.push((param.to_ascii_lowercase(), None));
                }
            }
        }
        out.push(Extension {
            name: name.to_ascii_lowercase(),
            params,
        });
    }
    Ok(())
}

/// Splits on `sep` outside of quoted-strings.
fn split_unquoted(raw: &str, sep: char) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    let mut escaped = false;
    for (at, ch) in raw.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            c if c == sep && !quoted => {
                out.push(&raw[start..at]);
                start = at + ch.len_utf8();
            }
            _ => {}
        }
    }
    out.push(&raw[start..]);
    out
}

/// Resolves a token or RFC 7230 quoted-string to its value.
fn unquote(raw: &str) -> Result<String> {
    if !raw.starts_with('"') {
        if !headers::is_token(raw.as_bytes()) {
            return Err(Error::new_extension("parameter value is not a token"));
        }
        return Ok(raw.to_owned());
    }
    if raw.len() < 2 || !raw.ends_with('"') {
        return Err(Error::new_extension("unterminated quoted-string"));
    }
    let inner = &raw[1..raw.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut escaped = false;
    for ch in inner.chars() {
        if escaped {
            out.push(ch);
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else if ch == '"' {
            return Err(Error::new_extension("bare quote inside quoted-string"));
        } else {
            out.push(ch);
        }
    }
    if escaped {
        return Err(Error::new_extension("dangling escape in quoted-string"));
    }
    Ok(out)
}

/// Validates the server's acceptance of our permessage-deflate offer.
///
/// Returns `Ok(true)` when compression is on. Both no-context-takeover
/// directions must hold, since neither side retains window state.
pub(crate) fn accept_deflate(extensions: &[Extension]) -> Result<bool> {
    let mut accepted = false;
    for ext in extensions {
        if ext.name != PERMESSAGE_DEFLATE {
            return Err(Error::new_extension(format!(
                "server accepted unoffered extension {}",
                ext.name
            )));
        }
        if accepted {
            return Err(Error::new_extension("permessage-deflate accepted twice"));
        }
        let mut server_no_takeover = false;
        for (key, value) in &ext.params {
            match key.as_str() {
                "server_no_context_takeover" => server_no_takeover = true,
                "client_no_context_takeover" => {}
                "server_max_window_bits" => {
                    // any server window decodes with our full-size window
                    let _ = value;
                }
                "client_max_window_bits" => {
                    // we compress with a full 15-bit window; a smaller
                    // demand cannot be honored
                    if let Some(bits) = value {
                        if bits != "15" {
                            return Err(Error::new_extension(
                                "server demanded a reduced client window",
                            ));
                        }
                    }
                }
                other => {
                    return Err(Error::new_extension(format!(
                        "unknown permessage-deflate parameter {}",
                        other
                    )));
                }
            }
        }
        if !server_no_takeover {
            return Err(Error::new_extension(
                "server did not accept server_no_context_takeover",
            ));
        }
        accepted = true;
    }
    Ok(accepted)
}
