//! HTTP/1.1 request serializer.
//!
//! Framing is computed and validated before any byte is staged: a request
//! with conflicting `Content-Length` values, or both `Content-Length` and
//! `Transfer-Encoding`, is rejected without touching the wire.

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{Method, Uri};

use crate::error::{Error, Result};
use crate::headers;
use crate::request::Request;

/// Which request-target form goes on the request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestTarget {
    /// `/path?query` — the normal case.
    Origin,
    /// `scheme://authority/path?query` — plaintext requests through a proxy.
    Absolute,
}

/// Body framing decided for this request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyPlan {
    None,
    Length(u64),
    Chunked,
}

#[derive(Debug)]
pub(crate) struct EncodedRequest {
    pub(crate) head: BytesMut,
    pub(crate) plan: BodyPlan,
}

pub(crate) fn encode_request(req: &Request, target: RequestTarget) -> Result<EncodedRequest> {
    let plan = compute_framing(req)?;

    for (name, value) in req.headers() {
        if !headers::is_token(name.as_str().as_bytes()) {
            return Err(Error::new_invalid_request(format!(
                "invalid header name {:?}",
                name
            )));
        }
        if !headers::value_is_wire_safe(value) {
            return Err(Error::new_invalid_request(
                "header value contains CR, LF or NUL",
            ));
        }
    }

    let mut head = BytesMut::with_capacity(256);

    // request line
    head.put_slice(req.method().as_str().as_bytes());
    head.put_u8(b' ');
    match target {
        RequestTarget::Origin => {
            let path = req
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/");
            head.put_slice(path.as_bytes());
        }
        RequestTarget::Absolute => {
            put_absolute_target(req.uri(), &mut head);
        }
    }
    head.put_slice(b" HTTP/1.1\r\n");

    // Host goes first unless the caller supplied one.
    if !req.headers().contains_key(HOST) {
        head.put_slice(b"host: ");
        put_host(req, &mut head);
        head.put_slice(b"\r\n");
    }

    // One line per value; framing headers are emitted canonically below.
    for (name, value) in req.headers() {
        if *name == CONTENT_LENGTH || *name == TRANSFER_ENCODING {
            continue;
        }
        head.put_slice(name.as_str().as_bytes());
        head.put_slice(b": ");
        head.put_slice(value.as_bytes());
        head.put_slice(b"\r\n");
    }

    match plan {
        BodyPlan::None => {}
        BodyPlan::Length(len) => {
            let mut buf = itoa::Buffer::new();
            head.put_slice(b"content-length: ");
            head.put_slice(buf.format(len).as_bytes());
            head.put_slice(b"\r\n");
        }
        BodyPlan::Chunked => {
            head.put_slice(b"transfer-encoding: chunked\r\n");
        }
    }

    head.put_slice(b"\r\n");
    Ok(EncodedRequest { head, plan })
}

/// Writes the body per the computed plan into `out`.
pub(crate) fn encode_body(plan: BodyPlan, body: Option<&Bytes>, out: &mut BytesMut) {
    match plan {
        BodyPlan::None => {}
        BodyPlan::Length(_) => {
            if let Some(body) = body {
                out.extend_from_slice(body);
            }
        }
        BodyPlan::Chunked => {
            if let Some(body) = body {
                if !body.is_empty() {
                    let size = format!("{:x}\r\n", body.len());
                    out.extend_from_slice(size.as_bytes());
                    out.extend_from_slice(body);
                    out.extend_from_slice(b"\r\n");
                }
            }
            out.extend_from_slice(b"0\r\n\r\n");
        }
    }
}

/// Framing validation without serialization, for refusing a request before
/// any connection work happens.
pub(crate) fn validate_framing(req: &Request) -> Result<()> {
    compute_framing(req).map(|_| ())
}

fn compute_framing(req: &Request) -> Result<BodyPlan> {
    let declared_len = headers::content_length_parse_all(req.headers())
        .map_err(|()| Error::new_invalid_request("conflicting content-length values"))?;
    let te_present = req.headers().contains_key(TRANSFER_ENCODING);

    if te_present && declared_len.is_some() {
        return Err(Error::new_invalid_request(
            "both content-length and transfer-encoding present",
        ));
    }
    if te_present && !headers::transfer_encoding_is_chunked(req.headers()) {
        return Err(Error::new_invalid_request(
            "transfer-encoding must end with chunked",
        ));
    }

    let body_len = req.body().map(|b| b.len() as u64);
    if te_present {
        return Ok(BodyPlan::Chunked);
    }
    match (declared_len, body_len) {
        (Some(declared), Some(actual)) if declared != actual => Err(Error::new_invalid_request(
            "content-length does not match body size",
        )),
        (Some(declared), None) if declared != 0 => Err(Error::new_invalid_request(
            "content-length declared without a body",
        )),
        (Some(n), _) => Ok(if n == 0 { BodyPlan::None } else { BodyPlan::Length(n) }),
        (None, Some(actual)) => Ok(BodyPlan::Length(actual)),
        (None, None) => {
            // POST/PUT/PATCH advertise an explicit zero; bodyless methods
            // send no framing header at all.
            if matches!(*req.method(), Method::POST | Method::PUT | Method::PATCH) {
                Ok(BodyPlan::Length(0))
            } else {
                Ok(BodyPlan::None)
            }
        }
    }
}

/// Authority without userinfo, bracketed IPv6, default port omitted.
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
    let default_port = if req.is_tls() { 443 } else { 80 };
    if let Some(port) = req.uri().port_u16() {
        if port != default_port {
            let mut buf = itoa::Buffer::new();
            head.put_u8(b':');
            head.put_slice(buf.format(port).as_bytes());
        }
    }
}

fn put_absolute_target(uri: &Uri, head: &mut BytesMut) {
    head.put_slice(uri.scheme_str().expect("validated at build").as_bytes());
    head.put_slice(b"://");
    let authority = uri.authority().expect("validated at build").as_str();
    // strip userinfo if any
    let authority = authority.rsplit('@').next().unwrap_or(authority);
    head.put_slice(authority.as_bytes());
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    head.put_slice(path.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{HeaderName, HeaderValue};
    use http::Method;

    fn request(method: Method, uri: &str) -> crate::request::Builder {
        Request::builder(method, uri.parse().unwrap())
    }

    fn head_str(enc: &EncodedRequest) -> &str {
        std::str::from_utf8(&enc.head).unwrap()
    }

    #[test]
    fn get_request_line_and_host() {
        let req = request(Method::GET, "http://example.com/a/b?c=1")
            .build()
            .unwrap();
        let enc = encode_request(&req, RequestTarget::Origin).unwrap();
        let head = head_str(&enc);
        assert!(head.starts_with("GET /a/b?c=1 HTTP/1.1\r\n"));
        assert!(head.contains("host: example.com\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
        assert_eq!(enc.plan, BodyPlan::None);
    }

    #[test]
    fn non_default_port_kept_in_host() {
        let req = request(Method::GET, "http://example.com:8080/")
            .build()
            .unwrap();
        let enc = encode_request(&req, RequestTarget::Origin).unwrap();
        assert!(head_str(&enc).contains("host: example.com:8080\r\n"));
    }

    #[test]
    fn ipv6_host_is_bracketed() {
        let req = request(Method::GET, "http://[2001:db8::1]:8080/")
            .build()
            .unwrap();
        let enc = encode_request(&req, RequestTarget::Origin).unwrap();
        assert!(head_str(&enc).contains("host: [2001:db8::1]:8080\r\n"));
    }

    #[test]
    fn body_gets_content_length() {
        let req = request(Method::POST, "http://example.com/")
            .body("hello")
            .build()
            .unwrap();
        let enc = encode_request(&req, RequestTarget::Origin).unwrap();
        assert!(head_str(&enc).contains("content-length: 5\r\n"));
        assert_eq!(enc.plan, BodyPlan::Length(5));
    }

    #[test]
    fn conflicting_content_lengths_write_nothing() {
        let mut headers = http::HeaderMap::new();
        headers.append(CONTENT_LENGTH, HeaderValue::from_static("5"));
        headers.append(CONTENT_LENGTH, HeaderValue::from_static("6"));
        let req = request(Method::POST, "http://example.com/")
            .headers(headers)
            .body("hello")
            .build()
            .unwrap();
        let err = encode_request(&req, RequestTarget::Origin).unwrap_err();
        assert!(err.is_invalid_request());
    }

    #[test]
    fn content_length_plus_chunked_rejected() {
        let mut headers = http::HeaderMap::new();
        headers.append(CONTENT_LENGTH, HeaderValue::from_static("5"));
        headers.append(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        let req = request(Method::POST, "http://example.com/")
            .headers(headers)
            .body("hello")
            .build()
            .unwrap();
        let err = encode_request(&req, RequestTarget::Origin).unwrap_err();
        assert!(err.is_invalid_request());
    }

    #[test]
    fn multi_value_headers_one_line_each() {
        let name = HeaderName::from_static("x-many");
        let mut headers = http::HeaderMap::new();
        headers.append(name.clone(), HeaderValue::from_static("one"));
        headers.append(name, HeaderValue::from_static("two"));
        let req = request(Method::GET, "http://example.com/")
            .headers(headers)
            .build()
            .unwrap();
        let enc = encode_request(&req, RequestTarget::Origin).unwrap();
        let head = head_str(&enc);
        assert!(head.contains("x-many: one\r\n"));
        assert!(head.contains("x-many: two\r\n"));
    }

    #[test]
    fn absolute_target_for_proxy() {
        let req = request(Method::GET, "http://example.com:8080/x?y=1")
            .build()
            .unwrap();
        let enc = encode_request(&req, RequestTarget::Absolute).unwrap();
        assert!(head_str(&enc).starts_with("GET http://example.com:8080/x?y=1 HTTP/1.1\r\n"));
    }

    #[test]
    fn chunked_body_encoding() {
        let mut out = BytesMut::new();
        encode_body(BodyPlan::Chunked, Some(&Bytes::from_static(b"hello")), &mut out);
        assert_eq!(&out[..], b"5\r\nhello\r\n0\r\n\r\n");

        let mut out = BytesMut::new();
        encode_body(BodyPlan::Chunked, None, &mut out);
        assert_eq!(&out[..], b"0\r\n\r\n");
    }
}
