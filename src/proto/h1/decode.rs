//! HTTP/1.1 response body decoder.

use bytes::{Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::trace;

use crate::error::{Error, Result};
use crate::headers;

use super::io::BufferedIo;
use super::parse::ResponseHead;

/// Maximum bytes of chunk-size line, extensions included.
const CHUNK_SIZE_LINE_LIMIT: usize = 1024;

/// Maximum accumulated trailer bytes.
const TRAILER_LIMIT: usize = 16 * 1024;

/// How the body of a response is framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyLength {
    None,
    Known(u64),
    Chunked,
    CloseDelimited,
}

/// Decides framing per RFC 9112 §6: chunked wins, then Content-Length, then
/// read-until-close. HEAD and bodyless statuses never read a body.
pub(crate) fn body_length(head: &ResponseHead, method: &Method) -> Result<BodyLength> {
    if method == Method::HEAD {
        return Ok(BodyLength::None);
    }
    if head.status.is_informational()
        || head.status == StatusCode::NO_CONTENT
        || head.status == StatusCode::NOT_MODIFIED
    {
        return Ok(BodyLength::None);
    }
    if headers::transfer_encoding_is_chunked(&head.headers) {
        return Ok(BodyLength::Chunked);
    }
    match headers::content_length_parse_all(&head.headers) {
        Ok(Some(len)) => Ok(BodyLength::Known(len)),
        Ok(None) => Ok(BodyLength::CloseDelimited),
        Err(()) => Err(Error::new_network("invalid content-length")),
    }
}

/// Reads the body per `len`, enforcing the decoded-size cap. Chunked
/// trailers are parsed and appended to `trailers`.
pub(crate) async fn read_body<T>(
    io: &mut BufferedIo<T>,
    len: BodyLength,
    max_bytes: usize,
    trailers: &mut HeaderMap,
) -> Result<Bytes>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    match len {
        BodyLength::None => Ok(Bytes::new()),
        BodyLength::Known(n) => {
            if n > max_bytes as u64 {
                return Err(Error::new_network("body too large"));
            }
            let mut out = BytesMut::with_capacity(n as usize);
            let mut remaining = n as usize;
            while remaining > 0 {
                if !io.has_buffered_input() {
                    if io.fill().await.map_err(Error::new_io)? == 0 {
                        return Err(Error::new_network(
                            "connection closed before body completed",
                        ));
                    }
                }
                let taken = io.take(remaining);
                remaining -= taken.len();
                out.extend_from_slice(&taken);
            }
            Ok(out.freeze())
        }
        BodyLength::Chunked => read_chunked(io, max_bytes, trailers).await,
        BodyLength::CloseDelimited => {
            let mut out = BytesMut::new();
            loop {
                if io.has_buffered_input() {
                    let taken = io.take(usize::MAX);
                    if out.len() + taken.len() > max_bytes {
                        return Err(Error::new_network("body too large"));
                    }
                    out.extend_from_slice(&taken);
                }
                if io.fill().await.map_err(Error::new_io)? == 0 {
                    if io.has_buffered_input() {
                        continue;
                    }
                    return Ok(out.freeze());
                }
            }
        }
    }
}

async fn read_chunked<T>(
    io: &mut BufferedIo<T>,
    max_bytes: usize,
    trailers: &mut HeaderMap,
) -> Result<Bytes>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut out = BytesMut::new();
    loop {
        let size_line = read_line(io, CHUNK_SIZE_LINE_LIMIT).await?;
        let size = parse_chunk_size(&size_line)?;
        trace!("chunk size {}", size);

        if size == 0 {
            read_trailers(io, trailers).await?;
            return Ok(out.freeze());
        }
        if out.len() as u64 + size > max_bytes as u64 {
            return Err(Error::new_network("body too large"));
        }

        let mut remaining = size as usize;
        while remaining > 0 {
            if !io.has_buffered_input() {
                if io.fill().await.map_err(Error::new_io)? == 0 {
                    return Err(Error::new_network("connection closed inside a chunk"));
                }
            }
            let taken = io.take(remaining);
            remaining -= taken.len();
            out.extend_from_slice(&taken);
        }

        // chunk data is followed by CRLF
        io.fill_to(2).await.map_err(Error::new_io)?;
        if &io.data()[..2] != b"\r\n" {
            return Err(Error::new_network("missing CRLF after chunk data"));
        }
        io.advance(2);
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64> {
    // extensions after ';' are ignored
    let digits = match line.iter().position(|&b| b == b';') {
        Some(at) => &line[..at],
        None => line,
    };
    let digits = trim_ows(digits);
    if digits.is_empty() {
        return Err(Error::new_network("empty chunk size"));
    }
    let mut size: u64 = 0;
    for &b in digits {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => return Err(Error::new_network("invalid chunk size")),
        };
        size = size
            .checked_mul(16)
            .and_then(|s| s.checked_add(digit as u64))
            .ok_or_else(|| Error::new_network("chunk size overflow"))?;
    }
    Ok(size)
}

async fn read_trailers<T>(io: &mut BufferedIo<T>, trailers: &mut HeaderMap) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut total = 0usize;
    loop {
        let line = read_line(io, TRAILER_LIMIT).await?;
        if line.is_empty() {
            return Ok(());
        }
        total += line.len();
        if total > TRAILER_LIMIT {
            return Err(Error::new_network("trailers too large"));
        }
        let at = line
            .iter()
            .position(|&b| b == b':')
            .ok_or_else(|| Error::new_network("invalid trailer line"))?;
        let name = HeaderName::from_bytes(&line[..at])
            .map_err(|_| Error::new_network("invalid trailer name"))?;
        let value = HeaderValue::from_bytes(trim_ows(&line[at + 1..]))
            .map_err(|_| Error::new_network("invalid trailer value"))?;
        trailers.append(name, value);
    }
}

/// Reads one line, consuming the terminator. The returned slice excludes
/// CRLF.
async fn read_line<T>(io: &mut BufferedIo<T>, limit: usize) -> Result<BytesMut>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        if let Some(at) = io.data().iter().position(|&b| b == b'\n') {
            let mut line = io.take(at + 1);
            line.truncate(at);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            return Ok(line);
        }
        if io.data().len() > limit {
            return Err(Error::new_network("line too long"));
        }
        if io.fill().await.map_err(Error::new_io)? == 0 {
            return Err(Error::new_network("connection closed mid-line"));
        }
    }
}

fn trim_ows(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|&b| b != b' ' && b != b'\t')
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|&b| b != b' ' && b != b'\t')
        .map(|p| p + 1)
        .unwrap_or(start);
    &bytes[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn decode(raw: &'static [u8], len: BodyLength) -> Result<(Bytes, HeaderMap)> {
        let (client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let _ = server.write_all(raw).await;
        });
        let mut io = BufferedIo::new(client);
        let mut trailers = HeaderMap::new();
        let body = read_body(&mut io, len, 1024 * 1024, &mut trailers).await?;
        Ok((body, trailers))
    }

    #[tokio::test]
    async fn chunked_roundtrip() {
        let (body, _) = decode(b"5\r\nhello\r\n0\r\n\r\n", BodyLength::Chunked)
            .await
            .unwrap();
        assert_eq!(&body[..], b"hello");
    }

    #[tokio::test]
    async fn chunked_with_extension_and_trailer() {
        let (body, trailers) = decode(
            b"5;ext=1\r\nhello\r\n0\r\nx-check: ok\r\n\r\n",
            BodyLength::Chunked,
        )
        .await
        .unwrap();
        assert_eq!(&body[..], b"hello");
        assert_eq!(trailers["x-check"], "ok");
    }

    #[tokio::test]
    async fn chunked_invalid_size_rejected() {
        let err = decode(b"zz\r\nhello\r\n", BodyLength::Chunked)
            .await
            .unwrap_err();
        assert!(err.is_network());
    }

    #[tokio::test]
    async fn known_length() {
        let (body, _) = decode(b"hello world", BodyLength::Known(11)).await.unwrap();
        assert_eq!(&body[..], b"hello world");
    }

    #[tokio::test]
    async fn close_delimited_reads_to_eof() {
        let (body, _) = decode(b"all of it", BodyLength::CloseDelimited)
            .await
            .unwrap();
        assert_eq!(&body[..], b"all of it");
    }

    #[tokio::test]
    async fn cap_enforced() {
        let (client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let _ = server.write_all(b"ffff\r\n").await;
            let _ = server.write_all(&vec![0u8; 0xffff]).await;
        });
        let mut io = BufferedIo::new(client);
        let mut trailers = HeaderMap::new();
        let err = read_body(&mut io, BodyLength::Chunked, 100, &mut trailers)
            .await
            .unwrap_err();
        assert!(err.is_network());
    }
}
