//! One HTTP/1.1 transaction over an established connection.

use std::future::Future;
use std::io;

use bytes::Bytes;
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

use crate::common::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::headers;
use crate::request::Request;

use super::decode::{self, BodyLength};
use super::encode::{self, RequestTarget};
use super::io::BufferedIo;
use super::parse::{self, ResponseHead};

pub(crate) struct Http1Options {
    pub(crate) max_response_body_bytes: usize,
    pub(crate) max_head_bytes: usize,
}

/// Outcome of one transaction.
#[derive(Debug)]
pub(crate) struct Exchange {
    pub(crate) head: ResponseHead,
    pub(crate) body: Bytes,
    /// Whether the connection may be returned to the pool.
    pub(crate) keep_alive: bool,
}

/// Transaction progress, used by the stale-connection retry decision: a
/// reused connection that failed before any response byte arrived is safe to
/// retry for idempotent methods.
#[derive(Debug, Default)]
pub(crate) struct Progress {
    pub(crate) response_started: bool,
}

async fn io_op<T, F>(cancel: &CancelToken, fut: F) -> Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    tokio::select! {
        res = fut => res.map_err(Error::new_io),
        _ = cancel.canceled() => Err(cancel.error()),
    }
}

/// Serializes the request, writes it, and reads back one materialized
/// response. Informational heads (1xx other than 101) are discarded.
pub(crate) async fn send_request<T>(
    io: &mut BufferedIo<T>,
    req: &Request,
    target: RequestTarget,
    options: &Http1Options,
    cancel: &CancelToken,
    progress: &mut Progress,
) -> Result<Exchange>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    // Validation happens before any byte hits the wire.
    let encoded = encode::encode_request(req, target)?;

    let mut wire = encoded.head;
    encode::encode_body(encoded.plan, req.body(), &mut wire);
    trace!("writing {} request bytes", wire.len());
    io_op(cancel, io.write_all(&wire)).await?;
    io_op(cancel, io.flush()).await?;

    let head = loop {
        let head = read_head_tracking(io, options.max_head_bytes, cancel, progress).await?;
        if head.status.is_informational() && head.status != StatusCode::SWITCHING_PROTOCOLS {
            debug!("discarding informational response {}", head.status);
            continue;
        }
        break head;
    };

    let body_len = decode::body_length(&head, req.method())?;
    let mut head = head;
    let body = tokio::select! {
        res = decode::read_body(io, body_len, options.max_response_body_bytes, &mut head.headers) => res?,
        _ = cancel.canceled() => return Err(cancel.error()),
    };

    let keep_alive = head.version == http::Version::HTTP_11
        && !headers::connection_close(&head.headers)
        && !headers::connection_close(req.headers())
        && body_len != BodyLength::CloseDelimited;

    Ok(Exchange {
        head,
        body,
        keep_alive,
    })
}

async fn read_head_tracking<T>(
    io: &mut BufferedIo<T>,
    max_bytes: usize,
    cancel: &CancelToken,
    progress: &mut Progress,
) -> Result<ResponseHead>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    if io.has_buffered_input() {
        progress.response_started = true;
    }
    let head = tokio::select! {
        res = parse::read_head(io, max_bytes) => res,
        _ = cancel.canceled() => return Err(cancel.error()),
    };
    if io.has_buffered_input() || head.is_ok() {
        progress.response_started = true;
    }
    head
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn options() -> Http1Options {
        Http1Options {
            max_response_body_bytes: 1024 * 1024,
            max_head_bytes: 16 * 1024,
        }
    }

    fn get(uri: &str) -> Request {
        Request::builder(Method::GET, uri.parse().unwrap())
            .build()
            .unwrap()
    }

    async fn exchange(req: Request, reply: &'static [u8]) -> Result<Exchange> {
        let (client, mut server) = tokio::io::duplex(16 * 1024);
        tokio::spawn(async move {
            let mut sink = vec![0u8; 4096];
            let _ = server.read(&mut sink).await;
            let _ = server.write_all(reply).await;
        });
        let mut io = BufferedIo::new(client);
        let cancel = CancelToken::new();
        let mut progress = Progress::default();
        send_request(
            &mut io,
            &req,
            RequestTarget::Origin,
            &options(),
            &cancel,
            &mut progress,
        )
        .await
    }

    #[tokio::test]
    async fn chunked_response() {
        let exchange = exchange(
            get("http://example.com/"),
            b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
        )
        .await
        .unwrap();
        assert_eq!(exchange.head.status, StatusCode::OK);
        assert_eq!(&exchange.body[..], b"hello");
        assert!(exchange.keep_alive);
    }

    #[tokio::test]
    async fn informational_head_skipped() {
        let exchange = exchange(
            get("http://example.com/"),
            b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 204 No Content\r\n\r\n",
        )
        .await
        .unwrap();
        assert_eq!(exchange.head.status, StatusCode::NO_CONTENT);
        assert!(exchange.body.is_empty());
    }

    #[tokio::test]
    async fn smuggling_guard_writes_nothing() {
        let mut headers = http::HeaderMap::new();
        headers.append(
            http::header::CONTENT_LENGTH,
            http::HeaderValue::from_static("5"),
        );
        headers.append(
            http::header::CONTENT_LENGTH,
            http::HeaderValue::from_static("6"),
        );
        let req = Request::builder(Method::POST, "http://example.com/".parse().unwrap())
            .headers(headers)
            .body("hello")
            .build()
            .unwrap();

        let (client, server) = tokio::io::duplex(4096);
        let mut io = BufferedIo::new(client);
        let cancel = CancelToken::new();
        let mut progress = Progress::default();
        let err = send_request(
            &mut io,
            &req,
            RequestTarget::Origin,
            &options(),
            &cancel,
            &mut progress,
        )
        .await
        .unwrap_err();
        assert!(err.is_invalid_request());

        // Nothing left the client: the server side must read zero bytes.
        drop(io);
        let mut server = server;
        let mut sink = Vec::new();
        server.read_to_end(&mut sink).await.unwrap();
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn head_never_reads_a_body() {
        let req = Request::builder(Method::HEAD, "http://example.com/".parse().unwrap())
            .build()
            .unwrap();
        let exchange = exchange(req, b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(exchange.head.status, StatusCode::OK);
        assert!(exchange.body.is_empty());
        assert!(exchange.keep_alive);
    }

    #[tokio::test]
    async fn connection_close_disables_keep_alive() {
        let exchange = exchange(
            get("http://example.com/"),
            b"HTTP/1.1 200 OK\r\nconnection: close\r\ncontent-length: 0\r\n\r\n",
        )
        .await
        .unwrap();
        assert!(!exchange.keep_alive);
    }
}
