//! Client response type.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};

use crate::error::Error;
use crate::request::Request;

/// A fully materialized response.
///
/// Bodies are buffered in memory up to the configured maximum; there is no
/// streaming surface.
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    elapsed: Duration,
    request: Arc<Request>,
    error: Option<Error>,
}

impl Response {
    pub(crate) fn new(
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        elapsed: Duration,
        request: Arc<Request>,
    ) -> Response {
        Response {
            status,
            headers,
            body,
            elapsed,
            request,
            error: None,
        }
    }

    /// Synthesizes an HTTP-shaped response from a terminal error, used by the
    /// `ConvertToResponse` interceptor failure policy.
    pub(crate) fn from_error(error: Error, elapsed: Duration, request: Arc<Request>) -> Response {
        let status = error
            .status()
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Response {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            elapsed,
            request,
            error: Some(error),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The response body; may be empty.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Wall-clock time from send dispatch to completion.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// The request that produced this response.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// The terminal error mapped into this response, if any.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .field("elapsed", &self.elapsed)
            .finish()
    }
}
