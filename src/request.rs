//! Client request type.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use http::uri::Scheme;
use http::{HeaderMap, Method, Uri};

use crate::error::{Error, Result};
use crate::headers;

/// An immutable, prepared request.
///
/// Mutation is modeled as "produce a modified copy": [`Request::to_builder`]
/// yields a builder seeded with this request's parts.
#[derive(Clone)]
pub struct Request {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Option<Bytes>,
    timeout: Option<Duration>,
    metadata: HashMap<String, String>,
}

impl Request {
    /// Starts building a request for `method` and `uri`.
    pub fn builder(method: Method, uri: Uri) -> Builder {
        Builder {
            method,
            uri,
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
            metadata: HashMap::new(),
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The body bytes, if any. Size is always known up front.
    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Per-attempt timeout; `None` means no timeout.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Reads one metadata annotation. Metadata never reaches the wire.
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(|s| s.as_str())
    }

    /// Seeds a builder with a copy of this request's parts.
    pub fn to_builder(&self) -> Builder {
        Builder {
            method: self.method.clone(),
            uri: self.uri.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
            timeout: self.timeout,
            metadata: self.metadata.clone(),
        }
    }

    /// GET, HEAD, OPTIONS, PUT and DELETE may be retried; POST and PATCH not.
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self.method,
            Method::GET | Method::HEAD | Method::OPTIONS | Method::PUT | Method::DELETE
        )
    }

    pub(crate) fn scheme(&self) -> &Scheme {
        // validated at build time
        self.uri.scheme().expect("request uri missing scheme")
    }

    pub(crate) fn is_tls(&self) -> bool {
        let s = self.scheme().as_str();
        s == "https" || s == "wss"
    }

    pub(crate) fn port(&self) -> u16 {
        self.uri
            .port_u16()
            .unwrap_or(if self.is_tls() { 443 } else { 80 })
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("headers", &self.headers)
            .field("body_len", &self.body.as_ref().map(Bytes::len))
            .finish()
    }
}

/// Builder for [`Request`].
#[derive(Debug)]
pub struct Builder {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Option<Bytes>,
    timeout: Option<Duration>,
    metadata: HashMap<String, String>,
}

impl Builder {
    /// Appends a header, preserving any existing values for the same name.
    pub fn header<V>(mut self, name: http::header::HeaderName, value: V) -> Builder
    where
        V: Into<http::HeaderValue>,
    {
        self.headers.append(name, value.into());
        self
    }

    /// Replaces the whole header map. The map is cloned defensively at
    /// `build`, so later caller-side edits have no effect.
    pub fn headers(mut self, headers: HeaderMap) -> Builder {
        self.headers = headers;
        self
    }

    pub fn body<B: Into<Bytes>>(mut self, body: B) -> Builder {
        self.body = Some(body.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Builder {
        self.timeout = Some(timeout);
        self
    }

    /// Attaches a metadata annotation for interceptors and plugins.
    pub fn metadata<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Builder {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Validates and freezes the request.
    pub fn build(self) -> Result<Request> {
        match self.method {
            Method::GET
            | Method::HEAD
            | Method::OPTIONS
            | Method::POST
            | Method::PUT
            | Method::DELETE
            | Method::PATCH => {}
            ref other => {
                return Err(Error::new_invalid_request(format!(
                    "unsupported method {}",
                    other
                )))
            }
        }

        match self.uri.scheme_str() {
            Some("http" | "https" | "ws" | "wss") => {}
            Some(other) => {
                return Err(Error::new_invalid_request(format!(
                    "unsupported scheme {}",
                    other
                )))
            }
            None => return Err(Error::new_invalid_request("request uri must be absolute")),
        }

        if self.uri.host().is_none() {
            return Err(Error::new_invalid_request("request uri missing host"));
        }

        for value in self.headers.values() {
            if !headers::value_is_wire_safe(value) {
                return Err(Error::new_invalid_request(
                    "header value contains CR, LF or NUL",
                ));
            }
        }

        Ok(Request {
            method: self.method,
            uri: self.uri,
            headers: self.headers.clone(),
            body: self.body,
            timeout: self.timeout,
            metadata: self.metadata,
        })
    }
}
