//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;

use http::StatusCode;

/// Result type often returned from methods that can have turbine `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur handling HTTP or WebSocket traffic.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
    status: Option<StatusCode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    /// Connect or socket level failure (DNS, TCP, TLS alert, framing).
    Network,
    /// A locally-scoped deadline fired.
    Timeout,
    /// The peer answered with an HTTP error status.
    Http,
    /// Certificate chain, hostname or validity failure.
    Certificate,
    /// The caller's cancellation token fired.
    Canceled,
    /// The request was rejected before any byte hit the wire.
    InvalidRequest,
    /// Anything that does not fit the taxonomy.
    Unknown,

    /// WebSocket peer violated RFC 6455 or a negotiated extension.
    Protocol,
    /// A single frame exceeded the configured limit.
    FrameTooLarge,
    /// A reassembled message exceeded the configured limit.
    MessageTooLarge,
    /// Deflate of an outbound message failed.
    Compression,
    /// Inflate of an inbound message failed or exceeded its cap.
    Decompression,
    /// The peer did not answer a ping in time.
    PongTimeout,
    /// The connection died without a close handshake.
    AbnormalClosure,
    /// A payload could not be serialized for the wire.
    Serialization,
    /// The proxy demanded credentials we could not satisfy.
    ProxyAuthenticationRequired,
    /// TCP to the proxy itself failed.
    ProxyConnectionFailed,
    /// The CONNECT exchange failed.
    ProxyTunnelFailed,
    /// The peer accepted an extension we never offered, or mangled one.
    ExtensionNegotiationFailed,
}

// Sentinel type to indicate the error was caused by a timeout.
#[derive(Debug)]
pub(crate) struct TimedOut;

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl {
                kind,
                cause: None,
                status: None,
            }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn with_status(mut self, status: StatusCode) -> Error {
        self.inner.status = Some(status);
        self
    }

    pub(crate) fn kind(&self) -> Kind {
        self.inner.kind
    }

    /// The HTTP status attached to this error, if any.
    pub fn status(&self) -> Option<StatusCode> {
        self.inner.status
    }

    /// Returns true if a retry of the same request could plausibly succeed.
    ///
    /// Network failures, timeouts, and 5xx statuses are retryable; everything
    /// else is not.
    pub fn retryable(&self) -> bool {
        match self.inner.kind {
            Kind::Network | Kind::Timeout => true,
            Kind::Http => self
                .inner
                .status
                .map(|s| s.is_server_error())
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Returns true if this was a connect or socket level failure.
    pub fn is_network(&self) -> bool {
        matches!(self.inner.kind, Kind::Network)
    }

    /// Returns true if this error was caused by a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::Timeout) || self.find_source::<TimedOut>().is_some()
    }

    /// Returns true if the peer answered with an error status.
    pub fn is_http(&self) -> bool {
        matches!(self.inner.kind, Kind::Http)
    }

    /// Returns true if certificate validation failed.
    pub fn is_certificate(&self) -> bool {
        matches!(self.inner.kind, Kind::Certificate)
    }

    /// Returns true if the caller's cancellation token fired.
    pub fn is_canceled(&self) -> bool {
        matches!(self.inner.kind, Kind::Canceled)
    }

    /// Returns true if the request was rejected before reaching the wire.
    pub fn is_invalid_request(&self) -> bool {
        matches!(self.inner.kind, Kind::InvalidRequest)
    }

    /// Returns true if a WebSocket peer violated the protocol.
    pub fn is_protocol(&self) -> bool {
        matches!(self.inner.kind, Kind::Protocol)
    }

    /// Returns true if a message or frame limit was exceeded.
    pub fn is_too_large(&self) -> bool {
        matches!(self.inner.kind, Kind::FrameTooLarge | Kind::MessageTooLarge)
    }

    /// Consumes the error, returning its cause.
    pub fn into_cause(self) -> Option<Box<dyn StdError + Send + Sync>> {
        self.inner.cause
    }

    pub(crate) fn find_source<E: StdError + 'static>(&self) -> Option<&E> {
        let mut cause = self.source();
        while let Some(err) = cause {
            if let Some(typed) = err.downcast_ref() {
                return Some(typed);
            }
            cause = err.source();
        }
        None
    }

    // public constructors, for plugins, interceptors and middleware that
    // need to surface their own failures through the taxonomy

    /// An error that fits nowhere else in the taxonomy.
    pub fn unknown<C: Into<Box<dyn StdError + Send + Sync>>>(cause: C) -> Error {
        Error::new(Kind::Unknown).with(cause)
    }

    /// A request rejected before reaching the wire.
    pub fn invalid_request<C: Into<Box<dyn StdError + Send + Sync>>>(cause: C) -> Error {
        Error::new(Kind::InvalidRequest).with(cause)
    }

    /// A payload that could not be serialized for the wire.
    pub fn serialization<C: Into<Box<dyn StdError + Send + Sync>>>(cause: C) -> Error {
        Error::new(Kind::Serialization).with(cause)
    }

    // crate-internal constructors

    pub(crate) fn new_network<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Network).with(cause)
    }

    pub(crate) fn new_io(cause: std::io::Error) -> Error {
        Error::new(Kind::Network).with(cause)
    }

    pub(crate) fn new_timeout() -> Error {
        Error::new(Kind::Timeout).with(TimedOut)
    }

    pub(crate) fn new_http(status: StatusCode) -> Error {
        Error::new(Kind::Http).with_status(status)
    }

    pub(crate) fn new_certificate<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Certificate).with(cause)
    }

    pub(crate) fn new_canceled() -> Error {
        Error::new(Kind::Canceled)
    }

    pub(crate) fn new_invalid_request<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::InvalidRequest).with(cause)
    }

    pub(crate) fn new_unknown<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Unknown).with(cause)
    }

    pub(crate) fn new_protocol<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Protocol).with(cause)
    }

    pub(crate) fn new_frame_too_large() -> Error {
        Error::new(Kind::FrameTooLarge)
    }

    pub(crate) fn new_message_too_large() -> Error {
        Error::new(Kind::MessageTooLarge)
    }

    pub(crate) fn new_compression<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Compression).with(cause)
    }

    pub(crate) fn new_decompression<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Decompression).with(cause)
    }

    pub(crate) fn new_pong_timeout() -> Error {
        Error::new(Kind::PongTimeout)
    }

    pub(crate) fn new_abnormal_closure<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::AbnormalClosure).with(cause)
    }

    pub(crate) fn new_proxy_auth() -> Error {
        Error::new(Kind::ProxyAuthenticationRequired)
    }

    pub(crate) fn new_proxy_connect<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::ProxyConnectionFailed).with(cause)
    }

    pub(crate) fn new_proxy_tunnel<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::ProxyTunnelFailed).with(cause)
    }

    pub(crate) fn new_extension<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::ExtensionNegotiationFailed).with(cause)
    }

    /// The error's standalone message, without the message from the source.
    pub fn message(&self) -> impl fmt::Display + '_ {
        self.description()
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Network => "network error",
            Kind::Timeout => "operation timed out",
            Kind::Http => "http error status",
            Kind::Certificate => "certificate verification failed",
            Kind::Canceled => "operation was canceled",
            Kind::InvalidRequest => "invalid request",
            Kind::Unknown => "unknown error",
            Kind::Protocol => "websocket protocol violation",
            Kind::FrameTooLarge => "frame exceeds configured limit",
            Kind::MessageTooLarge => "message exceeds configured limit",
            Kind::Compression => "message compression failed",
            Kind::Decompression => "message decompression failed",
            Kind::PongTimeout => "no pong received in time",
            Kind::AbnormalClosure => "connection closed abnormally",
            Kind::Serialization => "payload serialization failed",
            Kind::ProxyAuthenticationRequired => "proxy authentication required",
            Kind::ProxyConnectionFailed => "could not reach proxy",
            Kind::ProxyTunnelFailed => "proxy tunnel failed",
            Kind::ExtensionNegotiationFailed => "extension negotiation failed",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("turbine::Error");
        f.field(&self.inner.kind);
        if let Some(status) = self.inner.status {
            f.field(&status);
        }
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(status) = self.inner.status {
            write!(f, "{} ({})", self.description(), status)?;
        } else {
            f.write_str(self.description())?;
        }
        if let Some(ref cause) = self.inner.cause {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

#[doc(hidden)]
trait AssertSendSync: Send + Sync + 'static {}
#[doc(hidden)]
impl AssertSendSync for Error {}

// ===== impl TimedOut =====

impl fmt::Display for TimedOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("operation timed out")
    }
}

impl StdError for TimedOut {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn error_size_of() {
        assert_eq!(mem::size_of::<Error>(), mem::size_of::<usize>());
    }

    #[test]
    fn retryable_matrix() {
        assert!(Error::new_timeout().retryable());
        assert!(Error::new_io(std::io::Error::new(std::io::ErrorKind::Other, "reset")).retryable());
        assert!(Error::new_http(StatusCode::BAD_GATEWAY).retryable());
        assert!(!Error::new_http(StatusCode::NOT_FOUND).retryable());
        assert!(!Error::new_canceled().retryable());
        assert!(!Error::new_invalid_request("bad header").retryable());
    }

    #[test]
    fn status_attached() {
        let err = Error::new_http(StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(err.is_http());
    }

    #[test]
    fn timeout_found_in_cause_chain() {
        let inner = Error::new_timeout();
        let outer = Error::new(Kind::Network).with(inner);
        assert!(outer.is_timeout());
    }
}
