//! Interceptors: observers layered outside the middleware chain, gated by
//! declared capabilities.

use std::fmt;
use std::sync::Arc;

use crate::common::cancel::CancelToken;
use crate::context::RequestContext;
use crate::error::{Error, Result};
use crate::request::Request;
use crate::response::Response;

/// What an interceptor declared it is allowed to do. The client wraps every
/// interceptor in a guard that rejects undeclared mutations at runtime.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities(u8);

impl Capabilities {
    pub const NONE: Capabilities = Capabilities(0);
    /// See requests flow by.
    pub const OBSERVE_REQUESTS: Capabilities = Capabilities(1 << 0);
    /// See responses and errors without touching them.
    pub const READ_ONLY_MONITORING: Capabilities = Capabilities(1 << 1);
    /// Replace the outgoing request.
    pub const MUTATE_REQUESTS: Capabilities = Capabilities(1 << 2);
    /// Replace the incoming response.
    pub const MUTATE_RESPONSES: Capabilities = Capabilities(1 << 3);
    /// Be consulted when a send fails.
    pub const HANDLE_ERRORS: Capabilities = Capabilities(1 << 4);
    /// Turn an error into a synthesized response.
    pub const SHORT_CIRCUIT: Capabilities = Capabilities(1 << 5);

    pub const fn union(self, other: Capabilities) -> Capabilities {
        Capabilities(self.0 | other.0)
    }

    pub const fn contains(self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Capabilities {
    type Output = Capabilities;

    fn bitor(self, other: Capabilities) -> Capabilities {
        self.union(other)
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for (bit, name) in [
            (Capabilities::OBSERVE_REQUESTS, "ObserveRequests"),
            (Capabilities::READ_ONLY_MONITORING, "ReadOnlyMonitoring"),
            (Capabilities::MUTATE_REQUESTS, "MutateRequests"),
            (Capabilities::MUTATE_RESPONSES, "MutateResponses"),
            (Capabilities::HANDLE_ERRORS, "HandleErrors"),
            (Capabilities::SHORT_CIRCUIT, "ShortCircuit"),
        ] {
            if self.contains(bit) {
                list.entry(&name);
            }
        }
        list.finish()
    }
}

/// Hooks around the whole pipeline. Requests are seen in registration
/// order, responses and errors in reverse registration order.
pub trait Interceptor: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Observe or replace the outgoing request. Returning `Some` requires
    /// `MUTATE_REQUESTS`. Cancelling the token here aborts the send before
    /// the transport runs.
    fn on_request(
        &self,
        req: &Request,
        ctx: &RequestContext,
        cancel: &CancelToken,
    ) -> Result<Option<Request>> {
        let _ = (req, ctx, cancel);
        Ok(None)
    }

    /// Observe or replace the response. Returning `Some` requires
    /// `MUTATE_RESPONSES`.
    fn on_response(&self, resp: &Response, ctx: &RequestContext) -> Result<Option<Response>> {
        let _ = (resp, ctx);
        Ok(None)
    }

    /// Observe a terminal error. Returning `Some` synthesizes a response in
    /// its place and requires `SHORT_CIRCUIT`.
    fn on_error(&self, err: &Error, ctx: &RequestContext) -> Option<Response> {
        let _ = (err, ctx);
        None
    }
}

/// The capability-enforcing proxy the client wraps registrations in.
#[derive(Clone)]
pub(crate) struct Guarded {
    inner: Arc<dyn Interceptor>,
    caps: Capabilities,
}

impl Guarded {
    pub(crate) fn new(inner: Arc<dyn Interceptor>) -> Guarded {
        let caps = inner.capabilities();
        Guarded { inner, caps }
    }

    pub(crate) fn name(&self) -> &str {
        self.inner.name()
    }

    pub(crate) fn on_request(
        &self,
        req: &Request,
        ctx: &RequestContext,
        cancel: &CancelToken,
    ) -> Result<Option<Request>> {
        let replacement = self.inner.on_request(req, ctx, cancel)?;
        if replacement.is_some() && !self.caps.contains(Capabilities::MUTATE_REQUESTS) {
            return Err(violation(self.name(), "replace the request"));
        }
        Ok(replacement)
    }

    pub(crate) fn on_response(
        &self,
        resp: &Response,
        ctx: &RequestContext,
    ) -> Result<Option<Response>> {
        let replacement = self.inner.on_response(resp, ctx)?;
        if replacement.is_some() && !self.caps.contains(Capabilities::MUTATE_RESPONSES) {
            return Err(violation(self.name(), "replace the response"));
        }
        Ok(replacement)
    }

    pub(crate) fn on_error(&self, err: &Error, ctx: &RequestContext) -> Result<Option<Response>> {
        if !self.caps.contains(Capabilities::HANDLE_ERRORS) {
            return Ok(None);
        }
        let synthesized = self.inner.on_error(err, ctx);
        if synthesized.is_some() && !self.caps.contains(Capabilities::SHORT_CIRCUIT) {
            return Err(violation(self.name(), "synthesize a response"));
        }
        Ok(synthesized)
    }
}

fn violation(name: &str, what: &str) -> Error {
    Error::new_unknown(format!(
        "interceptor {} tried to {} without declaring the capability",
        name, what
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Method, Uri};

    struct Sneaky;

    impl Interceptor for Sneaky {
        fn name(&self) -> &str {
            "sneaky"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::OBSERVE_REQUESTS
        }

        fn on_request(
            &self,
            req: &Request,
            _ctx: &RequestContext,
            _cancel: &CancelToken,
        ) -> Result<Option<Request>> {
            // tries to mutate with observe-only capabilities
            Ok(Some(req.to_builder().metadata("evil", "yes").build()?))
        }
    }

    #[test]
    fn capability_bits() {
        let caps = Capabilities::OBSERVE_REQUESTS | Capabilities::MUTATE_REQUESTS;
        assert!(caps.contains(Capabilities::OBSERVE_REQUESTS));
        assert!(caps.contains(Capabilities::MUTATE_REQUESTS));
        assert!(!caps.contains(Capabilities::SHORT_CIRCUIT));
    }

    #[test]
    fn undeclared_mutation_rejected() {
        let guarded = Guarded::new(Arc::new(Sneaky));
        let req = Request::builder(Method::GET, Uri::from_static("http://example.com/"))
            .build()
            .unwrap();
        let ctx = RequestContext::new(Arc::new(req.clone()));
        let err = guarded
            .on_request(&req, &ctx, &CancelToken::new())
            .unwrap_err();
        assert!(format!("{}", err).contains("sneaky"));
    }
}
