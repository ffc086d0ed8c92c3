//! Middleware pipeline: a terminal chain ending at the transport.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::debug;

use crate::common::cancel::CancelToken;
use crate::context::RequestContext;
use crate::error::Result;
use crate::request::Request;
use crate::response::Response;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One link in the send pipeline.
///
/// A middleware either forwards through [`Next::run`] — exactly once per
/// pass down the chain — or short-circuits by returning its own response.
/// Retrying middlewares may run `next` once per attempt; the transport
/// rearms the per-attempt timeout on every pass.
pub trait Middleware: Send + Sync + 'static {
    fn handle<'a>(
        &'a self,
        req: Request,
        ctx: &'a Arc<RequestContext>,
        next: Next<'a>,
        cancel: &'a CancelToken,
    ) -> BoxFuture<'a, Result<Response>>;
}

/// The tail of the chain from a middleware's point of view.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    pub(crate) chain: &'a [Arc<dyn Middleware>],
    pub(crate) transport: &'a (dyn Terminal + 'a),
}

impl<'a> Next<'a> {
    /// Runs the rest of the chain and then the transport.
    pub async fn run(
        self,
        req: Request,
        ctx: &Arc<RequestContext>,
        cancel: &CancelToken,
    ) -> Result<Response> {
        match self.chain.split_first() {
            Some((middleware, rest)) => {
                let next = Next {
                    chain: rest,
                    transport: self.transport,
                };
                middleware.handle(req, ctx, next, cancel).await
            }
            None => self.transport.dispatch(req, ctx, cancel).await,
        }
    }
}

/// The terminal transport at the end of every chain.
pub(crate) trait Terminal: Send + Sync {
    fn dispatch<'a>(
        &'a self,
        req: Request,
        ctx: &'a Arc<RequestContext>,
        cancel: &'a CancelToken,
    ) -> BoxFuture<'a, Result<Response>>;
}

/// Retries idempotent requests whose outcome was retryable: a network or
/// timeout failure, or a 5xx response.
pub struct Retry {
    max_retries: u32,
}

impl Retry {
    pub fn new(max_retries: u32) -> Retry {
        Retry { max_retries }
    }
}

impl Default for Retry {
    fn default() -> Retry {
        Retry::new(1)
    }
}

impl Middleware for Retry {
    fn handle<'a>(
        &'a self,
        req: Request,
        ctx: &'a Arc<RequestContext>,
        next: Next<'a>,
        cancel: &'a CancelToken,
    ) -> BoxFuture<'a, Result<Response>> {
        Box::pin(async move {
            let budget = if req.is_idempotent() {
                self.max_retries
            } else {
                0
            };
            let mut attempt = 0u32;
            loop {
                let result = next.run(req.clone(), ctx, cancel).await;
                let retry = match &result {
                    Ok(resp) => resp.status().is_server_error(),
                    Err(err) => err.retryable(),
                };
                if !retry || attempt >= budget || cancel.is_canceled() {
                    return result;
                }
                attempt += 1;
                debug!("retrying request (attempt {} of {})", attempt, budget);
                ctx.mark(format!("retry-{}", attempt));
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use bytes::Bytes;
    use http::{Method, StatusCode, Uri};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FlakyTransport {
        failures: AtomicUsize,
    }

    impl Terminal for FlakyTransport {
        fn dispatch<'a>(
            &'a self,
            req: Request,
            ctx: &'a Arc<RequestContext>,
            _cancel: &'a CancelToken,
        ) -> BoxFuture<'a, Result<Response>> {
            Box::pin(async move {
                if self.failures.fetch_sub(1, Ordering::SeqCst) > 1 {
                    Err(Error::new_network("flaky"))
                } else {
                    Ok(Response::new(
                        StatusCode::OK,
                        http::HeaderMap::new(),
                        Bytes::new(),
                        Duration::from_millis(1),
                        ctx.request(),
                    ))
                }
            })
        }
    }

    fn request(method: Method) -> Request {
        Request::builder(method, Uri::from_static("http://example.com/"))
            .build()
            .unwrap()
    }

    async fn run_chain(
        chain: Vec<Arc<dyn Middleware>>,
        transport: &FlakyTransport,
        req: Request,
    ) -> Result<Response> {
        let ctx = RequestContext::new(Arc::new(req.clone()));
        let next = Next {
            chain: &chain,
            transport,
        };
        next.run(req, &ctx, &CancelToken::new()).await
    }

    #[tokio::test]
    async fn retry_recovers_idempotent_request() {
        let transport = FlakyTransport {
            failures: AtomicUsize::new(2),
        };
        let chain: Vec<Arc<dyn Middleware>> = vec![Arc::new(Retry::new(1))];
        let resp = run_chain(chain, &transport, request(Method::GET))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn retry_skips_non_idempotent() {
        let transport = FlakyTransport {
            failures: AtomicUsize::new(2),
        };
        let chain: Vec<Arc<dyn Middleware>> = vec![Arc::new(Retry::new(1))];
        let err = run_chain(chain, &transport, request(Method::POST))
            .await
            .unwrap_err();
        assert!(err.is_network());
    }

    #[tokio::test]
    async fn retry_budget_is_bounded() {
        let transport = FlakyTransport {
            failures: AtomicUsize::new(10),
        };
        let chain: Vec<Arc<dyn Middleware>> = vec![Arc::new(Retry::new(2))];
        let err = run_chain(chain, &transport, request(Method::GET))
            .await
            .unwrap_err();
        assert!(err.is_network());
    }
}
