//! Name resolution.
//!
//! Uses the platform resolver on the blocking pool. No per-lookup caching:
//! the OS resolver is trusted for TTLs.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;

use tracing::trace;

use crate::error::{Error, Result};

type Resolving<'a> = Pin<Box<dyn Future<Output = io::Result<Vec<SocketAddr>>> + Send + 'a>>;

/// Pluggable address resolution.
pub(crate) trait Resolve: Send + Sync {
    fn resolve<'a>(&'a self, host: &'a str, port: u16) -> Resolving<'a>;
}

/// Resolver backed by the platform's `getaddrinfo`.
#[derive(Debug, Clone, Default)]
pub(crate) struct GaiResolver {
    _priv: (),
}

impl GaiResolver {
    pub(crate) fn new() -> GaiResolver {
        GaiResolver { _priv: () }
    }
}

impl Resolve for GaiResolver {
    fn resolve<'a>(&'a self, host: &'a str, port: u16) -> Resolving<'a> {
        Box::pin(async move {
            let addrs = tokio::net::lookup_host((host, port)).await?;
            Ok(addrs.collect())
        })
    }
}

/// Resolves `host:port` with an explicit timeout. Empty results and resolver
/// failures both surface as `NetworkError`.
pub(crate) async fn resolve_with_timeout(
    resolver: &dyn Resolve,
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<Vec<SocketAddr>> {
    let addrs = match tokio::time::timeout(timeout, resolver.resolve(host, port)).await {
        Ok(Ok(addrs)) => addrs,
        Ok(Err(err)) => return Err(Error::new_network(err)),
        Err(_) => return Err(Error::new_timeout()),
    };
    if addrs.is_empty() {
        return Err(Error::new_network(format!(
            "dns lookup for {} returned no addresses",
            host
        )));
    }
    trace!("resolved {} to {} addresses", host, addrs.len());
    Ok(addrs)
}
