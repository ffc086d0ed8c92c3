//! # turbine
//!
//! A fast and correct HTTP client transport: pooled HTTP/1.1, multiplexed
//! HTTP/2 and WebSocket (RFC 6455 + permessage-deflate) over one
//! connection-establishment core.
//!
//! The building blocks:
//!
//! - **[`Client`]**: the facade. One `send` entry point plus verb builders,
//!   a middleware chain, capability-gated interceptors and a plugin
//!   registry.
//! - **Connection establishment**: dual-stack Happy Eyeballs racing, DNS
//!   with timeout, HTTP CONNECT proxy tunneling and pluggable TLS roots
//!   with ALPN.
//! - **Connection pooling**: per-host idle queues with liveness probing and
//!   a synchronous fast path.
//! - **[`ws::WebSocket`]**: the WebSocket core with a background reader,
//!   single-writer sends and optional permessage-deflate.
//!
//! ```no_run
//! use turbine::Client;
//!
//! # async fn run() -> turbine::Result<()> {
//! let client = Client::new();
//! let resp = client
//!     .get("https://example.com/".parse().unwrap())
//!     .send()
//!     .await?;
//! println!("{} ({} bytes)", resp.status(), resp.body().len());
//! # Ok(())
//! # }
//! ```

mod client;
mod common;
mod context;
mod error;
mod headers;
mod proto;
pub mod request;
mod response;

pub use crate::client::interceptor::{Capabilities, Interceptor};
pub use crate::client::middleware::{BoxFuture, Middleware, Next, Retry};
pub use crate::client::options::{
    FamilyPreference, HappyEyeballsOptions, Http2Options, InterceptorFailurePolicy, Options,
    ProxyOptions, TlsBackend, WebSocketOptions,
};
pub use crate::client::plugin::{Plugin, PluginContext};
pub use crate::client::{Builder, Client, RequestBuilder, SendFuture};
pub use crate::common::cancel::{CancelReason, CancelToken};
pub use crate::context::RequestContext;
pub use crate::error::{Error, Result};
pub use crate::request::Request;
pub use crate::response::Response;

/// WebSocket connection types.
pub mod ws {
    pub use crate::proto::ws::{CloseFrame, Message, ReadyState, WebSocket};
}
