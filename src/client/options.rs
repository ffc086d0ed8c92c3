//! Client configuration.

use std::time::Duration;

/// Which address family Happy Eyeballs leads with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FamilyPreference {
    V6First,
    V4First,
}

/// Trust-root source for the TLS backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsBackend {
    /// Prefer the platform store, fall back to the embedded roots.
    Auto,
    /// Platform certificate store only.
    System,
    /// Compiled-in root set only.
    Embedded,
}

/// What happens when an interceptor raises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptorFailurePolicy {
    /// Re-raise to the caller.
    Propagate,
    /// Synthesize a 500-class response carrying the error.
    ConvertToResponse,
}

#[derive(Debug, Clone)]
pub struct HappyEyeballsOptions {
    /// Delay before starting attempt N+1 while attempt N is still pending.
    pub stagger: Duration,
    pub family_preference: FamilyPreference,
}

impl Default for HappyEyeballsOptions {
    fn default() -> Self {
        HappyEyeballsOptions {
            stagger: Duration::from_millis(250),
            family_preference: FamilyPreference::V6First,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Http2Options {
    pub initial_window_size: u32,
    pub max_concurrent_streams: u32,
    pub max_frame_size: u32,
}

impl Default for Http2Options {
    fn default() -> Self {
        Http2Options {
            initial_window_size: 1024 * 1024,
            max_concurrent_streams: 100,
            max_frame_size: 16_384,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProxyOptions {
    /// Explicit proxy, e.g. `http://proxy.corp:3128`. Highest precedence.
    pub address: Option<http::Uri>,
    /// Basic credentials, `(user, password)`.
    pub credentials: Option<(String, String)>,
    /// Comma-separated bypass rules: exact host, `*.domain`, CIDR, `:port`.
    pub bypass_list: Option<String>,
    /// Honor `HTTPS_PROXY` / `HTTP_PROXY` / `NO_PROXY`.
    pub use_env: bool,
    /// Let https targets fall back to `HTTP_PROXY`. Off by default.
    pub allow_http_fallback_for_https: bool,
    /// Permit Basic credentials on an unencrypted proxy hop.
    pub allow_plaintext_auth: bool,
}

#[derive(Debug, Clone)]
pub struct WebSocketOptions {
    pub max_message_bytes: usize,
    pub max_fragments: usize,
    pub ping_interval: Option<Duration>,
    pub pong_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    /// Offer permessage-deflate during the handshake.
    pub enable_deflate: bool,
    /// Tolerate masked server frames instead of failing the connection.
    pub allow_masked_frames: bool,
}

impl Default for WebSocketOptions {
    fn default() -> Self {
        WebSocketOptions {
            max_message_bytes: 16 * 1024 * 1024,
            max_fragments: 1024,
            ping_interval: Some(Duration::from_secs(20)),
            pong_timeout: Duration::from_secs(10),
            idle_timeout: None,
            enable_deflate: false,
            allow_masked_frames: false,
        }
    }
}

/// Every tunable the client surface exposes.
#[derive(Debug, Clone)]
pub struct Options {
    /// Default per-attempt timeout applied when the request carries none.
    pub default_timeout: Option<Duration>,
    /// Pool semaphore size per `(scheme, host, port, tls, proxy)` key.
    pub max_connections_per_host: usize,
    /// Decoded body cap.
    pub max_response_body_bytes: usize,
    /// HPACK decoded header block cap.
    pub max_header_block_bytes: usize,
    pub happy_eyeballs: HappyEyeballsOptions,
    pub http2: Http2Options,
    pub tls_backend: TlsBackend,
    pub proxy: ProxyOptions,
    pub websocket: WebSocketOptions,
    pub interceptor_failure_policy: InterceptorFailurePolicy,
    pub plugin_shutdown_timeout: Duration,
    /// One extra attempt for idempotent methods when a pooled connection
    /// turns out to have been closed by the peer.
    pub retry_stale_connections: bool,
    /// Evict idle pooled connections older than this.
    pub pool_idle_timeout: Option<Duration>,
    /// Evict pooled connections regardless of activity after this age.
    pub pool_max_connection_age: Option<Duration>,
    /// Resolver timeout.
    pub dns_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            default_timeout: None,
            max_connections_per_host: 16,
            max_response_body_bytes: 100 * 1024 * 1024,
            max_header_block_bytes: 256 * 1024,
            happy_eyeballs: HappyEyeballsOptions::default(),
            http2: Http2Options::default(),
            tls_backend: TlsBackend::Auto,
            proxy: ProxyOptions::default(),
            websocket: WebSocketOptions::default(),
            interceptor_failure_policy: InterceptorFailurePolicy::Propagate,
            plugin_shutdown_timeout: Duration::from_secs(5),
            retry_stale_connections: true,
            pool_idle_timeout: Some(Duration::from_secs(90)),
            pool_max_connection_age: None,
            dns_timeout: Duration::from_secs(10),
        }
    }
}
