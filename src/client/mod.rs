//! HTTP client facade: the send pipeline and its collaborators.

pub(crate) mod connect;
pub mod interceptor;
pub mod middleware;
pub mod options;
pub mod plugin;
pub(crate) mod pool;
pub(crate) mod proxy;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use std::task::{Context, Poll};

use http::{Method, Uri};
use tracing::debug;

use crate::common::cancel::CancelToken;
use crate::context::RequestContext;
use crate::error::{Error, Result};
use crate::proto::h1;
use crate::proto::h1::dispatch::{Http1Options, Progress};
use crate::proto::h1::encode::RequestTarget;
use crate::proto::h1::io::BufferedIo;
use crate::proto::h2::conn::{H2Connection, H2Options};
use crate::proto::ws::WebSocket;
use crate::request::Request;
use crate::response::Response;

use self::connect::tls::{self, TlsProvider, ALPN_H2_H11, ALPN_NONE};
use self::connect::{Connector, Transport};
use self::interceptor::{Guarded, Interceptor};
use self::middleware::{BoxFuture, Middleware, Next, Terminal};
use self::options::{InterceptorFailurePolicy, Options};
use self::plugin::{initialize_plugin, shutdown_plugin, Plugin, PluginEntry};
use self::pool::{Conn, Pool, PoolConfig, PoolKey};
use self::proxy::{ProxyIntent, ProxyMode, ProxySelector};

/// An asynchronous HTTP/1.1 + HTTP/2 + WebSocket client.
///
/// Cheap to clone; clones share the connection pool, the HTTP/2 connection
/// cache and the plugin registry.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    options: Options,
    middleware: Vec<Arc<dyn Middleware>>,
    interceptors: RwLock<Vec<Guarded>>,
    plugins: Mutex<Vec<PluginEntry>>,
    pool: Pool,
    h2_conns: Mutex<HashMap<PoolKey, H2Connection>>,
    connector: Connector,
    proxy: ProxySelector,
    /// TLS for https: offers `h2` and `http/1.1`.
    tls_alpn: TlsProvider,
    /// TLS for wss upgrades: no ALPN.
    tls_plain: TlsProvider,
}

impl Client {
    /// A client with default options.
    pub fn new() -> Client {
        Client::builder()
            .build()
            .expect("default client configuration is buildable")
    }

    pub fn builder() -> Builder {
        Builder {
            options: Options::default(),
            middleware: Vec::new(),
        }
    }

    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    /// Sends a prepared request. The returned future is single-consumption.
    pub fn send(&self, req: Request) -> SendFuture {
        self.send_with_cancel(req, CancelToken::new())
    }

    /// Sends with an external cancellation token.
    pub fn send_with_cancel(&self, req: Request, cancel: CancelToken) -> SendFuture {
        match req.uri().scheme_str() {
            Some("http" | "https") => {}
            _ => {
                // synchronous fast path: no task machinery for a request
                // that can never reach the wire
                return SendFuture::ready(Err(Error::new_invalid_request(
                    "send() handles http and https; use websocket() for ws/wss",
                )));
            }
        }
        let inner = self.inner.clone();
        SendFuture::boxed(Box::pin(async move { inner.execute(req, cancel).await }))
    }

    pub fn get(&self, uri: Uri) -> RequestBuilder {
        self.request(Method::GET, uri)
    }

    pub fn post(&self, uri: Uri) -> RequestBuilder {
        self.request(Method::POST, uri)
    }

    pub fn put(&self, uri: Uri) -> RequestBuilder {
        self.request(Method::PUT, uri)
    }

    pub fn patch(&self, uri: Uri) -> RequestBuilder {
        self.request(Method::PATCH, uri)
    }

    pub fn delete(&self, uri: Uri) -> RequestBuilder {
        self.request(Method::DELETE, uri)
    }

    pub fn head(&self, uri: Uri) -> RequestBuilder {
        self.request(Method::HEAD, uri)
    }

    pub fn options_request(&self, uri: Uri) -> RequestBuilder {
        self.request(Method::OPTIONS, uri)
    }

    pub fn request(&self, method: Method, uri: Uri) -> RequestBuilder {
        RequestBuilder {
            client: self.clone(),
            inner: Request::builder(method, uri),
        }
    }

    /// Opens a WebSocket to a `ws` or `wss` URI.
    pub async fn websocket(&self, uri: Uri) -> Result<WebSocket> {
        let req = Request::builder(Method::GET, uri).build()?;
        self.websocket_with(req, CancelToken::new()).await
    }

    /// Opens a WebSocket from a prepared upgrade request (custom headers,
    /// subprotocol offers).
    pub async fn websocket_with(&self, req: Request, cancel: CancelToken) -> Result<WebSocket> {
        match req.uri().scheme_str() {
            Some("ws" | "wss") => {}
            _ => {
                return Err(Error::new_invalid_request(
                    "websocket() requires a ws or wss uri",
                ))
            }
        }
        let cancel = self.inner.attempt_cancel(&req, &cancel);
        let host = req.uri().host().expect("validated at build").to_owned();
        let port = req.port();
        let scheme = req.scheme().as_str().to_owned();
        let intent = self.inner.proxy.intent_for(&scheme, &host, port);

        let tcp = self
            .inner
            .dial(&host, port, intent.as_ref(), &cancel)
            .await?;
        // WebSocket targets always tunnel through a configured proxy.
        let tcp = match &intent {
            Some(intent) => {
                proxy::tunnel(
                    tcp,
                    &host,
                    port,
                    intent,
                    self.inner.proxy.allow_plaintext_auth,
                    &cancel,
                )
                .await?
            }
            None => tcp,
        };
        let transport = if req.is_tls() {
            let tls = self.inner.tls_plain.handshake(&host, tcp, &cancel).await?;
            Transport::Tls(Box::new(tls))
        } else {
            Transport::Plain(tcp)
        };
        WebSocket::upgrade(transport, &req, self.inner.options.websocket.clone(), &cancel).await
    }

    /// Registers a plugin; its `initialize` runs before this returns and any
    /// contributed interceptors are rolled back if it fails.
    pub fn register_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<()> {
        // The registry lock seals registration; initialize runs inside it
        // and must not re-enter the registry.
        let mut plugins = self.inner.plugins.lock().unwrap();
        if plugins.iter().any(|e| e.plugin.name() == plugin.name()) {
            return Err(Error::new_invalid_request(format!(
                "plugin {} is already registered",
                plugin.name()
            )));
        }
        let (entry, guards) = initialize_plugin(&plugin, &self.inner.options)?;
        self.inner.interceptors.write().unwrap().extend(guards);
        plugins.push(entry);
        Ok(())
    }

    /// Unregisters a plugin. Its `shutdown` runs off this task under the
    /// configured timeout; a missed deadline is reported but the plugin is
    /// removed regardless.
    pub async fn unregister_plugin(&self, name: &str) -> Result<()> {
        let entry = {
            let mut plugins = self.inner.plugins.lock().unwrap();
            let at = plugins
                .iter()
                .position(|e| e.plugin.name() == name)
                .ok_or_else(|| {
                    Error::new_invalid_request(format!("plugin {} is not registered", name))
                })?;
            plugins.remove(at)
        };
        {
            let mut interceptors = self.inner.interceptors.write().unwrap();
            interceptors.retain(|g| !entry.contributed.iter().any(|n| n == g.name()));
        }
        shutdown_plugin(entry.plugin, self.inner.options.plugin_shutdown_timeout).await
    }

    /// Registers a bare interceptor (outside any plugin).
    pub fn register_interceptor(&self, interceptor: Arc<dyn Interceptor>) {
        self.inner
            .interceptors
            .write()
            .unwrap()
            .push(Guarded::new(interceptor));
    }

    /// Tears the client down: plugins shut down in reverse registration
    /// order, then shared connections close. Never fails; shutdown errors
    /// are logged and swallowed.
    pub async fn shutdown(&self) {
        let entries: Vec<PluginEntry> = {
            let mut plugins = self.inner.plugins.lock().unwrap();
            plugins.drain(..).rev().collect()
        };
        for entry in entries {
            let name = entry.plugin.name().to_owned();
            if let Err(err) =
                shutdown_plugin(entry.plugin, self.inner.options.plugin_shutdown_timeout).await
            {
                debug!("plugin {} shutdown error ignored: {}", name, err);
            }
        }
        self.inner.interceptors.write().unwrap().clear();

        let conns: Vec<H2Connection> = {
            let mut cache = self.inner.h2_conns.lock().unwrap();
            cache.drain().map(|(_, conn)| conn).collect()
        };
        for conn in conns {
            conn.close().await;
        }
        self.inner.pool.clear();
    }
}

impl Default for Client {
    fn default() -> Client {
        Client::new()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("options", &self.inner.options)
            .finish()
    }
}

// ===== builder =====

/// Configures and builds a [`Client`].
pub struct Builder {
    options: Options,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl Builder {
    /// Replaces the whole option set.
    pub fn options(mut self, options: Options) -> Builder {
        self.options = options;
        self
    }

    /// Default per-attempt timeout for requests that carry none.
    pub fn default_timeout(mut self, timeout: std::time::Duration) -> Builder {
        self.options.default_timeout = Some(timeout);
        self
    }

    pub fn max_connections_per_host(mut self, max: usize) -> Builder {
        self.options.max_connections_per_host = max;
        self
    }

    pub fn max_response_body_bytes(mut self, max: usize) -> Builder {
        self.options.max_response_body_bytes = max;
        self
    }

    pub fn tls_backend(mut self, backend: options::TlsBackend) -> Builder {
        self.options.tls_backend = backend;
        self
    }

    pub fn proxy(mut self, proxy: options::ProxyOptions) -> Builder {
        self.options.proxy = proxy;
        self
    }

    pub fn websocket_options(mut self, ws: options::WebSocketOptions) -> Builder {
        self.options.websocket = ws;
        self
    }

    pub fn interceptor_failure_policy(mut self, policy: InterceptorFailurePolicy) -> Builder {
        self.options.interceptor_failure_policy = policy;
        self
    }

    /// Appends a middleware; the chain runs in the order appended.
    pub fn middleware<M: Middleware>(mut self, middleware: M) -> Builder {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn build(self) -> Result<Client> {
        let tls_alpn = TlsProvider::new(self.options.tls_backend, ALPN_H2_H11)?;
        let tls_plain = TlsProvider::new(self.options.tls_backend, ALPN_NONE)?;
        let proxy = ProxySelector::from_options(&self.options.proxy)?;
        let pool = Pool::new(PoolConfig {
            max_per_host: self.options.max_connections_per_host,
            idle_timeout: self.options.pool_idle_timeout,
            max_age: self.options.pool_max_connection_age,
        });
        let connector = Connector::new(
            self.options.happy_eyeballs.clone(),
            self.options.dns_timeout,
        );
        Ok(Client {
            inner: Arc::new(ClientInner {
                options: self.options,
                middleware: self.middleware,
                interceptors: RwLock::new(Vec::new()),
                plugins: Mutex::new(Vec::new()),
                pool,
                h2_conns: Mutex::new(HashMap::new()),
                connector,
                proxy,
                tls_alpn,
                tls_plain,
            }),
        })
    }
}

// ===== request builder =====

/// Fluent request construction bound to a client.
pub struct RequestBuilder {
    client: Client,
    inner: crate::request::Builder,
}

impl RequestBuilder {
    pub fn header<V>(mut self, name: http::header::HeaderName, value: V) -> RequestBuilder
    where
        V: Into<http::HeaderValue>,
    {
        self.inner = self.inner.header(name, value);
        self
    }

    pub fn body<B: Into<bytes::Bytes>>(mut self, body: B) -> RequestBuilder {
        self.inner = self.inner.body(body);
        self
    }

    pub fn timeout(mut self, timeout: std::time::Duration) -> RequestBuilder {
        self.inner = self.inner.timeout(timeout);
        self
    }

    pub fn metadata<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> RequestBuilder {
        self.inner = self.inner.metadata(key, value);
        self
    }

    pub async fn send(self) -> Result<Response> {
        let req = self.inner.build()?;
        self.client.send(req).await
    }
}

// ===== send future =====

pin_project_lite::pin_project! {
    /// The single-consumption result of [`Client::send`].
    ///
    /// Completes synchronously when the request is rejected before any I/O.
    pub struct SendFuture {
        #[pin]
        state: SendState,
    }
}

pin_project_lite::pin_project! {
    #[project = SendStateProj]
    enum SendState {
        Ready { result: Option<Result<Response>> },
        Running { #[pin] fut: BoxFuture<'static, Result<Response>> },
    }
}

impl SendFuture {
    fn ready(result: Result<Response>) -> SendFuture {
        SendFuture {
            state: SendState::Ready {
                result: Some(result),
            },
        }
    }

    fn boxed(fut: BoxFuture<'static, Result<Response>>) -> SendFuture {
        SendFuture {
            state: SendState::Running { fut },
        }
    }
}

impl Future for SendFuture {
    type Output = Result<Response>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project().state.project() {
            SendStateProj::Ready { result } => {
                Poll::Ready(result.take().expect("SendFuture polled after completion"))
            }
            SendStateProj::Running { fut } => fut.poll(cx),
        }
    }
}

// ===== pipeline execution =====

impl ClientInner {
    async fn execute(self: Arc<Self>, req: Request, cancel: CancelToken) -> Result<Response> {
        let ctx = RequestContext::new(Arc::new(req.clone()));
        ctx.mark("send");
        let mut current = req;

        let interceptors: Vec<Guarded> = self.interceptors.read().unwrap().clone();
        for interceptor in &interceptors {
            match interceptor.on_request(&current, &ctx, &cancel) {
                Ok(Some(replacement)) => {
                    ctx.set_request(Arc::new(replacement.clone()));
                    current = replacement;
                }
                Ok(None) => {}
                Err(err) => return self.interceptor_failure(err, &ctx),
            }
            if cancel.is_canceled() {
                return Err(cancel.error());
            }
        }

        let transport = TransportRef { inner: &self };
        let next = Next {
            chain: &self.middleware,
            transport: &transport,
        };
        let result = next.run(current, &ctx, &cancel).await;

        match result {
            Ok(mut resp) => {
                for interceptor in interceptors.iter().rev() {
                    match interceptor.on_response(&resp, &ctx) {
                        Ok(Some(replacement)) => resp = replacement,
                        Ok(None) => {}
                        Err(err) => return self.interceptor_failure(err, &ctx),
                    }
                }
                Ok(resp)
            }
            Err(err) => {
                for interceptor in interceptors.iter().rev() {
                    match interceptor.on_error(&err, &ctx) {
                        Ok(Some(resp)) => return Ok(resp),
                        Ok(None) => {}
                        Err(violation) => return self.interceptor_failure(violation, &ctx),
                    }
                }
                Err(err)
            }
        }
    }

    fn interceptor_failure(&self, err: Error, ctx: &Arc<RequestContext>) -> Result<Response> {
        match self.options.interceptor_failure_policy {
            InterceptorFailurePolicy::Propagate => Err(err),
            InterceptorFailurePolicy::ConvertToResponse => {
                Ok(Response::from_error(err, ctx.elapsed(), ctx.request()))
            }
        }
    }

    /// Builds the linked per-attempt cancellation: explicit token plus the
    /// per-attempt deadline. A fired deadline maps to `Timeout`.
    fn attempt_cancel(&self, req: &Request, cancel: &CancelToken) -> CancelToken {
        match req.timeout().or(self.options.default_timeout) {
            Some(timeout) => cancel.with_deadline(tokio::time::Instant::now() + timeout),
            None => cancel.clone(),
        }
    }

    fn h2_options(&self) -> H2Options {
        H2Options {
            initial_window_size: self.options.http2.initial_window_size,
            max_concurrent_streams: self.options.http2.max_concurrent_streams,
            max_frame_size: self.options.http2.max_frame_size,
            max_header_block_bytes: self.options.max_header_block_bytes,
            max_response_body_bytes: self.options.max_response_body_bytes,
        }
    }

    async fn transport_dispatch(
        &self,
        req: Request,
        ctx: &Arc<RequestContext>,
        cancel: &CancelToken,
    ) -> Result<Response> {
        let started = std::time::Instant::now();
        // Ambiguous framing is refused synchronously, before any byte or
        // connection is spent on the request.
        h1::encode::validate_framing(&req)?;
        let cancel = self.attempt_cancel(&req, cancel);
        if cancel.is_canceled() {
            return Err(cancel.error());
        }

        let host = req.uri().host().expect("validated at build").to_owned();
        let port = req.port();
        let scheme = req.scheme().as_str().to_owned();
        let is_tls = req.is_tls();
        let intent = self.proxy.intent_for(&scheme, &host, port);

        let key = PoolKey::new(
            &scheme,
            &host,
            port,
            if is_tls { self.tls_alpn.backend_id() } else { "" },
            if is_tls { self.tls_alpn.alpn_fingerprint() } else { "" },
            intent.as_ref().map(|p| p.id.clone()),
        );

        // A live shared HTTP/2 connection short-circuits the pool entirely.
        if is_tls {
            let cached = self.h2_conns.lock().unwrap().get(&key).cloned();
            if let Some(conn) = cached {
                if conn.is_open() {
                    ctx.mark("h2-reuse");
                    return self.send_h2(&conn, &req, ctx, &cancel, started).await;
                }
                self.h2_conns.lock().unwrap().remove(&key);
            }
        }

        let mut lease = match self.pool.try_acquire(&key) {
            Some(lease) => lease,
            None => self.pool.acquire(&key, &cancel).await?,
        };

        if let Some(conn) = lease.take() {
            ctx.mark("pool-reuse");
            let reused = lease.reused();
            match self
                .h1_exchange(conn, &req, intent.as_ref(), ctx, &cancel, started, reused)
                .await
            {
                Ok((resp, keep)) => {
                    if let Some(conn) = keep {
                        lease.release(conn);
                    }
                    return Ok(resp);
                }
                Err((err, stale))
                    if stale && self.options.retry_stale_connections && req.is_idempotent() =>
                {
                    // The pool's liveness probe raced the peer's close; one
                    // fresh attempt for idempotent methods only.
                    debug!("stale pooled connection, retrying fresh: {}", err);
                    ctx.mark("stale-retry");
                }
                Err((err, _)) => return Err(err),
            }
        }

        match self.establish(&host, port, is_tls, intent.as_ref(), &cancel).await? {
            Established::H2(conn) => {
                // multiplexed: the pool slot is not held for h2 traffic
                drop(lease);
                self.h2_conns.lock().unwrap().insert(key, conn.clone());
                ctx.mark("h2-connect");
                self.send_h2(&conn, &req, ctx, &cancel, started).await
            }
            Established::H1(transport) => {
                ctx.mark("h1-connect");
                let conn = Conn::new(transport);
                match self
                    .h1_exchange(conn, &req, intent.as_ref(), ctx, &cancel, started, false)
                    .await
                {
                    Ok((resp, keep)) => {
                        if let Some(conn) = keep {
                            lease.release(conn);
                        }
                        Ok(resp)
                    }
                    Err((err, _)) => Err(err),
                }
            }
        }
    }

    async fn send_h2(
        &self,
        conn: &H2Connection,
        req: &Request,
        ctx: &Arc<RequestContext>,
        cancel: &CancelToken,
        started: std::time::Instant,
    ) -> Result<Response> {
        let parts = conn.send_request(req, cancel).await?;
        Ok(Response::new(
            parts.status,
            parts.headers,
            parts.body,
            started.elapsed(),
            ctx.request(),
        ))
    }

    /// One HTTP/1.1 transaction. On success returns the response plus the
    /// connection when it may be pooled again; on failure flags whether the
    /// error smells like a stale reused connection.
    #[allow(clippy::too_many_arguments)]
    async fn h1_exchange(
        &self,
        conn: Conn,
        req: &Request,
        intent: Option<&ProxyIntent>,
        ctx: &Arc<RequestContext>,
        cancel: &CancelToken,
        started: std::time::Instant,
        reused: bool,
    ) -> std::result::Result<(Response, Option<Conn>), (Error, bool)> {
        let created_at = conn.created_at;
        let mut io = BufferedIo::new(conn.transport);
        let target = match intent {
            Some(intent) if intent.mode == ProxyMode::Forward => RequestTarget::Absolute,
            _ => RequestTarget::Origin,
        };
        let h1_options = Http1Options {
            max_response_body_bytes: self.options.max_response_body_bytes,
            max_head_bytes: h1::parse::DEFAULT_MAX_HEAD_BYTES,
        };
        let mut progress = Progress::default();

        match h1::dispatch::send_request(&mut io, req, target, &h1_options, cancel, &mut progress)
            .await
        {
            Ok(exchange) => {
                let reusable = exchange.keep_alive && !io.has_buffered_input();
                let (transport, _) = io.into_parts();
                let resp = Response::new(
                    exchange.head.status,
                    exchange.head.headers,
                    exchange.body,
                    started.elapsed(),
                    ctx.request(),
                );
                let conn = reusable.then(|| Conn {
                    transport,
                    created_at,
                });
                Ok((resp, conn))
            }
            Err(err) => {
                let stale = reused && !progress.response_started && err.is_network();
                Err((err, stale))
            }
        }
    }

    async fn dial(
        &self,
        host: &str,
        port: u16,
        intent: Option<&ProxyIntent>,
        cancel: &CancelToken,
    ) -> Result<tokio::net::TcpStream> {
        match intent {
            Some(intent) => self
                .connector
                .connect_tcp(&intent.host, intent.port, cancel)
                .await
                .map_err(|err| {
                    if err.is_network() {
                        Error::new_proxy_connect(err)
                    } else {
                        err
                    }
                }),
            None => self.connector.connect_tcp(host, port, cancel).await,
        }
    }

    async fn establish(
        &self,
        host: &str,
        port: u16,
        is_tls: bool,
        intent: Option<&ProxyIntent>,
        cancel: &CancelToken,
    ) -> Result<Established> {
        let tcp = self.dial(host, port, intent, cancel).await?;
        let tcp = match intent {
            Some(intent) if intent.mode == ProxyMode::Tunnel => {
                proxy::tunnel(
                    tcp,
                    host,
                    port,
                    intent,
                    self.proxy.allow_plaintext_auth,
                    cancel,
                )
                .await?
            }
            _ => tcp,
        };

        if is_tls {
            let tls_stream = self.tls_alpn.handshake(host, tcp, cancel).await?;
            if tls::alpn_is_h2(&tls_stream) {
                let conn = H2Connection::handshake(
                    Transport::Tls(Box::new(tls_stream)),
                    self.h2_options(),
                    cancel,
                )
                .await?;
                Ok(Established::H2(conn))
            } else {
                Ok(Established::H1(Transport::Tls(Box::new(tls_stream))))
            }
        } else {
            Ok(Established::H1(Transport::Plain(tcp)))
        }
    }
}

enum Established {
    H1(Transport),
    H2(H2Connection),
}

struct TransportRef<'a> {
    inner: &'a ClientInner,
}

impl Terminal for TransportRef<'_> {
    fn dispatch<'a>(
        &'a self,
        req: Request,
        ctx: &'a Arc<RequestContext>,
        cancel: &'a CancelToken,
    ) -> BoxFuture<'a, Result<Response>> {
        Box::pin(self.inner.transport_dispatch(req, ctx, cancel))
    }
}
