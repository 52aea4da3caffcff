//! Concurrent HTTP/1.1 server with integrated WebSocket support, TLS
//! termination, ETag-based conditional static file service, and a pluggable
//! rate-limiting layer.
//!
//! The orchestrator owns the listening sockets and the shared route table;
//! every accepted socket becomes an independent connection task.

mod config;
mod connection;
mod router;
mod static_files;
mod websocket;
mod worker;

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use ember_limit::{LimiterRegistry, RateLimiter};
use ember_observe::{Event, EventSink, EventType, ServerStats, StatsSnapshot, TracingEventSink};
use ember_tls::classify_tls_error;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

pub use config::{ConfigError, ServerConfig};
pub use ember_http::{HttpMethod, HttpRequest, HttpResponse, HttpStatus};
pub use router::{rate_limit_middleware, Handler, Middleware, MiddlewareFlow, RequestContext, Router};
pub use websocket::{WsHandlers, WsSender, WsState, WsStats};
pub use worker::{WorkerPool, WorkerPoolError};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Tls(#[from] ember_tls::TlsConfigError),
    #[error("bind failed on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub(crate) struct ServerShared {
    pub(crate) config: Arc<ServerConfig>,
    router_slot: Arc<RwLock<Arc<Router>>>,
    pub(crate) stats: Arc<ServerStats>,
    pub(crate) sink: Arc<dyn EventSink>,
}

impl ServerShared {
    pub(crate) fn router(&self) -> Arc<Router> {
        Arc::clone(&self.router_slot.read().expect("router slot lock poisoned"))
    }
}

/// Handle for runtime reconfiguration. Route and middleware swaps go through
/// the slot atomically; dispatch paths only ever clone the current `Arc`.
#[derive(Clone)]
pub struct ServerController {
    router_slot: Arc<RwLock<Arc<Router>>>,
    limiter: Option<Arc<RateLimiter>>,
    stats: Arc<ServerStats>,
}

impl ServerController {
    pub fn replace_router(&self, router: Router) {
        *self.router_slot.write().expect("router slot lock poisoned") = Arc::new(router);
    }

    pub fn update_rate_limit(&self, config: ember_limit::RateLimitConfig) {
        if let Some(limiter) = &self.limiter {
            limiter.update_config(config);
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

pub struct HttpServer {
    config: ServerConfig,
    router: Router,
    router_slot: Arc<RwLock<Arc<Router>>>,
    stats: Arc<ServerStats>,
    sink: Arc<dyn EventSink>,
    limiter: Option<Arc<RateLimiter>>,
    registry: Arc<LimiterRegistry>,
    worker_pool: WorkerPool,
}

impl HttpServer {
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let registry = Arc::new(LimiterRegistry::default());
        let limiter = config
            .rate_limit
            .as_ref()
            .map(|rate_config| registry.global(rate_config));
        let worker_pool = WorkerPool::new(config.thread_pool_size);
        let sink: Arc<dyn EventSink> = if config.enable_logging {
            Arc::new(TracingEventSink)
        } else {
            Arc::new(ember_observe::NoopEventSink)
        };
        Ok(Self {
            config,
            router: Router::default(),
            router_slot: Arc::new(RwLock::new(Arc::new(Router::default()))),
            stats: Arc::new(ServerStats::default()),
            sink,
            limiter,
            registry,
            worker_pool,
        })
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn router_mut(&mut self) -> &mut Router {
        &mut self.router
    }

    pub fn add_route(
        &mut self,
        path: &str,
        method: HttpMethod,
        handler: impl Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
    ) {
        self.router.add_route(path, method, handler);
    }

    pub fn add_get_route(
        &mut self,
        path: &str,
        handler: impl Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
    ) {
        self.router.get(path, handler);
    }

    pub fn add_post_route(
        &mut self,
        path: &str,
        handler: impl Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
    ) {
        self.router.post(path, handler);
    }

    pub fn add_put_route(
        &mut self,
        path: &str,
        handler: impl Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
    ) {
        self.router.put(path, handler);
    }

    pub fn add_delete_route(
        &mut self,
        path: &str,
        handler: impl Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
    ) {
        self.router.delete(path, handler);
    }

    pub fn add_patch_route(
        &mut self,
        path: &str,
        handler: impl Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
    ) {
        self.router.patch(path, handler);
    }

    pub fn add_middleware(
        &mut self,
        middleware: impl Fn(&RequestContext<'_>, &mut HttpResponse) -> MiddlewareFlow
            + Send
            + Sync
            + 'static,
    ) {
        self.router.add_middleware(middleware);
    }

    pub fn add_websocket_route(&mut self, path: &str, handlers: WsHandlers) {
        self.router.add_websocket_route(path, handlers);
    }

    pub fn enable_static_files(&mut self, document_root: &str) {
        self.config.serve_static_files = true;
        self.config.document_root = document_root.to_string();
    }

    pub fn disable_static_files(&mut self) {
        self.config.serve_static_files = false;
    }

    pub fn limiter_registry(&self) -> Arc<LimiterRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn worker_pool(&self) -> WorkerPool {
        self.worker_pool.clone()
    }

    pub fn controller(&self) -> ServerController {
        ServerController {
            router_slot: Arc::clone(&self.router_slot),
            limiter: self.limiter.as_ref().map(Arc::clone),
            stats: Arc::clone(&self.stats),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn stats_json(&self) -> String {
        self.stats.stats_json()
    }

    pub async fn bind_listener(&self) -> Result<TcpListener, ServerError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })
    }

    /// Serves until the process dies.
    pub async fn run(self) -> Result<(), ServerError> {
        // Hold the sender so the shutdown channel never signals.
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener = self.bind_listener().await?;
        self.run_with_listener(listener, shutdown_rx).await
    }

    pub async fn run_until_shutdown(
        self,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), ServerError> {
        if *shutdown.borrow() {
            return Ok(());
        }
        let listener = self.bind_listener().await?;
        self.run_with_listener(listener, shutdown).await
    }

    pub async fn bind_tls_listener(&self) -> Result<TcpListener, ServerError> {
        let addr = format!("{}:{}", self.config.host, self.config.https_port);
        TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })
    }

    /// Accept loop over an already-bound listener (tests bind port 0 and
    /// read the ephemeral address first). Binds and serves the TLS listener
    /// alongside when HTTPS is enabled.
    pub async fn run_with_listener(
        self,
        listener: TcpListener,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), ServerError> {
        let tls_listener = if self.config.enable_https {
            Some(self.bind_tls_listener().await?)
        } else {
            None
        };
        self.run_with_listeners(listener, tls_listener, shutdown)
            .await
    }

    /// Like `run_with_listener`, with the TLS listener supplied by the
    /// caller so its ephemeral port is knowable.
    pub async fn run_with_listeners(
        mut self,
        listener: TcpListener,
        tls_listener: Option<TcpListener>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), ServerError> {
        let tls = match tls_listener {
            Some(tls_listener) if self.config.enable_https => {
                let server_config = self.config.tls_settings().build_server_config()?;
                Some((tls_listener, TlsAcceptor::from(server_config)))
            }
            _ => None,
        };

        // The rate limiter always runs ahead of user middleware.
        if let Some(limiter) = &self.limiter {
            self.router
                .prepend_middleware(rate_limit_middleware(Arc::clone(limiter), None));
            let _ = limiter.spawn_cleanup(shutdown.clone());
        }

        *self
            .router_slot
            .write()
            .expect("router slot lock poisoned") = Arc::new(self.router);
        let shared = Arc::new(ServerShared {
            config: Arc::new(self.config),
            router_slot: self.router_slot,
            stats: self.stats,
            sink: self.sink,
        });

        tracing::info!(
            addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            https = tls.is_some(),
            "server listening"
        );

        let mut tls_task = None;
        if let Some((tls_listener, acceptor)) = tls {
            let shared = Arc::clone(&shared);
            let shutdown = shutdown.clone();
            tls_task = Some(tokio::spawn(async move {
                accept_tls_loop(tls_listener, acceptor, shared, shutdown).await;
            }));
        }

        accept_plain_loop(listener, Arc::clone(&shared), shutdown).await;

        if let Some(task) = tls_task {
            task.abort();
            let _ = task.await;
        }
        Ok(())
    }
}

async fn accept_plain_loop(
    listener: TcpListener,
    shared: Arc<ServerShared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut shutdown_open = true;
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer)) => spawn_connection(socket, peer, &shared),
                    Err(error) => {
                        tracing::warn!(detail = %error, "accept failed");
                    }
                }
            }
            changed = shutdown.changed(), if shutdown_open => {
                match changed {
                    Ok(()) if *shutdown.borrow() => return,
                    Ok(()) => {}
                    // Sender dropped without signaling: keep serving.
                    Err(_) => shutdown_open = false,
                }
            }
        }
    }
}

async fn accept_tls_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    shared: Arc<ServerShared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut shutdown_open = true;
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer)) => spawn_tls_connection(socket, peer, acceptor.clone(), &shared),
                    Err(error) => {
                        tracing::warn!(detail = %error, "tls accept failed");
                    }
                }
            }
            changed = shutdown.changed(), if shutdown_open => {
                match changed {
                    Ok(()) if *shutdown.borrow() => return,
                    Ok(()) => {}
                    Err(_) => shutdown_open = false,
                }
            }
        }
    }
}

struct ConnectionGuard {
    shared: Arc<ServerShared>,
    peer: SocketAddr,
}

impl ConnectionGuard {
    fn new(shared: Arc<ServerShared>, peer: SocketAddr) -> Self {
        shared.stats.record_connection_open();
        shared
            .sink
            .emit(Event::new(EventType::ConnectionOpened, peer.to_string()));
        Self { shared, peer }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.shared.stats.record_connection_close();
        self.shared
            .sink
            .emit(Event::new(EventType::ConnectionClosed, self.peer.to_string()));
    }
}

fn refuse_if_at_capacity(shared: &Arc<ServerShared>, peer: SocketAddr) -> bool {
    if shared.stats.active_connections() >= shared.config.max_connections as u64 {
        shared
            .sink
            .emit(Event::new(EventType::ConnectionRefused, peer.to_string()));
        tracing::warn!(peer = %peer, "connection refused: at max_connections");
        return true;
    }
    false
}

fn spawn_connection(socket: tokio::net::TcpStream, peer: SocketAddr, shared: &Arc<ServerShared>) {
    if refuse_if_at_capacity(shared, peer) {
        return;
    }
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        let _guard = ConnectionGuard::new(Arc::clone(&shared), peer);
        connection::serve_connection(socket, peer, shared).await;
    });
}

fn spawn_tls_connection(
    socket: tokio::net::TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    shared: &Arc<ServerShared>,
) {
    if refuse_if_at_capacity(shared, peer) {
        return;
    }
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        let _guard = ConnectionGuard::new(Arc::clone(&shared), peer);
        // The handshake inherits the HTTP inactivity timeout.
        let handshake = tokio::time::timeout(
            shared.config.keep_alive_timeout_duration(),
            acceptor.accept(socket),
        );
        let stream = match handshake.await {
            Ok(Ok(stream)) => stream,
            Ok(Err(error)) => {
                let detail = error.to_string();
                shared.sink.emit(
                    Event::new(EventType::TlsHandshakeFailed, peer.to_string())
                        .with_attribute("detail", detail.clone())
                        .with_attribute("kind", classify_tls_error(&detail)),
                );
                return;
            }
            Err(_) => {
                shared.sink.emit(
                    Event::new(EventType::TlsHandshakeFailed, peer.to_string())
                        .with_attribute("detail", "handshake timed out")
                        .with_attribute("kind", "timeout"),
                );
                return;
            }
        };
        connection::serve_connection(stream, peer, shared).await;
    });
}
