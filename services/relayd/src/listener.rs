//! TCP listener and session spawning.
//!
//! Each accepted connection becomes one relay session running on its own
//! task, bounded by a connection semaphore.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use plexus_relay::{BufferedPort, Session, SessionConfig};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn, Instrument};

use crate::config::{Config, ProxyHeaderMode};
use crate::passthrough::Passthrough;
use crate::proxy_protocol::ProxyHeader;
use crate::reactor::{Reactor, SessionReport};
use crate::upstream::{UpstreamConnector, UpstreamPool};

/// Default maximum concurrent sessions per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent sessions.
    pub max_connections: usize,
    /// Close sessions idle for this long.
    pub idle_timeout: Option<Duration>,
    /// PROXY header sent to backends.
    pub proxy_header: ProxyHeaderMode,
    /// Per-session settings.
    pub session: SessionConfig,
}

impl ListenerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            idle_timeout: None,
            proxy_header: ProxyHeaderMode::Off,
            session: SessionConfig::default(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            bind_addr: config.listen_addr,
            max_connections: config.max_connections,
            idle_timeout: config.idle_timeout,
            proxy_header: config.proxy_header,
            session: config.session_config(),
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently active.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Backend connections opened by sessions.
    pub backends_opened: AtomicU64,
    /// Frontend messages dropped for lack of a backend.
    pub messages_dropped: AtomicU64,
    /// Sessions that ended because of an error.
    pub sessions_failed: AtomicU64,
    /// Bytes relayed to backends.
    pub bytes_to_backend: AtomicU64,
    /// Bytes relayed from backends.
    pub bytes_from_backend: AtomicU64,
}

impl ListenerStats {
    fn record(&self, report: &SessionReport) {
        self.backends_opened
            .fetch_add(report.session.backends_opened, Ordering::Relaxed);
        self.messages_dropped
            .fetch_add(report.session.messages_dropped, Ordering::Relaxed);
        self.bytes_to_backend
            .fetch_add(report.traffic.bytes_to_backends, Ordering::Relaxed);
        self.bytes_from_backend
            .fetch_add(report.traffic.bytes_from_backends, Ordering::Relaxed);
        if report.close_reason.is_some() {
            self.sessions_failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// A TCP listener feeding relay sessions.
pub struct Listener {
    config: ListenerConfig,
    listener: TcpListener,
    pool: Arc<UpstreamPool>,
    conn_semaphore: Arc<Semaphore>,
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Bind a new listener.
    pub async fn bind(config: ListenerConfig, pool: Arc<UpstreamPool>) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            upstreams = pool.len(),
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            listener,
            config,
            pool,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Accept connections until the task is dropped.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats
                                .connections_rejected
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                            continue;
                        }
                    };

                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let listener = Arc::clone(&self);
                    let stats = Arc::clone(&self.stats);

                    tokio::spawn(
                        async move {
                            match listener.handle_connection(stream, peer_addr).await {
                                Ok(report) => stats.record(&report),
                                Err(e) => debug!(error = %e, "Connection error"),
                            }

                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                            drop(permit);
                        }
                        .instrument(tracing::info_span!("session", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid a tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Run one session to completion.
    async fn handle_connection(&self, client: TcpStream, peer_addr: SocketAddr) -> io::Result<SessionReport> {
        let local_addr = client.local_addr()?;
        client.set_nodelay(true)?;
        debug!(local_addr = %local_addr, "Handling connection");

        let protocol = match self.config.proxy_header {
            ProxyHeaderMode::V2 => Passthrough::with_header(ProxyHeader::new(peer_addr, local_addr).encode()),
            ProxyHeaderMode::Off => Passthrough::new(),
        };

        let buffers = &self.config.session.connect;
        let session = Session::new(
            BufferedPort::new(buffers.in_buffer, buffers.out_buffer),
            protocol,
            UpstreamConnector::new(Arc::clone(&self.pool)),
            self.config.session.clone(),
        );

        let report = Reactor::new(client, session, self.config.idle_timeout).run().await;
        debug!(
            bytes_from_client = report.traffic.bytes_from_frontend,
            bytes_to_client = report.traffic.bytes_to_frontend,
            close_reason = report.close_reason.unwrap_or("none"),
            "Session closed"
        );
        Ok(report)
    }
}
