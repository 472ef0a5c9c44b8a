//! TCP listener and connection handling.
//!
//! One listener per service group (listen port). Each accepted connection
//! is handled on its own task: read the header, inspect it for SNI, pick a
//! service, and hand the connection to a [`Session`].
//!
//! Nothing that happens to a single connection stops the accept loop.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, field, info, warn, Instrument, Span};

use super::router::{RoutingDecision, ServiceGroup};
use super::session::{Session, SessionId};
use super::sni::{SniConfig, SniInspector, SniResult};

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Pause after a failed accept before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Configuration shared by every listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// SNI inspection configuration.
    pub sni_config: SniConfig,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            sni_config: SniConfig::default(),
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Total connections currently active.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Header reads that failed with an I/O error.
    pub header_read_failed: AtomicU64,
    /// SNI extraction successes.
    pub sni_found: AtomicU64,
    /// Connections routed by SNI.
    pub routes_by_sni: AtomicU64,
    /// Connections routed to the default service.
    pub routes_default: AtomicU64,
    /// Connections dropped for lack of a route.
    pub routes_missed: AtomicU64,
    /// Backend dial attempts.
    pub dial_attempts: AtomicU64,
    /// Backend dial failures.
    pub dial_failed: AtomicU64,
    /// Bytes proxied to backend.
    pub bytes_to_backend: AtomicU64,
    /// Bytes proxied from backend.
    pub bytes_from_backend: AtomicU64,
}

/// Accept loop for one service group.
pub struct Listener {
    /// The TCP listener.
    listener: TcpListener,
    /// Routes for this port. Never changes.
    group: Arc<ServiceGroup>,
    /// Connection semaphore for limiting concurrent connections.
    conn_semaphore: Arc<Semaphore>,
    /// SNI inspector.
    sni_inspector: SniInspector,
    /// Per-port connection counter for session ids.
    next_seq: AtomicU64,
    /// Statistics.
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Bind the group's listen address.
    pub async fn bind(group: Arc<ServiceGroup>, config: ListenerConfig) -> io::Result<Self> {
        let bind_addr = group.listen_addr();
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| io::Error::new(e.kind(), format!("bind {}: {}", bind_addr, e)))?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            routes = %group,
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            sni_inspector: SniInspector::with_config(config.sni_config),
            listener,
            group,
            next_seq: AtomicU64::new(0),
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The routes served on this port.
    pub fn group(&self) -> &Arc<ServiceGroup> {
        &self.group
    }

    /// Get listener statistics.
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Run the listener, accepting and handling connections.
    ///
    /// Only returns if the bound socket itself becomes unusable.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;

                    // Try to acquire a permit
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
                    let span = tracing::info_span!(
                        "connection",
                        peer = %peer_addr,
                        port = local_addr.port(),
                        session_id = field::Empty,
                    );

                    tokio::spawn(
                        async move {
                            if let Err(e) = listener.handle_connection(stream, peer_addr, seq).await
                            {
                                debug!(
                                    peer_addr = %peer_addr,
                                    error = %e,
                                    "Connection error"
                                );
                            }

                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                            drop(permit);
                        }
                        .instrument(span),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }

    /// Handle a single connection.
    async fn handle_connection(
        &self,
        mut client: TcpStream,
        peer_addr: SocketAddr,
        seq: u64,
    ) -> io::Result<()> {
        let local_addr = client.local_addr()?;
        debug!(peer_addr = %peer_addr, local_addr = %local_addr, "Handling connection");

        // Buffer for SNI inspection (will be forwarded to backend)
        let mut header = Vec::new();
        let result = match self.sni_inspector.inspect(&mut client, &mut header).await {
            Ok(result) => result,
            Err(e) => {
                self.stats
                    .header_read_failed
                    .fetch_add(1, Ordering::Relaxed);
                warn!(
                    connection = seq,
                    peer_addr = %peer_addr,
                    local_addr = %local_addr,
                    error = %e,
                    "TCP read error while reading SNI header"
                );
                return Ok(());
            }
        };

        match &result {
            SniResult::Found(hostname) => {
                self.stats.sni_found.fetch_add(1, Ordering::Relaxed);
                debug!(hostname = %hostname, "SNI extracted");
            }
            other => debug!(result = ?other, header_len = header.len(), "No SNI"),
        }
        let sni = result.hostname().map(str::to_string);

        let service = match self.group.route(sni.as_deref()) {
            RoutingDecision::Matched { service, by_sni } => {
                let counter = if by_sni {
                    &self.stats.routes_by_sni
                } else {
                    &self.stats.routes_default
                };
                counter.fetch_add(1, Ordering::Relaxed);
                service
            }
            RoutingDecision::NoMatch { reason } => {
                self.stats.routes_missed.fetch_add(1, Ordering::Relaxed);
                info!(
                    connection = seq,
                    peer_addr = %peer_addr,
                    reason = %reason,
                    "No route, closing connection"
                );
                return Ok(());
            }
        };

        let id = SessionId::new(service.id, seq);
        Span::current().record("session_id", field::display(&id));

        Session::new(id, client, peer_addr, header, service, sni)
            .run(&self.stats)
            .await
    }
}
