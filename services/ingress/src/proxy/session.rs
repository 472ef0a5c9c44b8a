//! One proxied client connection.
//!
//! A session is created once a connection has been routed. It owns the
//! client socket, the header bytes already consumed during SNI inspection,
//! and the selected service. `run` dials the backend, replays the header,
//! and relays until either side closes. Both sockets are dropped when `run`
//! returns, whatever the exit path.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::dialer::Dialer;
use super::listener::ListenerStats;
use super::relay::relay;
use super::router::ServiceDefinition;

/// Log correlation id: `<service id>_<per-port connection number>`.
///
/// Not globally unique; two ports can hand out the same pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId {
    pub service_id: usize,
    pub seq: u64,
}

impl SessionId {
    pub fn new(service_id: usize, seq: u64) -> Self {
        Self { service_id, seq }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.service_id, self.seq)
    }
}

/// A routed client connection waiting to be proxied.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub peer_addr: SocketAddr,
    /// SNI hostname presented by the client, if any.
    pub sni: Option<String>,
    pub service: Arc<ServiceDefinition>,
    client: TcpStream,
    header: Vec<u8>,
}

impl Session {
    pub fn new(
        id: SessionId,
        client: TcpStream,
        peer_addr: SocketAddr,
        header: Vec<u8>,
        service: Arc<ServiceDefinition>,
        sni: Option<String>,
    ) -> Self {
        Self {
            id,
            peer_addr,
            sni,
            service,
            client,
            header,
        }
    }

    /// Dial the backend and relay until either side closes.
    ///
    /// A dial failure is logged and ends the session without error.
    pub async fn run(self, stats: &ListenerStats) -> io::Result<()> {
        let Session {
            id,
            peer_addr,
            sni,
            service,
            client,
            header,
        } = self;
        let dial_addr = service.dial_addr;

        debug!(
            session_id = %id,
            peer_addr = %peer_addr,
            sni = ?sni,
            dial_addr = %dial_addr,
            "Starting proxying connection"
        );

        stats.dial_attempts.fetch_add(1, Ordering::Relaxed);
        let mut backend = match Dialer::for_service(&service).connect(dial_addr).await {
            Ok(stream) => stream,
            Err(e) => {
                stats.dial_failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    session_id = %id,
                    dial_addr = %dial_addr,
                    error = %e,
                    "Error dialing backend"
                );
                return Ok(());
            }
        };

        debug!(
            session_id = %id,
            backend_local_addr = ?backend.local_addr().ok(),
            dial_addr = %dial_addr,
            "Connected to backend"
        );

        // Forward the bytes consumed during SNI inspection
        if !header.is_empty() {
            backend.write_all(&header).await?;
            stats
                .bytes_to_backend
                .fetch_add(header.len() as u64, Ordering::Relaxed);
        }

        let outcome = relay(client, backend).await;

        stats
            .bytes_to_backend
            .fetch_add(outcome.bytes_to_backend, Ordering::Relaxed);
        stats
            .bytes_from_backend
            .fetch_add(outcome.bytes_to_client, Ordering::Relaxed);

        debug!(
            session_id = %id,
            ended_by = %outcome.end.side(),
            clean = outcome.end.is_clean(),
            bytes_to_backend = outcome.bytes_to_backend + header.len() as u64,
            bytes_from_backend = outcome.bytes_to_client,
            "Done proxying connection"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_display() {
        assert_eq!(SessionId::new(3, 17).to_string(), "3_17");
        assert_eq!(SessionId::new(0, 1).to_string(), "0_1");
    }
}
