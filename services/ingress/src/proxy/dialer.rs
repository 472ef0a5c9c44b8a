//! Outbound backend connections.
//!
//! Every session dials its service's backend afresh: there is no pooling
//! and no health tracking. A failed dial only ends the session that asked
//! for it.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::router::{RouteTable, ServiceDefinition, DEFAULT_DIAL_TIMEOUT};

/// Opens backend connections with a timeout and an optional local bind
/// address (for multi-homed egress routing).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dialer {
    /// Connect timeout.
    pub timeout: Duration,
    /// Local address to bind before connecting.
    pub local_addr: Option<SocketAddr>,
}

impl Default for Dialer {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_DIAL_TIMEOUT,
            local_addr: None,
        }
    }
}

impl Dialer {
    /// Dialer carrying a service's timeout and local address.
    pub fn for_service(service: &ServiceDefinition) -> Self {
        Self {
            timeout: service.dial_timeout,
            local_addr: service.dial_from,
        }
    }

    /// Connect to `addr`.
    pub async fn connect(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };

        if let Some(local_addr) = self.local_addr {
            socket.bind(local_addr)?;
        }

        debug!(dial_addr = %addr, local_addr = ?self.local_addr, "Connecting to backend");

        match timeout(self.timeout, socket.connect(addr)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
        }
    }
}

/// Try to reach every backend once at startup.
///
/// Unreachable backends are reported as warnings only; they may come up
/// after the proxy does. Returns the number of unreachable services.
pub async fn probe_backends(table: &RouteTable) -> usize {
    let mut unreachable = 0;

    for service in table.services() {
        let dialer = Dialer::for_service(&service);
        match dialer.connect(service.dial_addr).await {
            Ok(stream) => {
                drop(stream);
                info!(
                    service_id = service.id,
                    dial_addr = %service.dial_addr,
                    default_route = service.is_default(),
                    "Backend reachable"
                );
            }
            Err(e) => {
                unreachable += 1;
                warn!(
                    service_id = service.id,
                    dial_addr = %service.dial_addr,
                    error = %e,
                    "SERVICE_{}_DIAL: can't connect right now",
                    service.id
                );
            }
        }
    }

    unreachable
}
