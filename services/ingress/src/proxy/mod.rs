//! L4 TCP proxy implementation.
//!
//! This module provides:
//! - A static route table built once at startup
//! - TCP listener management, one listener per listen port
//! - SNI inspection for TLS passthrough
//! - Backend dialing
//! - Bidirectional byte relaying
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> SNI Inspector -> Service Group -> Dialer -> Backend
//!                                                           |
//!                                         Relay (header replayed first)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{ListenerConfig, Proxy, RouteTable};
//!
//! let table = RouteTable::from_entries(&entries, None)?;
//! let proxy = Proxy::bind(&table, ListenerConfig::default()).await?;
//! proxy.run().await?;
//! ```

mod dialer;
mod listener;
mod relay;
mod router;
mod session;
mod sni;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::error;

pub use dialer::{probe_backends, Dialer};
pub use listener::{Listener, ListenerConfig, ListenerStats, DEFAULT_MAX_CONNECTIONS};
pub use relay::{relay, RelayEnd, RelayOutcome, Side, RELAY_BUFFER_SIZE};
pub use router::{
    normalize_hostname, RouteTable, RoutingDecision, ServiceDefinition, ServiceEntry,
    ServiceGroup, DEFAULT_DIAL_TIMEOUT,
};
pub use session::{Session, SessionId};
pub use sni::{
    parse_sni, SniConfig, SniInspector, SniResult, DEFAULT_MAX_SNIFF_BYTES,
    DEFAULT_SNIFF_TIMEOUT,
};

/// Every listener of a route table, bound and ready to serve.
pub struct Proxy {
    listeners: Vec<Arc<Listener>>,
}

impl Proxy {
    /// Bind one listener per service group.
    ///
    /// Fails on the first address that cannot be bound; nothing is served
    /// until every group has its socket.
    pub async fn bind(table: &RouteTable, config: ListenerConfig) -> io::Result<Self> {
        let mut listeners = Vec::with_capacity(table.groups().len());
        for group in table.groups() {
            let listener = Listener::bind(Arc::clone(group), config.clone()).await?;
            listeners.push(Arc::new(listener));
        }
        Ok(Self { listeners })
    }

    /// Bound addresses, in port order.
    pub fn local_addrs(&self) -> io::Result<Vec<SocketAddr>> {
        self.listeners.iter().map(|l| l.local_addr()).collect()
    }

    /// Run every accept loop. Listeners run until the process exits, so
    /// this only returns if one of them fails.
    pub async fn run(self) -> io::Result<()> {
        let mut tasks = JoinSet::new();
        for listener in self.listeners {
            tasks.spawn(listener.run());
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "Listener error");
                    return Err(e);
                }
                Err(e) => {
                    error!(error = %e, "Listener task failed");
                    return Err(io::Error::other(e));
                }
            }
        }

        Ok(())
    }
}
