//! Route table and routing decisions.
//!
//! The route table is built once at startup from the configured service
//! entries and never changes afterwards. Listeners share it through an `Arc`
//! and read it without locks.
//!
//! Routing rules:
//! - Services are grouped by listen port; one listener per group
//! - Exact hostname match on the ClientHello SNI
//! - Hostnames normalized to lowercase, trailing dot trimmed
//! - No SNI, or an SNI nobody claims, falls back to the group's default
//!   service (the one configured without SNI), if any
//! - At most one default service per group

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tcpgate_networking::{is_loopback_form, resolve_tcp_addr};
use tracing::{debug, warn};

use crate::error::ConfigError;

/// Default dial timeout for backend connections.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Normalize a hostname for matching.
///
/// - Convert to lowercase
/// - Trim trailing dot
pub fn normalize_hostname(hostname: &str) -> String {
    hostname.trim().to_lowercase().trim_end_matches('.').to_string()
}

/// Raw, unvalidated settings for one service slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceEntry {
    /// Slot index (`SERVICE_<slot>_*`).
    pub slot: usize,
    pub listen: String,
    pub dial: String,
    pub sni: Option<String>,
    pub dial_timeout: Option<String>,
}

impl ServiceEntry {
    /// A slot is usable only when both listen and dial are set.
    pub fn is_complete(&self) -> bool {
        !self.listen.trim().is_empty() && !self.dial.trim().is_empty()
    }

    /// A slot with exactly one of listen/dial set is probably a typo.
    pub fn is_partial(&self) -> bool {
        !self.is_complete() && (!self.listen.trim().is_empty() || !self.dial.trim().is_empty())
    }
}

/// One configured route: a listen address, a backend dial address, and the
/// SNI hostname (or none) that selects it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDefinition {
    /// Ordinal id (the configuration slot).
    pub id: usize,
    /// Address to accept client connections on.
    pub listen_addr: SocketAddr,
    /// Backend address to relay to.
    pub dial_addr: SocketAddr,
    /// Normalized SNI hostname; `None` makes this the default route.
    pub sni: Option<String>,
    /// Timeout for establishing the backend connection.
    pub dial_timeout: Duration,
    /// Local address to bind outbound connections to.
    pub dial_from: Option<SocketAddr>,
}

impl ServiceDefinition {
    /// Create a default-route service with the default dial timeout.
    pub fn new(id: usize, listen_addr: SocketAddr, dial_addr: SocketAddr) -> Self {
        Self {
            id,
            listen_addr,
            dial_addr,
            sni: None,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            dial_from: None,
        }
    }

    /// Route this service by SNI hostname. An empty hostname keeps it the
    /// default route.
    pub fn with_sni(mut self, hostname: &str) -> Self {
        let normalized = normalize_hostname(hostname);
        self.sni = (!normalized.is_empty()).then_some(normalized);
        self
    }

    pub fn with_dial_timeout(mut self, dial_timeout: Duration) -> Self {
        self.dial_timeout = dial_timeout;
        self
    }

    pub fn with_dial_from(mut self, dial_from: Option<SocketAddr>) -> Self {
        self.dial_from = dial_from;
        self
    }

    /// Validate a raw service entry.
    ///
    /// Rejects loopback listen addresses, resolves both addresses and parses
    /// the optional dial timeout.
    pub fn from_entry(
        entry: &ServiceEntry,
        dial_from: Option<SocketAddr>,
    ) -> Result<Self, ConfigError> {
        let slot = entry.slot;
        let listen = entry.listen.trim();
        let dial = entry.dial.trim();

        if is_loopback_form(listen) {
            return Err(ConfigError::LoopbackListen {
                slot,
                value: listen.to_string(),
            });
        }

        let listen_addr =
            resolve_tcp_addr(listen).map_err(|source| ConfigError::InvalidAddress {
                var: format!("SERVICE_{}_LISTEN", slot),
                value: listen.to_string(),
                hint: "try ':<port>'",
                source,
            })?;

        // Catches hostnames that resolve to loopback.
        if listen_addr.ip().is_loopback() {
            return Err(ConfigError::LoopbackListen {
                slot,
                value: listen.to_string(),
            });
        }

        let dial_addr = resolve_tcp_addr(dial).map_err(|source| ConfigError::InvalidAddress {
            var: format!("SERVICE_{}_DIAL", slot),
            value: dial.to_string(),
            hint: "try '<hostname>:<port>'",
            source,
        })?;

        let dial_timeout = match entry.dial_timeout.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => {
                let var = format!("SERVICE_{}_DIAL_TIMEOUT", slot);
                let timeout = tcpgate_networking::parse_duration(raw).map_err(|source| {
                    ConfigError::InvalidDuration {
                        var: var.clone(),
                        value: raw.to_string(),
                        source,
                    }
                })?;
                if timeout.is_zero() {
                    return Err(ConfigError::ZeroDuration { var });
                }
                timeout
            }
            _ => DEFAULT_DIAL_TIMEOUT,
        };

        Ok(Self::new(slot, listen_addr, dial_addr)
            .with_sni(entry.sni.as_deref().unwrap_or_default())
            .with_dial_timeout(dial_timeout)
            .with_dial_from(dial_from))
    }

    /// True when this service is its port's default (no-SNI) route.
    pub fn is_default(&self) -> bool {
        self.sni.is_none()
    }
}

/// Result of a routing decision.
#[derive(Debug, Clone)]
pub enum RoutingDecision {
    /// Service found, proceed with the connection.
    Matched {
        service: Arc<ServiceDefinition>,
        /// False when the default route was used.
        by_sni: bool,
    },
    /// No SNI match and no default service.
    NoMatch { reason: String },
}

/// All services sharing one listen port.
#[derive(Debug, Clone)]
pub struct ServiceGroup {
    listen_addr: SocketAddr,
    by_sni: HashMap<String, Arc<ServiceDefinition>>,
    default: Option<Arc<ServiceDefinition>>,
}

impl ServiceGroup {
    /// Create an empty group bound to `listen_addr`.
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            by_sni: HashMap::new(),
            default: None,
        }
    }

    /// Build a group from services that all share one listen address.
    pub fn from_services(
        listen_addr: SocketAddr,
        services: impl IntoIterator<Item = ServiceDefinition>,
    ) -> Result<Self, ConfigError> {
        let mut group = Self::new(listen_addr);
        for service in services {
            group.insert(service)?;
        }
        Ok(group)
    }

    /// Add a service, rejecting a second default or a repeated hostname.
    pub fn insert(&mut self, service: ServiceDefinition) -> Result<(), ConfigError> {
        let port = self.listen_addr.port();

        if service.listen_addr != self.listen_addr {
            return Err(ConfigError::ConflictingListen {
                slot: service.id,
                port,
                addr: service.listen_addr,
                existing_addr: self.listen_addr,
            });
        }

        match &service.sni {
            None => {
                if let Some(existing) = &self.default {
                    return Err(ConfigError::AmbiguousDefault {
                        slot: service.id,
                        port,
                        existing: existing.id,
                    });
                }
                self.default = Some(Arc::new(service));
            }
            Some(hostname) => {
                if let Some(existing) = self.by_sni.get(hostname) {
                    return Err(ConfigError::DuplicateSni {
                        slot: service.id,
                        port,
                        hostname: hostname.clone(),
                        existing: existing.id,
                    });
                }
                self.by_sni.insert(hostname.clone(), Arc::new(service));
            }
        }

        Ok(())
    }

    /// Address the group's listener binds to.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn port(&self) -> u16 {
        self.listen_addr.port()
    }

    /// The service used when no SNI matches.
    pub fn default_service(&self) -> Option<&Arc<ServiceDefinition>> {
        self.default.as_ref()
    }

    /// Look up a service by exact (normalized) hostname.
    pub fn service_for_sni(&self, hostname: &str) -> Option<&Arc<ServiceDefinition>> {
        self.by_sni.get(&normalize_hostname(hostname))
    }

    /// All services in the group, ordered by id.
    pub fn services(&self) -> Vec<Arc<ServiceDefinition>> {
        let mut services: Vec<_> = self
            .by_sni
            .values()
            .chain(self.default.iter())
            .cloned()
            .collect();
        services.sort_by_key(|s| s.id);
        services
    }

    pub fn len(&self) -> usize {
        self.by_sni.len() + usize::from(self.default.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pick the service for a connection presenting `sni`.
    pub fn route(&self, sni: Option<&str>) -> RoutingDecision {
        let port = self.port();

        if let Some(hostname) = sni {
            if let Some(service) = self.service_for_sni(hostname) {
                debug!(
                    service_id = service.id,
                    hostname = %hostname,
                    port = port,
                    "Route matched by SNI"
                );
                return RoutingDecision::Matched {
                    service: Arc::clone(service),
                    by_sni: true,
                };
            }
        }

        match &self.default {
            Some(service) => {
                debug!(
                    service_id = service.id,
                    sni = ?sni,
                    port = port,
                    "Route matched by default service"
                );
                RoutingDecision::Matched {
                    service: Arc::clone(service),
                    by_sni: false,
                }
            }
            None => RoutingDecision::NoMatch {
                reason: match sni {
                    Some(hostname) => format!(
                        "No service for hostname '{}' on port {} and no default",
                        normalize_hostname(hostname),
                        port
                    ),
                    None => format!("No SNI presented and no default service on port {}", port),
                },
            },
        }
    }
}

impl fmt::Display for ServiceGroup {
    /// Renders `sni='a.example' -> 10.0.0.2:443, <default> -> 10.0.0.3:443`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sni_routes: Vec<_> = self.by_sni.iter().collect();
        sni_routes.sort_by(|a, b| a.0.cmp(b.0));

        let mut first = true;
        for (hostname, service) in sni_routes {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            write!(f, "sni='{}' -> {}", hostname, service.dial_addr)?;
        }
        if let Some(service) = &self.default {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "<default> -> {}", service.dial_addr)?;
        }
        Ok(())
    }
}

/// Routing table: one service group per listen port.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    groups: Vec<Arc<ServiceGroup>>,
}

impl RouteTable {
    /// Group validated services by listen port.
    pub fn build(services: impl IntoIterator<Item = ServiceDefinition>) -> Result<Self, ConfigError> {
        let mut by_port: BTreeMap<u16, ServiceGroup> = BTreeMap::new();

        for service in services {
            by_port
                .entry(service.listen_addr.port())
                .or_insert_with(|| ServiceGroup::new(service.listen_addr))
                .insert(service)?;
        }

        Ok(Self {
            groups: by_port.into_values().map(Arc::new).collect(),
        })
    }

    /// Validate raw entries in slot order and build the table.
    ///
    /// Slots with only one of listen/dial set are skipped with a warning.
    pub fn from_entries(
        entries: &[ServiceEntry],
        dial_from: Option<SocketAddr>,
    ) -> Result<Self, ConfigError> {
        let mut services = Vec::with_capacity(entries.len());

        for entry in entries {
            if entry.is_partial() {
                warn!(
                    slot = entry.slot,
                    listen = %entry.listen,
                    dial = %entry.dial,
                    "Skipping service: both SERVICE_{}_LISTEN and SERVICE_{}_DIAL are required",
                    entry.slot,
                    entry.slot
                );
                continue;
            }
            if !entry.is_complete() {
                continue;
            }
            services.push(ServiceDefinition::from_entry(entry, dial_from)?);
        }

        Self::build(services)
    }

    /// Service groups ordered by port.
    pub fn groups(&self) -> &[Arc<ServiceGroup>] {
        &self.groups
    }

    /// Get the group bound to a port.
    pub fn group_for_port(&self, port: u16) -> Option<&Arc<ServiceGroup>> {
        self.groups.iter().find(|g| g.port() == port)
    }

    /// All configured listen ports.
    pub fn ports(&self) -> Vec<u16> {
        self.groups.iter().map(|g| g.port()).collect()
    }

    /// Every service in the table, ordered by id.
    pub fn services(&self) -> Vec<Arc<ServiceDefinition>> {
        let mut services: Vec<_> = self.groups.iter().flat_map(|g| g.services()).collect();
        services.sort_by_key(|s| s.id);
        services
    }

    /// Total number of services.
    pub fn len(&self) -> usize {
        self.groups.iter().map(|g| g.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn entry(slot: usize, listen: &str, dial: &str, sni: Option<&str>) -> ServiceEntry {
        ServiceEntry {
            slot,
            listen: listen.to_string(),
            dial: dial.to_string(),
            sni: sni.map(str::to_string),
            dial_timeout: None,
        }
    }

    fn sample_group() -> ServiceGroup {
        let listen = addr("0.0.0.0:443");
        ServiceGroup::from_services(
            listen,
            vec![
                ServiceDefinition::new(0, listen, addr("10.0.0.1:443")).with_sni("a.example"),
                ServiceDefinition::new(1, listen, addr("10.0.0.2:443")).with_sni("b.example"),
                ServiceDefinition::new(2, listen, addr("10.0.0.3:443")),
            ],
        )
        .unwrap()
    }

    fn matched_id(decision: RoutingDecision) -> usize {
        match decision {
            RoutingDecision::Matched { service, .. } => service.id,
            other => panic!("Expected Matched, got {:?}", other),
        }
    }

    #[test]
    fn test_normalize_hostname() {
        assert_eq!(normalize_hostname("Example.COM"), "example.com");
        assert_eq!(normalize_hostname("example.com."), "example.com");
        assert_eq!(normalize_hostname("EXAMPLE.COM."), "example.com");
    }

    #[test]
    fn test_route_by_sni_and_default() {
        let group = sample_group();

        assert_eq!(matched_id(group.route(Some("a.example"))), 0);
        assert_eq!(matched_id(group.route(Some("B.Example."))), 1);
        assert_eq!(matched_id(group.route(None)), 2);
        assert_eq!(matched_id(group.route(Some("unknown.example"))), 2);

        match group.route(Some("a.example")) {
            RoutingDecision::Matched { by_sni, .. } => assert!(by_sni),
            other => panic!("Expected Matched, got {:?}", other),
        }
    }

    #[test]
    fn test_route_without_default() {
        let listen = addr("0.0.0.0:443");
        let group = ServiceGroup::from_services(
            listen,
            vec![ServiceDefinition::new(0, listen, addr("10.0.0.1:443")).with_sni("a.example")],
        )
        .unwrap();

        assert!(matches!(group.route(None), RoutingDecision::NoMatch { .. }));
        assert!(matches!(
            group.route(Some("b.example")),
            RoutingDecision::NoMatch { .. }
        ));
        assert_eq!(matched_id(group.route(Some("a.example"))), 0);
    }

    #[test]
    fn test_empty_sni_is_default() {
        let service = ServiceDefinition::new(0, addr("0.0.0.0:1"), addr("10.0.0.1:1")).with_sni("");
        assert!(service.is_default());
    }

    #[test]
    fn test_two_defaults_on_one_port_rejected() {
        let err = RouteTable::from_entries(
            &[
                entry(0, ":9000", "10.0.0.1:80", None),
                entry(1, ":9000", "10.0.0.2:80", Some("")),
            ],
            None,
        )
        .unwrap_err();

        assert!(matches!(
            err,
            ConfigError::AmbiguousDefault {
                slot: 1,
                port: 9000,
                existing: 0
            }
        ));
        assert!(err.is_routing_conflict());
    }

    #[test]
    fn test_defaults_on_different_ports_allowed() {
        let table = RouteTable::from_entries(
            &[
                entry(0, ":9000", "10.0.0.1:80", None),
                entry(1, ":9001", "10.0.0.2:80", None),
            ],
            None,
        )
        .unwrap();

        assert_eq!(table.ports(), vec![9000, 9001]);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_duplicate_sni_rejected() {
        let err = RouteTable::from_entries(
            &[
                entry(0, ":443", "10.0.0.1:443", Some("a.example")),
                entry(3, ":443", "10.0.0.2:443", Some("A.EXAMPLE")),
            ],
            None,
        )
        .unwrap_err();

        assert!(matches!(err, ConfigError::DuplicateSni { slot: 3, .. }));
    }

    #[test]
    fn test_conflicting_listen_host_rejected() {
        let err = RouteTable::from_entries(
            &[
                entry(0, ":443", "10.0.0.1:443", Some("a.example")),
                entry(1, "10.9.9.9:443", "10.0.0.2:443", Some("b.example")),
            ],
            None,
        )
        .unwrap_err();

        assert!(matches!(err, ConfigError::ConflictingListen { slot: 1, .. }));
    }

    #[test]
    fn test_loopback_listen_rejected() {
        let err = ServiceDefinition::from_entry(&entry(4, "127.0.0.1:9000", "10.0.0.1:80", None), None)
            .unwrap_err();
        assert!(matches!(err, ConfigError::LoopbackListen { slot: 4, .. }));

        let err = ServiceDefinition::from_entry(&entry(5, "localhost:9000", "10.0.0.1:80", None), None)
            .unwrap_err();
        assert!(matches!(err, ConfigError::LoopbackListen { slot: 5, .. }));

        let ok = ServiceDefinition::from_entry(&entry(6, ":9000", "10.0.0.1:80", None), None).unwrap();
        assert_eq!(ok.listen_addr, addr("0.0.0.0:9000"));
        assert_eq!(ok.dial_timeout, DEFAULT_DIAL_TIMEOUT);
    }

    #[test]
    fn test_invalid_addresses_name_the_field() {
        let err = ServiceDefinition::from_entry(&entry(2, "nope", "10.0.0.1:80", None), None)
            .unwrap_err();
        assert!(err.to_string().starts_with("SERVICE_2_LISTEN"));

        let err = ServiceDefinition::from_entry(&entry(2, ":80", "10.0.0.1", None), None).unwrap_err();
        assert!(err.to_string().starts_with("SERVICE_2_DIAL"));
    }

    #[test]
    fn test_dial_timeout_and_dial_from() {
        let mut e = entry(1, ":9000", "10.0.0.1:80", Some("Db.Example."));
        e.dial_timeout = Some("250ms".to_string());
        let dial_from = Some(addr("10.0.0.5:0"));

        let service = ServiceDefinition::from_entry(&e, dial_from).unwrap();
        assert_eq!(service.dial_timeout, Duration::from_millis(250));
        assert_eq!(service.dial_from, dial_from);
        assert_eq!(service.sni.as_deref(), Some("db.example"));

        e.dial_timeout = Some("soon".to_string());
        let err = ServiceDefinition::from_entry(&e, None).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDuration { .. }));

        e.dial_timeout = Some("0s".to_string());
        let err = ServiceDefinition::from_entry(&e, None).unwrap_err();
        assert!(matches!(err, ConfigError::ZeroDuration { .. }));
    }

    #[test]
    fn test_partial_entries_skipped() {
        let table = RouteTable::from_entries(
            &[
                entry(0, ":9000", "", None),
                entry(1, "", "", None),
                entry(2, ":9001", "10.0.0.1:80", None),
            ],
            None,
        )
        .unwrap();

        assert_eq!(table.len(), 1);
        assert_eq!(table.services()[0].id, 2);
        assert!(table.group_for_port(9000).is_none());
        assert!(table.group_for_port(9001).is_some());
    }

    #[test]
    fn test_group_display() {
        let group = sample_group();
        assert_eq!(
            group.to_string(),
            "sni='a.example' -> 10.0.0.1:443, sni='b.example' -> 10.0.0.2:443, <default> -> 10.0.0.3:443"
        );
    }
}
