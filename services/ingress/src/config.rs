//! Proxy configuration.
//!
//! Everything comes from environment variables. Services occupy numbered
//! slots `SERVICE_<i>_*` for `i` in `0..SERVICE_COUNT`.

use std::net::SocketAddr;
use std::time::Duration;

use tcpgate_networking::{parse_duration, resolve_tcp_addr};

use crate::error::ConfigError;
use crate::proxy::{
    ListenerConfig, RouteTable, ServiceEntry, SniConfig, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_MAX_SNIFF_BYTES, DEFAULT_SNIFF_TIMEOUT,
};

/// Number of service slots scanned when `SERVICE_COUNT` is unset.
pub const DEFAULT_SERVICE_COUNT: usize = 10;

/// Bounds for `SNIFF_MAX_BYTES`.
const MIN_SNIFF_BYTES: usize = 64;
const MAX_SNIFF_BYTES: usize = 16384;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Proxy configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of service slots scanned.
    pub service_count: usize,

    /// Raw service slots, in slot order. Includes empty slots.
    pub services: Vec<ServiceEntry>,

    /// Local address for every outbound dial.
    pub dial_from: Option<SocketAddr>,

    /// Verbose per-connection tracing.
    pub debug_log: bool,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// How long to wait for a connection's initial bytes.
    pub sniff_timeout: Duration,

    /// Maximum initial bytes read for SNI inspection.
    pub sniff_max_bytes: usize,

    /// Maximum concurrent connections per listener.
    pub max_connections: usize,
}

/// Boolean-ish flag values.
fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "t" | "y" | "true" | "yes" | "on"
    )
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Unset and empty mean the same thing.
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let parse_usize = |key: &str, default: usize| -> Result<usize, ConfigError> {
            match get(key) {
                Some(value) => value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| ConfigError::InvalidInteger {
                        var: key.to_string(),
                        value,
                    }),
                None => Ok(default),
            }
        };

        let service_count = parse_usize("SERVICE_COUNT", DEFAULT_SERVICE_COUNT)?;

        let dial_from = match get("DIAL_FROM") {
            Some(value) => Some(resolve_tcp_addr(&value).map_err(|source| {
                ConfigError::InvalidAddress {
                    var: "DIAL_FROM".to_string(),
                    value: value.clone(),
                    hint: "try '<ip_address>:'",
                    source,
                }
            })?),
            None => None,
        };

        let services = (0..service_count)
            .map(|slot| ServiceEntry {
                slot,
                listen: get(&format!("SERVICE_{}_LISTEN", slot)).unwrap_or_default(),
                dial: get(&format!("SERVICE_{}_DIAL", slot)).unwrap_or_default(),
                sni: get(&format!("SERVICE_{}_SNI", slot)),
                dial_timeout: get(&format!("SERVICE_{}_DIAL_TIMEOUT", slot)),
            })
            .collect();

        let debug_log = get("DEBUG_LOG").map(|v| is_truthy(&v)).unwrap_or(false);

        let log_level = get("LOG_LEVEL").unwrap_or_else(|| {
            if debug_log {
                "debug".to_string()
            } else {
                "info".to_string()
            }
        });

        let log_format = match get("LOG_FORMAT").map(|v| v.trim().to_ascii_lowercase()) {
            Some(v) if v == "pretty" || v == "text" => LogFormat::Pretty,
            _ => LogFormat::Json,
        };

        let sniff_timeout = match get("SNIFF_TIMEOUT") {
            Some(value) => {
                let timeout =
                    parse_duration(&value).map_err(|source| ConfigError::InvalidDuration {
                        var: "SNIFF_TIMEOUT".to_string(),
                        value: value.clone(),
                        source,
                    })?;
                if timeout.is_zero() {
                    return Err(ConfigError::ZeroDuration {
                        var: "SNIFF_TIMEOUT".to_string(),
                    });
                }
                timeout
            }
            None => DEFAULT_SNIFF_TIMEOUT,
        };

        let sniff_max_bytes = parse_usize("SNIFF_MAX_BYTES", DEFAULT_MAX_SNIFF_BYTES)?
            .clamp(MIN_SNIFF_BYTES, MAX_SNIFF_BYTES);

        let max_connections = parse_usize("MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)?.max(1);

        Ok(Self {
            service_count,
            services,
            dial_from,
            debug_log,
            log_level,
            log_format,
            sniff_timeout,
            sniff_max_bytes,
            max_connections,
        })
    }

    /// Validate the service slots and build the route table.
    pub fn route_table(&self) -> Result<RouteTable, ConfigError> {
        let table = RouteTable::from_entries(&self.services, self.dial_from)?;
        if table.is_empty() {
            return Err(ConfigError::NoServices {
                service_count: self.service_count,
            });
        }
        Ok(table)
    }

    /// Listener settings.
    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            max_connections: self.max_connections,
            sni_config: SniConfig {
                timeout: self.sniff_timeout,
                max_bytes: self.sniff_max_bytes,
            },
        }
    }
}
