//! Networking helpers for tcpgate.
//!
//! This library provides helpers for:
//! - Parsing TCP addresses in the `host:port` forms operators write by hand
//!   (`":443"` for all interfaces, `"10.0.0.5:"` for any local port)
//! - Detecting loopback addresses
//! - Parsing duration strings such as `"5s"`, `"250ms"` or `"1m30s"`
//!   (via `humantime`)

use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Address is not in `host:port` form.
    #[error("missing port in address '{0}'")]
    MissingPort(String),

    /// Port is not a number in 0..=65535.
    #[error("invalid port '{port}' in address '{addr}'")]
    InvalidPort { addr: String, port: String },

    /// Hostname could not be resolved.
    #[error("could not resolve '{addr}': {source}")]
    Resolve {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Hostname resolved to nothing.
    #[error("'{0}' resolved to no addresses")]
    NoAddresses(String),

    /// Duration string is malformed.
    #[error("invalid duration '{value}': {source}")]
    InvalidDuration {
        value: String,
        #[source]
        source: humantime::DurationError,
    },
}

// ============================================================================
// TCP addresses
// ============================================================================

/// Split `host:port` into its parts.
///
/// Accepts bracketed IPv6 hosts (`[::1]:80`). Either part may be empty.
fn split_host_port(addr: &str) -> Result<(&str, &str), NetworkError> {
    if let Some(rest) = addr.strip_prefix('[') {
        let Some((host, tail)) = rest.split_once(']') else {
            return Err(NetworkError::MissingPort(addr.to_string()));
        };
        let Some(port) = tail.strip_prefix(':') else {
            return Err(NetworkError::MissingPort(addr.to_string()));
        };
        return Ok((host, port));
    }

    let Some((host, port)) = addr.rsplit_once(':') else {
        return Err(NetworkError::MissingPort(addr.to_string()));
    };

    // Unbracketed IPv6 literals are ambiguous.
    if host.contains(':') {
        return Err(NetworkError::MissingPort(addr.to_string()));
    }

    Ok((host, port))
}

/// Parse and resolve a TCP address.
///
/// - An empty host means all interfaces (`0.0.0.0`).
/// - An empty port means port 0 (let the OS pick), which is what a local
///   bind address for outbound connections wants.
/// - Hostnames are resolved through the system resolver, preferring IPv4.
pub fn resolve_tcp_addr(addr: &str) -> Result<SocketAddr, NetworkError> {
    let addr = addr.trim();
    let (host, port_str) = split_host_port(addr)?;

    let port = if port_str.is_empty() {
        0
    } else {
        port_str.parse::<u16>().map_err(|_| NetworkError::InvalidPort {
            addr: addr.to_string(),
            port: port_str.to_string(),
        })?
    };

    if host.is_empty() {
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let resolved: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|source| NetworkError::Resolve {
            addr: addr.to_string(),
            source,
        })?
        .collect();

    resolved
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| resolved.first())
        .copied()
        .ok_or_else(|| NetworkError::NoAddresses(addr.to_string()))
}

/// Check whether an address string names the local loopback interface.
///
/// Matches `localhost` anywhere in the string as well as literal loopback
/// IPs (`127.0.0.0/8`, `::1`). Does not resolve hostnames.
pub fn is_loopback_form(addr: &str) -> bool {
    let addr = addr.trim();
    if addr.to_ascii_lowercase().contains("localhost") {
        return true;
    }

    match split_host_port(addr) {
        Ok((host, _)) => host
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false),
        Err(_) => false,
    }
}

// ============================================================================
// Durations
// ============================================================================

/// Parse a duration string such as `"5s"`, `"250ms"` or `"1m30s"`.
///
/// Accepts the humantime grammar: integer terms with units (`ns`, `us`,
/// `ms`, `s`, `m`, `h`, `d`, plus long forms like `sec`), optionally
/// space-separated. A bare `"0"` is zero.
pub fn parse_duration(input: &str) -> Result<Duration, NetworkError> {
    humantime::parse_duration(input.trim()).map_err(|source| NetworkError::InvalidDuration {
        value: input.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    #[test]
    fn test_resolve_all_interfaces() {
        let addr = resolve_tcp_addr(":9000").unwrap();
        assert_eq!(addr, "0.0.0.0:9000".parse().unwrap());
        assert!(addr.ip().is_unspecified());
    }

    #[test]
    fn test_resolve_literal_ips() {
        assert_eq!(
            resolve_tcp_addr("10.1.2.3:443").unwrap(),
            "10.1.2.3:443".parse().unwrap()
        );
        assert_eq!(
            resolve_tcp_addr("[fd00::1]:8443").unwrap(),
            SocketAddr::new(IpAddr::V6("fd00::1".parse::<Ipv6Addr>().unwrap()), 8443)
        );
    }

    #[test]
    fn test_resolve_empty_port_is_zero() {
        let addr = resolve_tcp_addr("192.168.1.20:").unwrap();
        assert_eq!(addr.port(), 0);
        assert_eq!(addr.ip(), "192.168.1.20".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_resolve_localhost_name() {
        let addr = resolve_tcp_addr("localhost:8080").unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 8080);
    }

    #[test]
    fn test_resolve_rejects_bad_input() {
        assert!(matches!(
            resolve_tcp_addr("9000"),
            Err(NetworkError::MissingPort(_))
        ));
        assert!(matches!(
            resolve_tcp_addr(":99999"),
            Err(NetworkError::InvalidPort { .. })
        ));
        assert!(matches!(
            resolve_tcp_addr("fd00::1:80"),
            Err(NetworkError::MissingPort(_))
        ));
        assert!(resolve_tcp_addr("no-such-host.invalid:80").is_err());
    }

    #[test]
    fn test_loopback_forms() {
        assert!(is_loopback_form("127.0.0.1:9000"));
        assert!(is_loopback_form("127.8.0.1:9000"));
        assert!(is_loopback_form("localhost:9000"));
        assert!(is_loopback_form("LocalHost:9000"));
        assert!(is_loopback_form("[::1]:9000"));

        assert!(!is_loopback_form(":9000"));
        assert!(!is_loopback_form("0.0.0.0:9000"));
        assert!(!is_loopback_form("10.0.0.1:9000"));
        assert!(!is_loopback_form("[::]:9000"));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("1m 30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("10us").unwrap(), Duration::from_micros(10));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        for bad in ["", "5", "s", "5x", "-5s", "5s3", "1..5s", "ms5"] {
            assert!(
                matches!(parse_duration(bad), Err(NetworkError::InvalidDuration { .. })),
                "expected error for {:?}",
                bad
            );
        }
    }
}
