//! Error types for startup configuration.
//!
//! Every variant is fatal: the process reports it and exits before any
//! listener binds. Connection-level failures are plain `io::Error`s and
//! never reach this type.

use tcpgate_networking::NetworkError;
use thiserror::Error;

/// Fatal configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An integer-valued variable could not be parsed.
    #[error("{var}: got '{value}', expected an integer")]
    InvalidInteger { var: String, value: String },

    /// A listen address points at the loopback interface.
    #[error(
        "SERVICE_{slot}_LISTEN: got '{value}'. listening on localhost won't accept \
         outside traffic, listen on all addresses like this: ':<port>'"
    )]
    LoopbackListen { slot: usize, value: String },

    /// An address failed to parse or resolve.
    #[error("{var}: got '{value}', expected a tcp address ({hint}): {source}")]
    InvalidAddress {
        var: String,
        value: String,
        hint: &'static str,
        #[source]
        source: NetworkError,
    },

    /// A duration failed to parse.
    #[error("{var}: got '{value}', expected a duration like '5s': {source}")]
    InvalidDuration {
        var: String,
        value: String,
        #[source]
        source: NetworkError,
    },

    /// A dial timeout of zero would fail every connection.
    #[error("{var}: dial timeout must be greater than zero")]
    ZeroDuration { var: String },

    /// Two services on one port both lack an SNI hostname.
    #[error(
        "SERVICE_{slot}: found multiple services listening on port {port} with no SNI \
         (Server Name Indication); service {existing} is already the default route"
    )]
    AmbiguousDefault {
        slot: usize,
        port: u16,
        existing: usize,
    },

    /// Two services on one port claim the same SNI hostname.
    #[error(
        "SERVICE_{slot}: SNI '{hostname}' on port {port} is already routed by service {existing}"
    )]
    DuplicateSni {
        slot: usize,
        port: u16,
        hostname: String,
        existing: usize,
    },

    /// Two services share a port but disagree on the listen host.
    #[error(
        "SERVICE_{slot}_LISTEN: '{addr}' conflicts with '{existing_addr}' already bound on port {port}"
    )]
    ConflictingListen {
        slot: usize,
        port: u16,
        addr: std::net::SocketAddr,
        existing_addr: std::net::SocketAddr,
    },

    /// Nothing to proxy.
    #[error(
        "no services configured: set SERVICE_<i>_LISTEN and SERVICE_<i>_DIAL for at least one \
         i below SERVICE_COUNT ({service_count})"
    )]
    NoServices { service_count: usize },
}

impl ConfigError {
    /// Returns true if this error indicates an ambiguous routing setup.
    pub fn is_routing_conflict(&self) -> bool {
        matches!(
            self,
            ConfigError::AmbiguousDefault { .. }
                | ConfigError::DuplicateSni { .. }
                | ConfigError::ConflictingListen { .. }
        )
    }
}
