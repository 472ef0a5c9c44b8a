pub mod config;
pub mod error;
pub mod proxy;

pub use config::{Config, LogFormat};
pub use error::ConfigError;
pub use proxy::{
    Dialer, Listener, ListenerConfig, ListenerStats, Proxy, RelayEnd, RelayOutcome, RouteTable,
    RoutingDecision, ServiceDefinition, ServiceEntry, ServiceGroup, Session, SessionId,
    Side, SniConfig, SniInspector, SniResult,
};
