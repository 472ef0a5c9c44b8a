//! tcpgate
//!
//! L4 proxy with TLS passthrough and SNI routing.
//!
//! This service:
//! - Reads its routes from `SERVICE_<i>_*` environment variables
//! - Accepts TCP connections on every configured listen port
//! - Inspects TLS ClientHello for SNI-based routing
//! - Relays connections to the selected backend, byte for byte

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tcpgate_ingress::proxy::probe_backends;
use tcpgate_ingress::{Config, LogFormat, Proxy};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("Invalid configuration")?;

    // Initialize tracing (prefer RUST_LOG, fallback to LOG_LEVEL / DEBUG_LOG)
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into());
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }

    info!("Starting tcpgate");

    let table = config.route_table().map_err(|e| {
        let what = if e.is_routing_conflict() {
            "Conflicting service routes"
        } else {
            "Invalid configuration"
        };
        anyhow::Error::new(e).context(what)
    })?;
    info!(
        service_count = table.len(),
        ports = ?table.ports(),
        dial_from = ?config.dial_from,
        debug_log = config.debug_log,
        "Configuration loaded"
    );

    probe_backends(&table).await;

    let proxy = Proxy::bind(&table, config.listener_config())
        .await
        .context("Failed to bind listener")?;

    proxy.run().await.context("Listener failed")
}
