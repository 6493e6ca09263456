//! plexus relay daemon
//!
//! L4 relay in front of a set of upstreams.
//!
//! This service:
//! - Accepts TCP connections on the configured address
//! - Picks an upstream round-robin, skipping ones that recently failed
//! - Relays bytes in both directions through a relay session
//! - Optionally prepends a PROXY protocol v2 header to upstream connections

use std::sync::Arc;

use anyhow::Result;
use plexus_relayd::{Config, Listener, ListenerConfig, UpstreamPool};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to RELAY_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting plexus relayd");
    info!(
        listen_addr = %config.listen_addr,
        upstream_count = config.upstreams.len(),
        max_connections = config.max_connections,
        max_backends = config.max_backends,
        proxy_header = ?config.proxy_header,
        "Configuration loaded"
    );

    let pool = Arc::new(UpstreamPool::new(config.upstreams.iter().copied()));
    let listener = match Listener::bind(ListenerConfig::from_config(&config), pool).await {
        Ok(listener) => Arc::new(listener),
        Err(e) => {
            error!(bind_addr = %config.listen_addr, error = %e, "Failed to bind listener");
            return Err(e.into());
        }
    };

    tokio::select! {
        result = listener.run() => {
            if let Err(e) = &result {
                error!(error = %e, "Listener error");
            }
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    Ok(())
}
