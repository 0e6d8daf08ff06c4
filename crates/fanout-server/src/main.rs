//! # Fanout Server
//!
//! Channel subscription gateway.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (Redis on 127.0.0.1:6379)
//! fanout
//!
//! # Run with a specific config file
//! FANOUT_CONFIG=/path/to/fanout.toml fanout
//!
//! # Override single settings
//! FANOUT__PORT=8080 FANOUT__BUS__KIND=memory fanout
//! ```

use anyhow::Result;
use fanout_server::{config::Config, handlers, metrics};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fanout=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::load()?;

    tracing::info!("Starting Fanout server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
