//! # Veil Relay Server
//!
//! Zero-knowledge relay for end-to-end-encrypted messaging: tracks presence,
//! routes opaque envelopes between identities, and never reads plaintext.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! veil
//!
//! # Run with environment variables
//! VEIL_PORT=3000 VEIL_HOST=0.0.0.0 veil
//!
//! # Privacy mode: no public keys in presence views, no reverse lookup
//! VEIL_PRIVACY=1 veil
//! ```

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use veil_server::{config, handlers, metrics};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "veil=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!(
        "Starting Veil relay on {}:{} (privacy mode: {})",
        config.host,
        config.port,
        config.privacy_mode
    );

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
