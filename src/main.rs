//! taskdeck - HTTP Server Entry Point
//!
//! Serves the task API over the configured store.

use taskdeck::{api, config::Config};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taskdeck=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(
        store = config.store.as_str(),
        tick_ms = config.progress.tick.as_millis() as u64,
        duration_ms = config.progress.duration.as_millis() as u64,
        "Loaded configuration"
    );

    info!("Starting server on {}", config.bind_addr());
    api::serve(config).await?;

    Ok(())
}
