//! Warden daemon - main entry point

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use warden_common::CoreConfig;
use warden_daemon::Warden;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("warden v{}", env!("CARGO_PKG_VERSION"));

    let config_path =
        std::env::var("WARDEN_CONFIG").unwrap_or_else(|_| "/etc/warden/core.json".into());
    let config = CoreConfig::load(&config_path).unwrap_or_else(|_| {
        tracing::warn!(path = %config_path, "config not found, using defaults");
        CoreConfig::default()
    });

    let warden = Warden::with_defaults(config)?;
    warden.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    warden.stop().await?;

    Ok(())
}
