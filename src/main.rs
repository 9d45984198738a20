//! WireSocket - Main Entry Point

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wiresocket::config::Config;
use wiresocket::WireSocket;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("WireSocket v{}", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("CONFIG_PATH").ok())
        .unwrap_or_else(|| "/etc/wiresocket/config.yaml".into());

    let config = if std::path::Path::new(&config_path).exists() {
        match Config::load(&config_path) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(path = %config_path, "cannot load config: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        tracing::warn!(path = %config_path, "config not found, using defaults");
        Config::default()
    };

    let server = match WireSocket::new(config).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("startup failed: {}", e);
            std::process::exit(e.exit_code());
        }
    };

    if let Err(e) = server.run().await {
        tracing::error!("terminated: {}", e);
        std::process::exit(e.exit_code());
    }
}
