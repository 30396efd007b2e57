//! Relay server binary

use kcp_relay::RelayConfig;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = RelayConfig::from_env();
    if let Err(e) = kcp_relay::server::run(config).await {
        error!(error = %e, "relay server failed");
        std::process::exit(1);
    }
}
