//! Server lifecycle: startup, wiring, graceful shutdown

use crate::config::RelayConfig;
use crate::control::{self, ControlState};
use crate::error::{RelayError, Result};
use crate::metrics::{format_metrics, global_metrics};
use crate::registry::SessionRegistry;
use crate::relay::{PendingCaches, RelayCore};
use crate::transport::KcpTransport;
use crate::uid::UidAllocator;

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Bring the relay up and run it until the process is told to stop.
///
/// Bind failures on either surface propagate out so the binary can exit
/// non-zero. A ctrl-c cancels the root token; the core then drains every
/// live connection with `ServerShutdown` before the transport stops.
pub async fn run(config: RelayConfig) -> Result<()> {
    config.validate()?;

    let shutdown = CancellationToken::new();
    let registry = Arc::new(SessionRegistry::new());
    let caches = Arc::new(PendingCaches::new());
    let uids = Arc::new(UidAllocator::new());

    let mut transport = KcpTransport::bind(&config).await?;
    let events = transport.take_events();
    let link = transport.handle();

    let http_listener =
        tokio::net::TcpListener::bind((config.http_address.as_str(), config.http_port))
            .await
            .map_err(|e| {
                RelayError::config(format!(
                    "HTTP bind on {}:{} failed: {e}",
                    config.http_address, config.http_port
                ))
            })?;
    info!(
        addr = %format!("{}:{}", config.http_address, config.http_port),
        "control plane bound"
    );

    let control_state = Arc::new(ControlState {
        registry: registry.clone(),
        caches: caches.clone(),
    });
    let http_shutdown = shutdown.clone();
    let http_task = tokio::spawn(async move {
        let app = control::router(control_state);
        let served = axum::serve(http_listener, app)
            .with_graceful_shutdown(async move { http_shutdown.cancelled().await })
            .await;
        if let Err(e) = served {
            error!(error = %e, "control plane failed");
        }
    });

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
        }
        signal_shutdown.cancel();
    });

    info!(kcp = %transport.local_addr(), "relay server running");
    let core = RelayCore::new(link, registry, caches, uids);
    core.run(events, shutdown.clone()).await;

    // The core has drained its connections; flush the goodbyes and stop.
    transport.shutdown().await;
    shutdown.cancel();
    let _ = http_task.await;

    info!("{}", format_metrics(&global_metrics().snapshot()));
    info!("relay server stopped");
    Ok(())
}
