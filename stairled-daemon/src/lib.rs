use std::sync::Arc;

use tracing::info;

use crate::app::create_app;
use crate::settings::Settings;

pub mod app;
pub mod mqtt_client;
pub mod settings;
pub mod sink;

/// Brings the whole daemon up and parks until SIGINT/SIGTERM, then runs the
/// cleanup path so the stairs never stay lit.
pub async fn run(settings: &Arc<Settings>) -> anyhow::Result<()> {
    let app = create_app(settings).await?;
    let snapshot = app.discovery_snapshot();
    info!(
        "stairled running: {} chips, {} mapped steps",
        snapshot.chips.len(),
        snapshot.mapping.len()
    );

    shutdown_signal().await;
    info!("shutting down");
    app.shutdown().await;

    Ok(())
}

/// Resolves on SIGINT or SIGTERM so the cleanup path always runs.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!("SIGTERM handler unavailable: {err}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
