//! Spread monitor
//!
//! Main entry point for the live spread feed

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

use spread_core::MemoryStore;
use spread_price_feed::SpreadPipeline;
use spread_server::{load_settings, logging, serve, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    let settings = load_settings()?;
    logging::init(&settings.logging)?;

    info!("Starting spread monitor v{}", env!("CARGO_PKG_VERSION"));

    // Seed catalog stands in for the external store
    let store = Arc::new(MemoryStore::with_catalog(
        settings.catalog.tokens.clone(),
        settings.catalog.proxy_entries()?,
    ));

    let pipeline = Arc::new(SpreadPipeline::from_config(settings.clone(), store.clone()));
    pipeline.start().await?;
    info!("Background services started");

    // SIGHUP: reload the catalog and re-list tokens and proxies
    #[cfg(unix)]
    {
        let pipeline = Arc::clone(&pipeline);
        let store = Arc::clone(&store);
        let mut hangup = signal::unix::signal(signal::unix::SignalKind::hangup())?;
        tokio::spawn(async move {
            while hangup.recv().await.is_some() {
                info!("Received SIGHUP, refreshing tokens and proxies");
                match load_settings() {
                    Ok(reloaded) => match reloaded.catalog.proxy_entries() {
                        Ok(proxies) => store.replace_catalog(reloaded.catalog.tokens, proxies),
                        Err(e) => warn!(error = %e, "Keeping previous catalog"),
                    },
                    Err(e) => warn!(error = %e, "Keeping previous catalog"),
                }
                match pipeline.refresh().await {
                    Ok(summary) => info!(
                        "Refresh complete: {} started, {} stopped, {} updated",
                        summary.started, summary.stopped, summary.updated
                    ),
                    Err(e) => error!("Refresh failed: {}", e),
                }
            }
        });
    }

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = TcpListener::bind(&addr).await?;

    // Setup shutdown channel
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("Failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C");
            }
            _ = terminate => {
                info!("Received termination signal");
            }
        }

        let _ = shutdown_tx.send(());
    });

    // Stopping the pipeline closes every subscriber, which lets the
    // server's graceful shutdown finish
    let state = AppState::new(Arc::clone(&pipeline));
    let stopper = Arc::clone(&pipeline);
    let shutdown = async move {
        shutdown_rx.await.ok();
        info!("Shutdown signal received");
        stopper.stop().await;
    };

    info!("Press Ctrl+C to shutdown");

    if let Err(e) = serve(listener, state, shutdown).await {
        error!("Server error: {}", e);
        pipeline.stop().await;
        return Err(e);
    }

    info!("Server shutdown complete");
    Ok(())
}
