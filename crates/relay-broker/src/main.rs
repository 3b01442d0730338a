//! Relay broker binary.
//!
//! Standalone publish/subscribe message relay over TCP.
//!
//! # Startup Flow
//!
//! 1. Initialize tracing
//! 2. Load configuration from environment
//! 3. Bind the TCP listener (fail fast on bind errors)
//! 4. Spawn the accept loop
//! 5. Wait for shutdown signal, then cancel all sessions

#![warn(clippy::pedantic)]

use std::sync::Arc;

use relay_broker::{AcceptAllHooks, Broker, Config};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_broker=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting relay broker");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        broker_id = %config.broker_id,
        bind_address = %config.bind_address,
        read_buffer_bytes = config.read_buffer_bytes,
        "Configuration loaded successfully"
    );

    // Bind BEFORE spawning to fail fast on bind errors
    let broker = Broker::bind(config, Arc::new(AcceptAllHooks)).await.map_err(|e| {
        error!(error = %e, "Failed to bind broker listener");
        e
    })?;

    let (handle, join) = broker.spawn();

    info!("Relay broker running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");
    handle.stop();

    if let Err(e) = join.await {
        error!(error = %e, "Accept loop terminated abnormally");
    }

    info!("Relay broker shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
