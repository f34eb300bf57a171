//! Lobby Controller
//!
//! Stateful WebSocket signaling server for telemedicine waiting rooms.
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Install the Prometheus metrics recorder
//! 3. Spawn the session coordinator actor
//! 4. Serve the WebSocket, health, and metrics endpoints on one listener
//! 5. Wait for shutdown signal (Ctrl+C or SIGTERM)

use lobby_controller::config::Config;
use lobby_controller::server;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lobby_controller=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Lobby Controller");

    let config = Config::from_env().inspect_err(|e| {
        error!("Failed to load configuration: {}", e);
    })?;

    info!(
        bind_address = %config.bind_address,
        instance_id = %config.instance_id,
        cors_allowed_origin = %config.cors_allowed_origin,
        "Configuration loaded successfully"
    );

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, initiating graceful shutdown...");
        signal_token.cancel();
    });

    server::run(config, shutdown).await?;

    info!("Lobby Controller shutdown complete");
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
