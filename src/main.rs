use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use lattice_relay_service::backplane::create_backplane;
use lattice_relay_service::config::Settings;
use lattice_relay_service::server::{create_app, AppState};
use lattice_relay_service::shutdown::GracefulShutdown;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    init_tracing();

    // Load configuration
    let settings = Settings::new()?;
    tracing::info!("Configuration loaded");

    // Create the backplane selected by configuration
    let backplane = create_backplane(&settings.backplane).await?;

    // Create application state
    let state = AppState::new(settings.clone(), backplane);
    tracing::info!("Application state initialized");

    // Shutdown coordination
    let (shutdown_tx, _) = broadcast::channel(1);
    let graceful = Arc::new(GracefulShutdown::new(
        state.registry.clone(),
        shutdown_tx.clone(),
    ));

    // Create Axum app
    let app = create_app(state);

    // Start server
    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    // Run server; the shutdown future notifies clients and waits for the
    // registry to drain before the listener stops.
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_handler(graceful))
        .await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_handler(graceful: Arc<GracefulShutdown>) {
    match signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown signal received"),
        Err(e) => tracing::error!(error = %e, "failed to listen for shutdown signal"),
    }
    graceful.execute("server shutting down").await;
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
