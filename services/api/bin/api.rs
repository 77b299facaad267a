//! Main Entrypoint for the Speech Relay API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Installing logging and the Prometheus recorder.
//! 3. Initializing the identity provider and the recognition engine.
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use speechrelay_api::{
    config::Config,
    metrics::{install_recorder, spawn_hub_observer},
    router::create_router,
    speech::provider::DeepgramEngine,
    state::AppState,
};
use speechrelay_core::identity::JwtIdentityProvider;
use std::{net::SocketAddr, sync::Arc};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging and Metrics ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    let metrics = install_recorder().context("Failed to install metrics recorder")?;

    // --- 3. Initialize Shared Services ---
    let identity = Arc::new(JwtIdentityProvider::new(config.jwt_secret.as_bytes()));
    let engine = Arc::new(DeepgramEngine::new(config.engine.clone()));
    info!(model = %config.engine.model, language = %config.engine.language, "Using Deepgram engine.");

    let (app_state, hub_loop) = AppState::new(config.clone(), engine, identity, Some(metrics));
    let app_state = Arc::new(app_state);

    let observer_shutdown = CancellationToken::new();
    let observer = spawn_hub_observer(
        app_state.hub.clone(),
        config.metrics_interval,
        observer_shutdown.clone(),
    );

    // --- 4. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state.clone()).layer(cors);

    // --- 5. Start Server ---
    info!(bind_address = %config.bind_address, "Service configured. Starting server...");
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    observer_shutdown.cancel();
    let _ = observer.await;
    drop(app_state);
    hub_loop.abort();

    info!("Server has shut down.");
    Ok(())
}
