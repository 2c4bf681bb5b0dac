mod config;
mod error;
mod events;
mod github;
mod middleware;
mod models;
mod nodes;
mod oauth;
mod pipeline;
mod provider;
mod registry;
mod routes;
mod services;
mod state;
mod storage;
mod transport;
mod users;
mod workspaces;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::get;
use axum_prometheus::PrometheusMetricLayer;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::Config;
use crate::events::EventBroadcaster;
use crate::github::GitHubClient;
use crate::oauth::StateStore;
use crate::registry::Registries;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();
    dotenvy::dotenv().ok();

    let config = Config::load();

    let (registries, pool) = if config.registry.backend == "memory" {
        (Registries::memory(), None)
    } else {
        let pool = storage::connect(&config.registry.database_path).await?;
        storage::run_migrations(&pool).await?;
        (Registries::persistent(pool.clone()), Some(pool))
    };

    let broadcaster = Arc::new(EventBroadcaster::new(config.websocket.buffer_size));
    let (command_tx, command_rx) = mpsc::channel(32);
    events::start_command_relay(Arc::clone(&broadcaster), command_rx);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let workspace_root = PathBuf::from(&config.registry.workspace_root);
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;

    let state = AppState {
        config: Arc::new(config),
        registries,
        broadcaster,
        oauth_states: Arc::new(StateStore::default()),
        github: Arc::new(GitHubClient::from_env()),
        provider: None,
        dispatcher: None,
        command_tx,
        shutdown: shutdown_rx,
        pool,
        workspace_root,
    };

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = routes::app(state)
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .layer(prometheus_layer);

    tracing::info!(%addr, "listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async {
            shutdown_signal().await;
            tracing::info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            tracing::warn!(?err, "SIGTERM handler unavailable, falling back to ctrl-c");
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
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
