//! gmgui - local multi-agent orchestration server
//!
//! Supervises a fleet of coding-agent subprocesses, accepts prompts from
//! browser clients, streams the agents' structured output back in real time,
//! and durably records every conversation.

mod agent;
mod api;
mod config;
mod db;
mod events;
mod scheduler;
mod stream;
mod supervisor;

use api::{create_router, AppState};
use config::ServerConfig;
use db::Database;
use events::EventBus;
use scheduler::{AgentTurnRunner, RunScheduler};
use std::net::SocketAddr;
use std::sync::Arc;
use stream::StreamPersister;
use supervisor::Supervisor;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gmgui=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = Arc::new(ServerConfig::from_env());

    // Data directory must exist and be writable before anything else
    std::fs::create_dir_all(&config.data_dir)?;

    let db_path = config.db_path();
    tracing::info!(path = %db_path.display(), "Opening database");
    let db = Database::open(&db_path)?;

    // No execution survives a restart: reconcile sessions, runs and the
    // is_streaming flags before accepting traffic.
    db.reset_live_state()?;

    let bus = EventBus::new();
    let supervisor = Supervisor::new();
    let persister = StreamPersister::new(db.clone(), bus.clone());
    let runner = Arc::new(AgentTurnRunner::new(
        Arc::clone(&supervisor),
        persister,
        config.run_timeout,
    ));
    let scheduler = RunScheduler::new(db.clone(), bus.clone(), runner);

    // Rebuild per-conversation queues from runs still pending on disk
    scheduler.recover().await?;

    let state = AppState::new(
        db,
        bus,
        Arc::clone(&scheduler),
        Arc::clone(&supervisor),
        Arc::clone(&config),
    );
    api::spawn_broadcast_router(&state);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let compression = CompressionLayer::new().gzip(true).br(true);

    let app = create_router(state)
        .layer(cors)
        .layer(compression)
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(%addr, base_url = %config.base_url, "gmgui server listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Last drain: interrupt in-flight runs, then stop every agent child.
    scheduler.shutdown();
    supervisor.stop_all().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

/// Resolves when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM - shutting down");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT - shutting down");
        }
    }
}
