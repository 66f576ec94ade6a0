//! Registry Watch service
//!
//! Accepts pushed registry snapshots over HTTP, records what changed and
//! serves the change history.

use registry_watch::config::Settings;
use registry_watch::db;
use registry_watch::engine::ChangeTracker;
use registry_watch::routes::create_router;
use registry_watch::state::{AppState, StorageBackend};
use registry_watch::store::{
    MemoryChangeLog, MemoryEntitySource, MemorySnapshotStore, PgChangeLog, PgSnapshotStore,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Starting Registry Watch...");

    let settings = Settings::load()?;
    info!(
        max_batch_size = settings.tracker.max_batch_size,
        submit_timeout_secs = settings.tracker.submit_timeout.as_secs(),
        grouping = ?settings.tracker.grouping,
        emit_first_observed = settings.tracker.emit_first_observed,
        "Configuration loaded"
    );

    // Snapshots arrive over HTTP; the entity source is never polled here
    let source = Arc::new(MemoryEntitySource::new());

    let (tracker, storage) = match &settings.database {
        Some(db_config) => {
            let pool = db::init_pool(db_config).await?;
            db::create_tables(&pool).await?;
            let tracker = ChangeTracker::new(
                source,
                Arc::new(PgSnapshotStore::new(pool.clone())),
                Arc::new(PgChangeLog::new(pool)),
                &settings.tracker,
            );
            (tracker, StorageBackend::Postgres)
        }
        None => {
            warn!("DATABASE_URL not set, change history is kept in memory and lost on restart");
            let tracker = ChangeTracker::new(
                source,
                Arc::new(MemorySnapshotStore::new()),
                Arc::new(MemoryChangeLog::new()),
                &settings.tracker,
            );
            (tracker, StorageBackend::Memory)
        }
    };

    let state = Arc::new(AppState::new(tracker, storage));
    let shutdown = state.shutdown.clone();
    let app = create_router(state, &settings);

    let addr = SocketAddr::from((settings.server.host, settings.server.port));
    info!(storage = storage.as_str(), "Server listening on http://{}", addr);
    info!("   GET  /health");
    info!("   POST /api/observations/{{entity_type}}");
    info!("   GET  /api/entities/{{entity_id}}/history?limit=");
    info!("   GET  /api/entities/{{entity_id}}/state");
    info!("   GET  /api/events/{{entity_type}}/recent?since=");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // In-flight cycles stop before their next persistence call
            shutdown.cancel();
        })
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Initialize tracing; `LOG_FORMAT=json` switches to JSON lines
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,registry_watch=debug,tower_http=debug"));

    let registry = tracing_subscriber::registry().with(env_filter);

    if std::env::var("LOG_FORMAT").is_ok_and(|f| f == "json") {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .compact(),
            )
            .init();
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown...");
        },
    }
}
