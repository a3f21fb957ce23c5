use std::sync::Arc;

use stackboard::config::Config;
use stackboard::services::access::{PgRoomAccess, RoomAccess, StaticAccess};
use stackboard::services::persistence::{self, MemorySnapshotStore, PgSnapshotStore, SnapshotStore};
use stackboard::state::AppState;
use stackboard::{db, routes};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();
    let port = config.port;

    // Postgres-backed collaborators when configured; otherwise everything
    // lives in memory and every room is open.
    let (access, snapshots): (Arc<dyn RoomAccess>, Arc<dyn SnapshotStore>) = match &config.database_url {
        Some(url) => {
            let pool = db::init_pool(url, config.db_max_connections)
                .await
                .expect("database init failed");
            (Arc::new(PgRoomAccess::new(pool.clone())), Arc::new(PgSnapshotStore::new(pool)))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; rooms are open and snapshots are in-memory");
            (Arc::new(StaticAccess::open()), Arc::new(MemorySnapshotStore::new()))
        }
    };

    let state = AppState::new(config, access, snapshots);

    // Spawn background persistence task.
    let persistence_task = persistence::spawn_persistence_task(state.clone());

    let app = routes::app(state.clone());
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, "stackboard listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server failed");

    persistence_task.abort();
    persistence::flush_all_dirty(&state).await;
    tracing::info!("stackboard stopped");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}
