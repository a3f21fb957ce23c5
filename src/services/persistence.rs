//! Persistence service: snapshot collaborator and background flush.
//!
//! DESIGN
//! ======
//! A room's whole replica is saved as one JSON snapshot. Rooms are marked
//! dirty when ops are accepted; a background task flushes dirty rooms on a
//! fixed interval, and the last client leaving a room triggers a final
//! flush (see `room::part_room`). Snapshots are replica state, not
//! materialized entities, so a reload merges convergently with anything
//! still in memory.
//!
//! ERROR HANDLING
//! ==============
//! The dirty flag is cleared only after a successful save, and only if the
//! room's version did not move while the save was in flight. Repeated
//! saves are acceptable; silent data loss is not. A room with no clients
//! is evicted once a background flush leaves it clean.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::doc::DocumentState;
use crate::frame::ErrorCode;
use crate::state::{AppState, RoomState};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("snapshot encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl ErrorCode for SnapshotError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Database(_) => "E_DATABASE",
            Self::Encoding(_) => "E_SNAPSHOT_ENCODING",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

/// Durable home of the last converged replica of each room.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self, room_id: &str) -> Result<Option<DocumentState>, SnapshotError>;

    async fn save(&self, room_id: &str, document: &DocumentState) -> Result<(), SnapshotError>;
}

// =============================================================================
// IN-MEMORY
// =============================================================================

/// Process-local snapshots. Survives rooms emptying, not restarts.
#[derive(Default)]
pub struct MemorySnapshotStore {
    rooms: Mutex<HashMap<String, DocumentState>>,
}

impl MemorySnapshotStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self, room_id: &str) -> Result<Option<DocumentState>, SnapshotError> {
        Ok(self.rooms.lock().await.get(room_id).cloned())
    }

    async fn save(&self, room_id: &str, document: &DocumentState) -> Result<(), SnapshotError> {
        self.rooms
            .lock()
            .await
            .insert(room_id.to_string(), document.clone());
        Ok(())
    }
}

// =============================================================================
// POSTGRES
// =============================================================================

pub struct PgSnapshotStore {
    pool: PgPool,
}

impl PgSnapshotStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SnapshotStore for PgSnapshotStore {
    async fn load(&self, room_id: &str) -> Result<Option<DocumentState>, SnapshotError> {
        let row: Option<serde_json::Value> =
            sqlx::query_scalar("SELECT state FROM room_documents WHERE room_id = $1")
                .bind(room_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(serde_json::from_value)
            .transpose()
            .map_err(SnapshotError::from)
    }

    async fn save(&self, room_id: &str, document: &DocumentState) -> Result<(), SnapshotError> {
        let state = serde_json::to_value(document)?;
        sqlx::query(
            "INSERT INTO room_documents (room_id, state, updated_at) VALUES ($1, $2, now()) \
             ON CONFLICT (room_id) DO UPDATE SET state = EXCLUDED.state, updated_at = now()",
        )
        .bind(room_id)
        .bind(&state)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// =============================================================================
// BACKGROUND FLUSH
// =============================================================================

/// Spawn the background persistence task. Returns a handle for shutdown.
pub fn spawn_persistence_task(state: AppState) -> JoinHandle<()> {
    let interval = state.config.snapshot_flush_interval;
    info!(flush_interval = ?interval, "snapshot persistence flush configured");
    tokio::spawn(async move {
        loop {
            flush_all_dirty(&state).await;
            tokio::time::sleep(interval).await;
        }
    })
}

#[derive(Debug)]
struct DirtyRoom {
    room_id: String,
    document: DocumentState,
    version: u64,
}

/// Save every dirty room once.
pub async fn flush_all_dirty(state: &AppState) {
    // PHASE: SNAPSHOT DIRTY ROOMS
    // WHY: clone under lock, then perform I/O lock-free.
    let batches = {
        let rooms = state.rooms.read().await;
        rooms
            .iter()
            .filter(|(_, room)| room.dirty)
            .map(|(room_id, room)| DirtyRoom {
                room_id: room_id.clone(),
                document: room.document.clone(),
                version: room.version,
            })
            .collect::<Vec<_>>()
    };

    // PHASE: SAVE + ACK
    // WHY: on failure the dirty flag stays set and the next cycle retries.
    for batch in batches {
        match state.snapshots.save(&batch.room_id, &batch.document).await {
            Ok(()) => {
                let mut rooms = state.rooms.write().await;
                let Some(room) = rooms.get_mut(&batch.room_id) else {
                    continue;
                };
                clear_if_unchanged(room, batch.version);

                // EDGE: a room retained after a failed final flush has no
                // clients left; once saved it can go.
                if room.clients.is_empty() && !room.dirty {
                    rooms.remove(&batch.room_id);
                    info!(room_id = %batch.room_id, "evicted room from memory after retry flush");
                }
            }
            Err(e) => {
                error!(error = %e, room_id = %batch.room_id, "snapshot flush failed");
            }
        }
    }
}

/// Clear the dirty flag if nothing was accepted since `flushed_version`.
pub(crate) fn clear_if_unchanged(room: &mut RoomState, flushed_version: u64) {
    // EDGE: keep dirty if ops landed after the snapshot was taken.
    if room.version == flushed_version {
        room.dirty = false;
    }
}

#[cfg(test)]
#[path = "persistence_test.rs"]
mod tests;
