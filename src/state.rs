//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor and
//! cloned into the in-process transport. It holds the configuration, the
//! access and snapshot collaborators, and a map of live rooms. Each room
//! has its authoritative replica, connected client senders, a presence
//! roster, and a dirty flag plus version for debounced persistence.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};

use crate::config::Config;
use crate::doc::{ConnectionId, DocumentState, PresenceRoster};
use crate::frame::Frame;
use crate::services::access::RoomAccess;
use crate::services::persistence::SnapshotStore;

// =============================================================================
// ROOM STATE
// =============================================================================

/// Per-room live state. Kept in memory while any client is connected and
/// flushed by the persistence task.
pub struct RoomState {
    /// Authoritative replica; every accepted op is merged here.
    pub document: DocumentState,
    /// Connected clients: `connection_id` -> sender for outgoing frames.
    pub clients: HashMap<ConnectionId, mpsc::Sender<Frame>>,
    pub presence: PresenceRoster,
    /// Replica changed since the last successful flush.
    pub dirty: bool,
    /// Bumped on every accepted op batch; a flush only clears `dirty` if the
    /// version it saved is still current.
    pub version: u64,
}

impl RoomState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            document: DocumentState::default(),
            clients: HashMap::new(),
            presence: PresenceRoster::new(),
            dirty: false,
            version: 0,
        }
    }
}

impl Default for RoomState {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// APP STATE
// =============================================================================

/// Clone is required by Axum; all inner fields are Arc-wrapped.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub rooms: Arc<RwLock<HashMap<String, RoomState>>>,
    pub access: Arc<dyn RoomAccess>,
    pub snapshots: Arc<dyn SnapshotStore>,
}

impl AppState {
    #[must_use]
    pub fn new(config: Config, access: Arc<dyn RoomAccess>, snapshots: Arc<dyn SnapshotStore>) -> Self {
        Self { config: Arc::new(config), rooms: Arc::new(RwLock::new(HashMap::new())), access, snapshots }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================


#[cfg(test)]
#[path = "state_test.rs"]
mod tests;
