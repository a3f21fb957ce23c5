//! Transport collaborator: how a room session reaches the hub.
//!
//! DESIGN
//! ======
//! A [`RoomLink`] is one live room connection: frames the session sends go
//! out on an unbounded queue (sending never blocks the session), and frames
//! the hub pushes arrive on a bounded receiver. The hub owns the only sender
//! for that receiver, so the receiver closing means the link is gone and the
//! session must resync.
//!
//! [`LocalTransport`] connects to an in-process hub. A pump task feeds the
//! session's outbound frames through the same dispatch the websocket route
//! uses, and parts the room when the session drops its end.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::doc::ConnectionId;
use crate::frame::{Frame, Status};
use crate::routes::ws::{ConnectionContext, log_outbound, process_frame};
use crate::services::access::Principal;
use crate::services::room;
use crate::session::SessionError;
use crate::state::AppState;

/// One live room connection.
#[derive(Debug)]
pub struct RoomLink {
    pub connection_id: ConnectionId,
    pub outbound: mpsc::UnboundedSender<Frame>,
    pub inbound: mpsc::Receiver<Frame>,
}

#[async_trait]
pub trait RoomTransport: Send + Sync {
    /// Join `room_id` as `principal`. The first inbound frame is the room
    /// snapshot.
    async fn connect(&self, room_id: &str, principal: &Principal) -> Result<RoomLink, SessionError>;
}

// =============================================================================
// IN-PROCESS
// =============================================================================

#[derive(Clone)]
pub struct LocalTransport {
    state: AppState,
}

impl LocalTransport {
    #[must_use]
    pub fn new(state: AppState) -> Self {
        Self { state }
    }
}

#[async_trait]
impl RoomTransport for LocalTransport {
    async fn connect(&self, room_id: &str, principal: &Principal) -> Result<RoomLink, SessionError> {
        let (tx, inbound) = mpsc::channel(self.state.config.client_channel_capacity);
        let joined = room::join_room(&self.state, room_id, principal, tx).await?;
        let connection_id = joined.connection_id;

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
        let state = self.state.clone();
        let mut ctx = ConnectionContext::attached(principal.clone(), room_id, connection_id);
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                for reply in process_frame(&state, &mut ctx, frame).await {
                    // Replies are not routed back; the session already applied
                    // its own writes locally.
                    if reply.status == Status::Error {
                        log_outbound(&reply);
                    }
                }
            }
            if let Some(joined) = ctx.room.take() {
                room::part_room(&state, &joined.room_id, joined.connection_id).await;
            }
            debug!(connection_id, "local transport pump stopped");
        });

        info!(%room_id, connection_id, principal = %principal.id, "local transport connected");
        Ok(RoomLink { connection_id, outbound, inbound })
    }
}
