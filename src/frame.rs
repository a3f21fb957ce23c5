//! Frame: the universal message type for stackboard.
//!
//! ARCHITECTURE
//! ============
//! Every message between a room session and the server hub is a Frame.
//! Clients send request frames over WebSocket (or the in-process transport),
//! the server dispatches by syscall prefix, and responses flow back as
//! done/error frames. Server pushes (snapshots, relayed ops, presence)
//! are request frames with no `parent_id`.
//!
//! DESIGN
//! ======
//! - Flat data: payload is always `Map<String, Value>`; document ops travel
//!   as one array value under `ops`.
//! - Responses correlate to requests via `parent_id`.
//! - The WS handler routes on `syscall` prefix ("room:", "doc:", etc.)
//!   and never inspects `data`.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// FIELD CONSTANTS
// =============================================================================

/// Frame data key for error messages.
pub const FRAME_MESSAGE: &str = "message";

/// Frame data key for grepable error codes.
pub const FRAME_CODE: &str = "code";

/// Frame data key for the retryable flag on error frames.
pub const FRAME_RETRYABLE: &str = "retryable";

// =============================================================================
// SYSCALLS
// =============================================================================

pub const SYSCALL_JOIN: &str = "room:join";
pub const SYSCALL_PART: &str = "room:part";
/// Pushed once per join, before any relayed op, carrying the full replica.
pub const SYSCALL_SNAPSHOT: &str = "room:snapshot";
pub const SYSCALL_DOC_OPS: &str = "doc:ops";
pub const SYSCALL_PRESENCE_CURSOR: &str = "presence:cursor";
pub const SYSCALL_PRESENCE_UPDATE: &str = "presence:update";
pub const SYSCALL_PRESENCE_LEAVE: &str = "presence:leave";
pub const SYSCALL_ROADMAP: &str = "roadmap:diff";

// =============================================================================
// TYPES
// =============================================================================

/// Flat key-value payload. Alias to reduce noise in signatures.
pub type Data = HashMap<String, serde_json::Value>;

/// Lifecycle position of a frame in a request/response stream.
///
/// Every exchange is `request → done` or `request → error`. Server pushes
/// are bare requests with no reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Request,
    Done,
    Error,
}

/// The universal message type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    /// Milliseconds since Unix epoch. Set automatically at construction.
    pub ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    pub syscall: String,
    pub status: Status,
    #[serde(default)]
    pub data: Data,
}

// =============================================================================
// ERROR CODES
// =============================================================================

/// Grepable error code and retryable flag for structured error frames.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

// =============================================================================
// CONSTRUCTORS
// =============================================================================

fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

impl Frame {
    /// Create a request frame. Entry point for every syscall.
    pub fn request(syscall: impl Into<String>, data: Data) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id: None,
            ts: now_ms(),
            room_id: None,
            from: None,
            syscall: syscall.into(),
            status: Status::Request,
            data,
        }
    }

    /// Create a done response. Terminal, carries no data.
    #[must_use]
    pub fn done(&self) -> Self {
        self.reply(Status::Done, Data::new())
    }

    /// Create a done response that carries a result payload. Terminal.
    #[must_use]
    pub fn done_with(&self, data: Data) -> Self {
        self.reply(Status::Done, data)
    }

    /// Create an error response from a plain string. Terminal.
    #[must_use]
    pub fn error(&self, message: impl Into<String>) -> Self {
        let mut data = Data::new();
        data.insert(FRAME_MESSAGE.into(), serde_json::Value::String(message.into()));
        self.reply(Status::Error, data)
    }

    /// Create a structured error response from a typed error. Terminal.
    #[must_use]
    pub fn error_from(&self, err: &(impl ErrorCode + ?Sized)) -> Self {
        let mut data = Data::new();
        data.insert(FRAME_CODE.into(), serde_json::Value::String(err.error_code().to_string()));
        data.insert(FRAME_MESSAGE.into(), serde_json::Value::String(err.to_string()));
        data.insert(FRAME_RETRYABLE.into(), serde_json::Value::Bool(err.retryable()));
        self.reply(Status::Error, data)
    }

    /// Build a reply frame. Inherits `parent_id`, `room_id`, and `syscall`.
    fn reply(&self, status: Status, data: Data) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id: Some(self.id),
            ts: now_ms(),
            room_id: self.room_id.clone(),
            from: None,
            syscall: self.syscall.clone(),
            status,
            data,
        }
    }
}

// =============================================================================
// BUILDERS
// =============================================================================

impl Frame {
    #[must_use]
    pub fn with_room_id(mut self, room_id: impl Into<String>) -> Self {
        self.room_id = Some(room_id.into());
        self
    }

    #[must_use]
    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

// =============================================================================
// ROUTING
// =============================================================================

impl Frame {
    /// Extract the syscall prefix (everything before the first ':').
    #[must_use]
    pub fn prefix(&self) -> &str {
        let Some((prefix, _)) = self.syscall.split_once(':') else {
            return &self.syscall;
        };
        prefix
    }

    /// Extract the syscall operation (everything after the first ':').
    #[must_use]
    pub fn op(&self) -> &str {
        self.syscall.split_once(':').map_or("", |(_, op)| op)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_sets_fields() {
        let frame = Frame::request(SYSCALL_JOIN, Data::new());
        assert_eq!(frame.syscall, "room:join");
        assert_eq!(frame.status, Status::Request);
        assert!(frame.parent_id.is_none());
        assert!(frame.room_id.is_none());
        assert!(frame.ts > 0);
    }

    #[test]
    fn reply_inherits_context() {
        let req = Frame::request(SYSCALL_DOC_OPS, Data::new()).with_room_id("room-1");
        let done = req.done();

        assert_eq!(done.parent_id, Some(req.id));
        assert_eq!(done.room_id.as_deref(), Some("room-1"));
        assert_eq!(done.syscall, "doc:ops");
        assert_eq!(done.status, Status::Done);
        assert!(done.data.is_empty());
    }

    #[test]
    fn done_with_carries_payload() {
        let req = Frame::request(SYSCALL_ROADMAP, Data::new());
        let done = req.done_with(Data::from([("groups".to_string(), serde_json::json!([]))]));
        assert_eq!(done.status, Status::Done);
        assert!(done.data.contains_key("groups"));
    }

    #[test]
    fn prefix_and_op_extraction() {
        let frame = Frame::request("presence:cursor", Data::new());
        assert_eq!(frame.prefix(), "presence");
        assert_eq!(frame.op(), "cursor");

        let frame = Frame::request("noseparator", Data::new());
        assert_eq!(frame.prefix(), "noseparator");
        assert_eq!(frame.op(), "");
    }

    #[test]
    fn json_round_trip() {
        let original = Frame::request(SYSCALL_JOIN, Data::new())
            .with_room_id("board-42")
            .with_from("alice")
            .with_data("key", "value");

        let json = serde_json::to_string(&original).expect("serialize");
        let restored: Frame = serde_json::from_str(&json).expect("deserialize");

        assert_eq!(restored.id, original.id);
        assert_eq!(restored.room_id.as_deref(), Some("board-42"));
        assert_eq!(restored.syscall, "room:join");
        assert_eq!(restored.from.as_deref(), Some("alice"));
        assert_eq!(restored.data.get("key").and_then(|v| v.as_str()), Some("value"));
    }

    #[test]
    fn error_from_typed() {
        #[derive(Debug, thiserror::Error)]
        #[error("denied")]
        struct Denied;

        impl ErrorCode for Denied {
            fn error_code(&self) -> &'static str {
                "E_DENIED"
            }
        }

        let req = Frame::request(SYSCALL_JOIN, Data::new());
        let err = req.error_from(&Denied);

        assert_eq!(err.status, Status::Error);
        assert_eq!(err.data.get("code").and_then(|v| v.as_str()), Some("E_DENIED"));
        assert_eq!(err.data.get("message").and_then(|v| v.as_str()), Some("denied"));
        assert_eq!(err.data.get("retryable").and_then(serde_json::Value::as_bool), Some(false));
    }
}
