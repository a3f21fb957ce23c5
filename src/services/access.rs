//! Access service: who may enter which room.
//!
//! DESIGN
//! ======
//! Room entry asks one question of a [`RoomAccess`] collaborator: what role
//! does this principal hold in this room? Owners and editors enter;
//! everyone else is turned away before any state is loaded. The Postgres
//! implementation reads `rooms.owner_id` and the `room_access` grant
//! table. `StaticAccess` serves tests and database-less runs.
//!
//! ERROR HANDLING
//! ==============
//! Lookup failures surface as `AccessError` and fail closed: the caller
//! treats them as a denied join.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::frame::ErrorCode;

// =============================================================================
// TYPES
// =============================================================================

/// Identity presented by a connecting client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

impl Principal {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), email: None }
    }

    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Editor,
    #[serde(rename = "none")]
    NoAccess,
}

impl Role {
    #[must_use]
    pub fn can_enter(self) -> bool {
        matches!(self, Role::Owner | Role::Editor)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ErrorCode for AccessError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Database(_) => "E_DATABASE",
        }
    }

    fn retryable(&self) -> bool {
        true
    }
}

#[async_trait]
pub trait RoomAccess: Send + Sync {
    async fn role(&self, room_id: &str, principal: &Principal) -> Result<Role, AccessError>;
}

// =============================================================================
// POSTGRES
// =============================================================================

pub struct PgRoomAccess {
    pool: PgPool,
}

impl PgRoomAccess {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RoomAccess for PgRoomAccess {
    async fn role(&self, room_id: &str, principal: &Principal) -> Result<Role, AccessError> {
        let role: Option<String> = sqlx::query_scalar(
            "SELECT CASE
                WHEN r.owner_id = $2 THEN 'owner'
                ELSE (
                    SELECT a.role
                    FROM room_access a
                    WHERE a.room_id = r.id AND a.user_email = $3
                    LIMIT 1
                )
             END
             FROM rooms r
             WHERE r.id = $1",
        )
        .bind(room_id)
        .bind(&principal.id)
        .bind(principal.email.as_deref())
        .fetch_optional(&self.pool)
        .await?
        .flatten();

        Ok(match role.as_deref() {
            Some("owner") => Role::Owner,
            Some("editor") => Role::Editor,
            _ => Role::NoAccess,
        })
    }
}

// =============================================================================
// STATIC
// =============================================================================

/// In-memory grants. `open()` lets everyone in as editor.
pub struct StaticAccess {
    default_role: Role,
    grants: HashMap<(String, String), Role>,
}

impl StaticAccess {
    #[must_use]
    pub fn open() -> Self {
        Self { default_role: Role::Editor, grants: HashMap::new() }
    }

    #[must_use]
    pub fn closed() -> Self {
        Self { default_role: Role::NoAccess, grants: HashMap::new() }
    }

    #[must_use]
    pub fn grant(mut self, room_id: impl Into<String>, principal_id: impl Into<String>, role: Role) -> Self {
        self.grants.insert((room_id.into(), principal_id.into()), role);
        self
    }
}

#[async_trait]
impl RoomAccess for StaticAccess {
    async fn role(&self, room_id: &str, principal: &Principal) -> Result<Role, AccessError> {
        let key = (room_id.to_string(), principal.id.clone());
        Ok(self.grants.get(&key).copied().unwrap_or(self.default_role))
    }
}

#[cfg(test)]
#[path = "access_test.rs"]
mod tests;
