//! Store — the narrow interface to room/whiteboard records.
//!
//! SYSTEM CONTEXT
//! ==============
//! Accounts, whiteboard metadata and room creation live outside the session
//! engine. The engine reads room records and collaborator lists, appends to
//! a whiteboard's action log, and upserts participant records. Two
//! implementations ship: `memory` for tests and local runs, `postgres` for
//! deployments.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::event::ErrorCode;
use crate::state::{DrawingAction, Permissions};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl ErrorCode for StoreError {
    fn error_code(&self) -> &'static str {
        "STORE_UNAVAILABLE"
    }

    fn retryable(&self) -> bool {
        !matches!(self, Self::Corrupt(_))
    }
}

/// Collaborator role on a whiteboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Owner,
    Editor,
    Viewer,
}

impl Role {
    #[cfg(test)]
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Editor => "editor",
            Self::Viewer => "viewer",
        }
    }

    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "owner" => Some(Self::Owner),
            "editor" => Some(Self::Editor),
            "viewer" => Some(Self::Viewer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collaborator {
    pub user_id: String,
    pub role: Role,
}

/// Persisted participant row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantRecord {
    pub user_id: String,
    pub user_name: String,
    pub color: String,
    pub joined_at: i64,
    pub is_active: bool,
    pub permissions: Permissions,
}

/// Room as stored. `secret` is present only for private rooms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomRecord {
    pub room_id: String,
    pub whiteboard_id: String,
    pub max_participants: u32,
    pub secret: Option<String>,
    pub is_active: bool,
    pub last_activity: i64,
    pub participants: Vec<ParticipantRecord>,
}

#[async_trait]
pub trait RoomStore: Send + Sync {
    /// Fetch a room by id. `Ok(None)` if absent.
    async fn get_room(&self, room_id: &str) -> Result<Option<RoomRecord>, StoreError>;

    /// Collaborators of a whiteboard, owner included.
    async fn get_collaborators(&self, whiteboard_id: &str) -> Result<Vec<Collaborator>, StoreError>;

    /// Append one entry to a whiteboard's action log.
    async fn append_action(&self, whiteboard_id: &str, action: &DrawingAction) -> Result<(), StoreError>;

    /// Upsert the participant record for (room, user).
    async fn set_participant(&self, room_id: &str, participant: &ParticipantRecord) -> Result<(), StoreError>;

    /// Full action log of a whiteboard, in append order. Replayed to rebuild
    /// history when a room is activated.
    async fn list_actions(&self, whiteboard_id: &str) -> Result<Vec<DrawingAction>, StoreError>;
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
