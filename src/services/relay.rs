//! Action relay — fan out drawing actions and ephemeral room chatter.
//!
//! DESIGN
//! ======
//! Every submit follows the same sequence under the room mutex:
//! check membership, check permission, stamp server id and timestamp,
//! update history, broadcast, enqueue persistence. The store write itself
//! happens later on the persistence worker, so broadcast never waits on I/O.
//!
//! - Forward actions go to every member except the origin. The origin gets
//!   its `clientToken` echoed in later history effects and reconciles its
//!   optimistic render itself.
//! - Every accepted drawing action, history effects included, is appended
//!   to the whiteboard's action log. Cursor moves, typing and chat never are.
//!
//! ERROR HANDLING
//! ==============
//! `NotAMember` and `PermissionDenied` stop the request before anything is
//! broadcast or persisted. The caller decides whether to echo an error to
//! the offending connection; nothing is ever surfaced to other members.

use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};
use uuid::Uuid;

use super::history;
use super::room;
use crate::event::{ActionInput, ActionKind, ErrorCode, EventError, Position, ServerEvent, now_ms};
use crate::services::persistence;
use crate::state::{AppState, ConnHandle, DrawingAction, Permissions, RoomHandle, RoomState};

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("not a member of room {0}")]
    NotAMember(String),
    #[error("permission denied for {kind}")]
    PermissionDenied { kind: ActionKind },
    #[error(transparent)]
    InvalidPayload(#[from] EventError),
}

impl ErrorCode for RelayError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotAMember(_) => "NOT_A_MEMBER",
            Self::PermissionDenied { .. } => "PERMISSION_DENIED",
            Self::InvalidPayload(e) => e.error_code(),
        }
    }
}

/// Snapshot of the sending participant, taken under the room lock.
#[derive(Debug, Clone)]
pub(crate) struct Member {
    pub user_id: String,
    pub user_name: String,
    pub color: String,
    pub permissions: Permissions,
    pub conn: Option<ConnHandle>,
}

/// Live handle for a room the caller claims membership of.
async fn lookup_room(state: &AppState, room_id: &str) -> Result<RoomHandle, RelayError> {
    room::lookup(state, room_id)
        .await
        .ok_or_else(|| RelayError::NotAMember(room_id.to_string()))
}

/// Lock `room_id` and resolve the active participant bound to `conn_id`.
pub(crate) async fn lock_member(
    state: &AppState,
    conn_id: Uuid,
    room_id: &str,
) -> Result<(OwnedMutexGuard<RoomState>, Member), RelayError> {
    let handle = lookup_room(state, room_id).await?;
    let room = handle.lock_owned().await;
    let member = room
        .member_by_conn(conn_id)
        .map(|p| Member {
            user_id: p.user_id.clone(),
            user_name: p.user_name.clone(),
            color: p.color.clone(),
            permissions: p.permissions,
            conn: p.conn.clone(),
        })
        .ok_or_else(|| RelayError::NotAMember(room_id.to_string()))?;
    Ok((room, member))
}

// =============================================================================
// DRAWING ACTIONS
// =============================================================================

/// Validate, apply and fan out one drawing action.
///
/// Undo/redo kinds are handed to the history coordinator. Returns the
/// accepted action, or `None` when a history request had nothing to apply.
///
/// # Errors
///
/// `InvalidPayload` for a malformed action, `NotAMember` if the connection is
/// not active in the room, `PermissionDenied` if the participant lacks the
/// flag for this kind.
pub async fn submit(
    state: &AppState,
    conn_id: Uuid,
    room_id: &str,
    input: ActionInput,
) -> Result<Option<DrawingAction>, RelayError> {
    if input.kind.is_history() {
        return match input.kind {
            ActionKind::Redo => history::redo(state, conn_id, room_id).await,
            _ => history::undo(state, conn_id, room_id).await,
        };
    }
    let valid = input.validate(state.config.max_action_bytes)?;

    let (mut room, member) = lock_member(state, conn_id, room_id).await?;
    if !valid.kind.permitted(member.permissions) {
        info!(%room_id, user_id = %member.user_id, kind = %valid.kind, "relay: permission denied");
        return Err(RelayError::PermissionDenied { kind: valid.kind });
    }

    let action = DrawingAction {
        id: Uuid::new_v4(),
        kind: valid.kind,
        user_id: member.user_id.clone(),
        user_name: member.user_name,
        data: valid.data,
        timestamp: now_ms(),
        client_token: valid.client_token,
        target_id: None,
        extra: valid.extra,
    };

    if action.kind == ActionKind::Clear {
        room.history.reset();
    } else {
        room.history.record(action.clone());
    }
    room.touch();
    room.broadcast(
        &ServerEvent::DrawingAction { room_id: room_id.to_string(), action: action.clone() },
        Some(member.user_id.as_str()),
    );
    persistence::enqueue_action(state, room_id, &room.meta.whiteboard_id, &action, member.conn);
    debug!(%room_id, user_id = %action.user_id, kind = %action.kind, id = %action.id, "relay: action applied");

    Ok(Some(action))
}

// =============================================================================
// EPHEMERAL EVENTS
// =============================================================================

/// Relay a cursor position to the other members. Never persisted.
///
/// # Errors
///
/// `InvalidPayload` for a non-finite position, `NotAMember` otherwise.
pub async fn cursor(state: &AppState, conn_id: Uuid, room_id: &str, position: Position) -> Result<(), RelayError> {
    if !position.is_finite() {
        return Err(EventError::InvalidPayload("cursor position must be finite".into()).into());
    }
    let (room, member) = lock_member(state, conn_id, room_id).await?;
    room.broadcast(
        &ServerEvent::CursorMoved {
            room_id: room_id.to_string(),
            user_id: member.user_id.clone(),
            position,
            color: member.color,
        },
        Some(member.user_id.as_str()),
    );
    Ok(())
}

/// Relay a chat line to the other members as typed. Never persisted.
///
/// # Errors
///
/// `InvalidPayload` for an empty or oversized message, `NotAMember` otherwise.
pub async fn chat(state: &AppState, conn_id: Uuid, room_id: &str, text: &str) -> Result<(), RelayError> {
    if text.trim().is_empty() {
        return Err(EventError::InvalidPayload("chat message is empty".into()).into());
    }
    let max = state.config.max_chat_chars;
    if text.chars().count() > max {
        return Err(EventError::InvalidPayload(format!("chat message exceeds {max} characters")).into());
    }

    let (mut room, member) = lock_member(state, conn_id, room_id).await?;
    room.touch();
    room.broadcast(
        &ServerEvent::ChatMessage {
            room_id: room_id.to_string(),
            user_id: member.user_id.clone(),
            user_name: member.user_name,
            text: text.to_string(),
            timestamp: now_ms(),
        },
        Some(member.user_id.as_str()),
    );
    Ok(())
}

/// Relay a typing indicator to the other members. Never persisted.
///
/// # Errors
///
/// `NotAMember` if the connection is not active in the room.
pub async fn typing(state: &AppState, conn_id: Uuid, room_id: &str, is_typing: bool) -> Result<(), RelayError> {
    let (room, member) = lock_member(state, conn_id, room_id).await?;
    room.broadcast(
        &ServerEvent::Typing {
            room_id: room_id.to_string(),
            user_id: member.user_id.clone(),
            user_name: member.user_name,
            is_typing,
        },
        Some(member.user_id.as_str()),
    );
    Ok(())
}

#[cfg(test)]
#[path = "relay_test.rs"]
mod tests;
