//! History coordinator — server-authoritative undo/redo per room.
//!
//! DESIGN
//! ======
//! Each room keeps one linear history: an undo stack of applied forward
//! actions and a redo stack of undone ones. Any member with draw permission
//! may undo the room's most recent action, not only their own.
//!
//! - A new forward action clears the redo stack.
//! - The undo stack keeps at most `MAX_HISTORY_DEPTH` entries; the oldest
//!   falls off first.
//! - `clear` resets both stacks.
//! - A room activated from the store replays its whiteboard's action log,
//!   so history survives the room being pruned and re-created.
//! - Undo/redo effects are broadcast to ALL members, origin included, so
//!   every canvas applies the same instruction in the same order.
//! - The effect is appended to the action log as an `undo`/`redo` entry that
//!   references the reversed action by id; nothing is ever deleted.
//!
//! Requests are serialized by the room mutex; two concurrent undos always
//! pop two different entries.

use std::collections::VecDeque;

use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use super::relay::{RelayError, lock_member};
use crate::config::DEFAULT_MAX_HISTORY_DEPTH;
use crate::event::{ActionKind, ServerEvent, now_ms};
use crate::services::persistence;
use crate::state::{AppState, DrawingAction};

#[derive(Debug)]
pub struct History {
    /// Applied forward actions, oldest first. Bounded by `max_depth`.
    undo: VecDeque<DrawingAction>,
    redo: Vec<DrawingAction>,
    max_depth: usize,
}

impl Default for History {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HISTORY_DEPTH)
    }
}

impl History {
    #[must_use]
    pub fn new(max_depth: usize) -> Self {
        Self { undo: VecDeque::new(), redo: Vec::new(), max_depth: max_depth.max(1) }
    }

    /// Rebuild a room's history from its persisted action log.
    #[must_use]
    pub fn replay(log: &[DrawingAction], max_depth: usize) -> Self {
        let mut history = Self::new(max_depth);
        for action in log {
            match action.kind {
                ActionKind::Undo => {
                    history.undo();
                }
                ActionKind::Redo => {
                    history.redo();
                }
                ActionKind::Clear => history.reset(),
                _ => history.record(action.clone()),
            }
        }
        history
    }

    /// Record a forward action. Invalidates pending redo and drops the
    /// oldest entry once the stack is over `max_depth`.
    pub fn record(&mut self, action: DrawingAction) {
        self.undo.push_back(action);
        while self.undo.len() > self.max_depth {
            self.undo.pop_front();
        }
        self.redo.clear();
    }

    /// Global reset, applied on `clear`.
    pub fn reset(&mut self) {
        self.undo.clear();
        self.redo.clear();
    }

    /// Pop the most recent forward action onto the redo stack.
    pub fn undo(&mut self) -> Option<DrawingAction> {
        let action = self.undo.pop_back()?;
        self.redo.push(action.clone());
        Some(action)
    }

    /// Re-apply the most recently undone action.
    pub fn redo(&mut self) -> Option<DrawingAction> {
        let action = self.redo.pop()?;
        self.undo.push_back(action.clone());
        Some(action)
    }

    #[must_use]
    pub fn undo_len(&self) -> usize {
        self.undo.len()
    }

    #[must_use]
    pub fn redo_len(&self) -> usize {
        self.redo.len()
    }

    /// Ids of applied actions, oldest first.
    #[cfg(test)]
    #[must_use]
    pub fn applied_ids(&self) -> Vec<Uuid> {
        self.undo.iter().map(|a| a.id).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Undo,
    Redo,
}

/// Undo the room's most recent forward action. `Ok(None)` when there is nothing to undo.
///
/// # Errors
///
/// `NotAMember` if the connection is not an active participant, `PermissionDenied`
/// if the participant may not draw.
pub async fn undo(state: &AppState, conn_id: Uuid, room_id: &str) -> Result<Option<DrawingAction>, RelayError> {
    apply(state, conn_id, room_id, Step::Undo).await
}

/// Re-apply the most recently undone action. `Ok(None)` when the redo stack is empty.
///
/// # Errors
///
/// Same as [`undo`].
pub async fn redo(state: &AppState, conn_id: Uuid, room_id: &str) -> Result<Option<DrawingAction>, RelayError> {
    apply(state, conn_id, room_id, Step::Redo).await
}

async fn apply(state: &AppState, conn_id: Uuid, room_id: &str, step: Step) -> Result<Option<DrawingAction>, RelayError> {
    let kind = match step {
        Step::Undo => ActionKind::Undo,
        Step::Redo => ActionKind::Redo,
    };

    let (mut room, member) = lock_member(state, conn_id, room_id).await?;
    if !kind.permitted(member.permissions) {
        return Err(RelayError::PermissionDenied { kind });
    }

    let target = match step {
        Step::Undo => room.history.undo(),
        Step::Redo => room.history.redo(),
    };
    let Some(target) = target else {
        debug!(%room_id, %kind, "history: nothing to apply");
        return Ok(None);
    };

    let data = match step {
        Step::Undo => json!({ "actionId": target.id, "clientToken": target.client_token }),
        Step::Redo => json!({ "actionId": target.id, "action": target }),
    };
    let effect = DrawingAction {
        id: Uuid::new_v4(),
        kind,
        user_id: member.user_id,
        user_name: member.user_name,
        data,
        timestamp: now_ms(),
        client_token: None,
        target_id: Some(target.id),
        extra: serde_json::Map::new(),
    };

    room.touch();
    room.broadcast(&ServerEvent::DrawingAction { room_id: room_id.to_string(), action: effect.clone() }, None);
    persistence::enqueue_action(state, room_id, &room.meta.whiteboard_id, &effect, member.conn);
    info!(
        %room_id,
        %kind,
        target = %target.id,
        undo_depth = room.history.undo_len(),
        redo_depth = room.history.redo_len(),
        "history: applied"
    );

    Ok(Some(effect))
}

#[cfg(test)]
#[path = "history_test.rs"]
mod tests;
