//! Room registry service — resolve, cache, prune and sweep live rooms.
//!
//! DESIGN
//! ======
//! The store is the source of truth for whether a room exists and accepts
//! joins. The registry only caches what membership decisions need
//! (`RoomMeta`) plus the live participant set and history.
//!
//! LIFECYCLE
//! =========
//! - `resolve` reads the room record from the store on every join, so a
//!   deactivated room stops accepting joins immediately.
//! - `room_entry` creates the live state on first join, seeded with the
//!   persisted participant records (all inactive) and a history replayed
//!   from the whiteboard's action log.
//! - `prune_if_empty` drops the live state when the last active participant
//!   leaves.
//! - The sweeper re-validates live rooms every `room_sweep_interval` and
//!   evicts rooms the store reports missing or inactive.
//!
//! Lock order is always registry, then room. A room removed from the
//! registry is flagged `evicted` so anyone still holding its `Arc` knows to
//! re-resolve.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::event::{ErrorCode, ServerEvent};
use crate::services::history::History;
use crate::services::persistence;
use crate::state::{AppState, RoomHandle, RoomState};
use crate::store::{RoomRecord, StoreError};

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    #[error("room not found: {0}")]
    RoomNotFound(String),
    #[error("access denied to room {0}")]
    AccessDenied(String),
    #[error("room {room_id} is full ({max} participants)")]
    RoomFull { room_id: String, max: u32 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ErrorCode for JoinError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::RoomNotFound(_) => "ROOM_NOT_FOUND",
            Self::AccessDenied(_) => "ACCESS_DENIED",
            Self::RoomFull { .. } => "ROOM_FULL",
            Self::Store(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::RoomFull { .. } => true,
            Self::Store(e) => e.retryable(),
            Self::RoomNotFound(_) | Self::AccessDenied(_) => false,
        }
    }
}

// =============================================================================
// RESOLVE / REGISTRY
// =============================================================================

/// Read the authoritative room record.
///
/// # Errors
///
/// `RoomNotFound` if the room is absent or inactive, `Store` if the store fails.
pub async fn resolve(state: &AppState, room_id: &str) -> Result<RoomRecord, JoinError> {
    match state.store.get_room(room_id).await? {
        Some(record) if record.is_active => Ok(record),
        Some(_) => {
            debug!(%room_id, "room: inactive");
            Err(JoinError::RoomNotFound(room_id.to_string()))
        }
        None => Err(JoinError::RoomNotFound(room_id.to_string())),
    }
}

/// Live handle for `record`, creating it if this is the first join.
///
/// A new room's history is rebuilt from the whiteboard's action log. The log
/// is read before the registry lock is taken.
pub async fn room_entry(state: &AppState, record: &RoomRecord) -> RoomHandle {
    if let Some(handle) = state.rooms.read().await.get(&record.room_id) {
        return handle.clone();
    }

    let history = load_history(state, record).await;
    let mut rooms = state.rooms.write().await;
    rooms
        .entry(record.room_id.clone())
        .or_insert_with(|| {
            info!(room_id = %record.room_id, whiteboard_id = %record.whiteboard_id, "room: activated");
            let mut room = RoomState::from_record(record, state.config.default_max_participants);
            room.history = history;
            Arc::new(Mutex::new(room))
        })
        .clone()
}

async fn load_history(state: &AppState, record: &RoomRecord) -> History {
    let depth = state.config.max_history_depth;
    match state.store.list_actions(&record.whiteboard_id).await {
        Ok(log) => {
            let history = History::replay(&log, depth);
            debug!(room_id = %record.room_id, entries = log.len(), undo_depth = history.undo_len(), "room: history replayed");
            history
        }
        Err(e) => {
            warn!(room_id = %record.room_id, error = %e, "room: action log unreadable; starting with empty history");
            History::new(depth)
        }
    }
}

/// Live handle for `room_id`, if the room is in the registry.
pub async fn lookup(state: &AppState, room_id: &str) -> Option<RoomHandle> {
    state.rooms.read().await.get(room_id).cloned()
}

/// Drop the live state of `room_id` if nobody is active in it.
///
/// Only removes the entry still pointing at `handle`, so a room re-created
/// in the meantime is left alone.
pub async fn prune_if_empty(state: &AppState, room_id: &str, handle: &RoomHandle) -> bool {
    let mut rooms = state.rooms.write().await;
    let Some(current) = rooms.get(room_id) else {
        return false;
    };
    if !Arc::ptr_eq(current, handle) {
        return false;
    }

    let mut room = handle.lock().await;
    if room.active_count() > 0 {
        return false;
    }
    room.evicted = true;
    rooms.remove(room_id);
    info!(%room_id, "room: pruned");
    true
}

/// Remove `room_id` from the registry and tell its members the room is gone.
///
/// Members that were active are persisted as inactive; their connections'
/// later leaves find no room and do nothing.
pub async fn evict_room(state: &AppState, room_id: &str) -> bool {
    let Some(handle) = state.rooms.write().await.remove(room_id) else {
        return false;
    };

    let mut room = handle.lock().await;
    room.evicted = true;
    let notice = ServerEvent::error_from(Some(room_id), &JoinError::RoomNotFound(room_id.to_string()));
    room.broadcast(&notice, None);
    for participant in room.participants.values_mut() {
        if !participant.active {
            continue;
        }
        participant.active = false;
        participant.conn = None;
        persistence::enqueue_participant(state, room_id, participant.record());
    }
    info!(%room_id, idle_ms = crate::event::now_ms() - room.last_activity, "room: evicted");
    true
}

// =============================================================================
// SWEEPER
// =============================================================================

/// Re-validate every live room against the store. Returns how many were evicted.
pub async fn sweep_rooms(state: &AppState) -> usize {
    let room_ids: Vec<String> = state.rooms.read().await.keys().cloned().collect();

    let mut evicted = 0;
    for room_id in room_ids {
        match state.store.get_room(&room_id).await {
            Ok(Some(record)) if record.is_active => {}
            Ok(_) => {
                if evict_room(state, &room_id).await {
                    evicted += 1;
                }
            }
            Err(e) => {
                warn!(%room_id, error = %e, "room sweep: store read failed; keeping room");
            }
        }
    }
    evicted
}

/// Spawn the periodic liveness sweep. Returns a handle for shutdown.
pub fn spawn_room_sweeper(state: AppState) -> JoinHandle<()> {
    let interval = state.config.room_sweep_interval;
    info!(interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX), "room sweeper configured");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately; skip it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted = sweep_rooms(&state).await;
            if evicted > 0 {
                info!(evicted, "room sweep evicted rooms");
            }
        }
    })
}

#[cfg(test)]
#[path = "room_test.rs"]
mod tests;
