//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor and
//! owns the room registry. It is built per process in `main` and per test
//! in `test_helpers`; there is no global.
//!
//! Each live room sits behind its own `Mutex`, so all mutations of one
//! room's participant set, capacity and history are serialized while
//! different rooms never contend. The outer `RwLock` only guards the map
//! itself and is never held across store I/O.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::warn;
use uuid::Uuid;

use crate::config::Config;
use crate::event::{ActionKind, ParticipantView, ServerEvent};
use crate::services::auth::TokenResolver;
use crate::services::history::History;
use crate::services::persistence::{self, PersistJob};
use crate::store::{ParticipantRecord, Role, RoomRecord, RoomStore};

// =============================================================================
// DRAWING ACTION
// =============================================================================

/// One accepted action. Mirrors the `drawing_actions` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrawingAction {
    /// Server-assigned identifier.
    pub id: Uuid,
    pub kind: ActionKind,
    pub user_id: String,
    pub user_name: String,
    /// Geometry/style payload, opaque to the engine.
    pub data: serde_json::Value,
    /// Server timestamp, milliseconds since Unix epoch.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
    /// For undo/redo entries: the action being reversed or re-applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<Uuid>,
    /// Client fields outside the known schema, relayed and stored as sent.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

// =============================================================================
// PARTICIPANT
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permissions {
    pub can_draw: bool,
    pub can_erase: bool,
    pub can_clear: bool,
}

impl Permissions {
    #[must_use]
    pub fn for_role(role: Role) -> Self {
        match role {
            Role::Owner => Self { can_draw: true, can_erase: true, can_clear: true },
            Role::Editor => Self { can_draw: true, can_erase: true, can_clear: false },
            Role::Viewer => Self { can_draw: false, can_erase: false, can_clear: false },
        }
    }

    /// Users admitted by room secret alone.
    #[must_use]
    pub fn guest() -> Self {
        Self { can_draw: true, can_erase: true, can_clear: false }
    }
}

/// Outbound side of one transport connection.
#[derive(Debug, Clone)]
pub struct ConnHandle {
    pub id: Uuid,
    pub tx: mpsc::Sender<ServerEvent>,
}

impl ConnHandle {
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { id: Uuid::new_v4(), tx }, rx)
    }

    /// Best-effort, non-blocking send. A full or closed queue drops the event.
    pub fn deliver(&self, event: ServerEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(ev)) => {
                warn!(conn_id = %self.id, event = ev.name(), "outbound queue full; dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// A (room, user) membership record.
#[derive(Debug, Clone)]
pub struct Participant {
    pub user_id: String,
    pub user_name: String,
    pub color: String,
    pub joined_at: i64,
    pub active: bool,
    pub permissions: Permissions,
    /// Current binding. `None` while inactive.
    pub conn: Option<ConnHandle>,
}

impl Participant {
    #[must_use]
    pub fn view(&self) -> ParticipantView {
        ParticipantView {
            user_id: self.user_id.clone(),
            user_name: self.user_name.clone(),
            color: self.color.clone(),
            joined_at: self.joined_at,
            permissions: self.permissions,
        }
    }

    #[must_use]
    pub fn record(&self) -> ParticipantRecord {
        ParticipantRecord {
            user_id: self.user_id.clone(),
            user_name: self.user_name.clone(),
            color: self.color.clone(),
            joined_at: self.joined_at,
            is_active: self.active,
            permissions: self.permissions,
        }
    }

    fn from_record(rec: &ParticipantRecord) -> Self {
        Self {
            user_id: rec.user_id.clone(),
            user_name: rec.user_name.clone(),
            color: rec.color.clone(),
            joined_at: rec.joined_at,
            active: false,
            permissions: rec.permissions,
            conn: None,
        }
    }

    /// Active and bound to `conn_id`. A superseded connection is never bound.
    #[must_use]
    pub fn bound_to(&self, conn_id: Uuid) -> bool {
        self.active && self.conn.as_ref().is_some_and(|c| c.id == conn_id)
    }
}

// =============================================================================
// ROOM STATE
// =============================================================================

/// Minimal room metadata cached for membership decisions. Access secrets are
/// not cached; every join checks them against a fresh store read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomMeta {
    pub whiteboard_id: String,
    pub max_participants: u32,
}

impl RoomMeta {
    #[must_use]
    pub fn from_record(record: &RoomRecord, default_max: u32) -> Self {
        let max_participants = if record.max_participants == 0 { default_max } else { record.max_participants };
        Self { whiteboard_id: record.whiteboard_id.clone(), max_participants }
    }
}

/// Per-room live state.
pub struct RoomState {
    pub room_id: String,
    pub meta: RoomMeta,
    /// Participants keyed by user id. Inactive records are kept.
    pub participants: HashMap<String, Participant>,
    pub history: History,
    pub last_activity: i64,
    /// Set when the room is removed from the registry. Late joiners holding
    /// the old `Arc` must re-resolve.
    pub evicted: bool,
}

impl RoomState {
    #[must_use]
    pub fn new(room_id: impl Into<String>, meta: RoomMeta) -> Self {
        Self {
            room_id: room_id.into(),
            meta,
            participants: HashMap::new(),
            history: History::default(),
            last_activity: crate::event::now_ms(),
            evicted: false,
        }
    }

    /// Hydrate from a store record. Every seeded participant starts inactive.
    #[must_use]
    pub fn from_record(record: &RoomRecord, default_max: u32) -> Self {
        let mut room = Self::new(record.room_id.clone(), RoomMeta::from_record(record, default_max));
        for rec in &record.participants {
            room.participants.insert(rec.user_id.clone(), Participant::from_record(rec));
        }
        room
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.participants.values().filter(|p| p.active).count()
    }

    /// Active participant currently bound to `conn_id`.
    #[must_use]
    pub fn member_by_conn(&self, conn_id: Uuid) -> Option<&Participant> {
        self.participants.values().find(|p| p.bound_to(conn_id))
    }

    /// Active participants except `exclude_user`, oldest first.
    #[must_use]
    pub fn snapshot(&self, exclude_user: Option<&str>) -> Vec<ParticipantView> {
        let mut list: Vec<&Participant> = self
            .participants
            .values()
            .filter(|p| p.active && exclude_user != Some(p.user_id.as_str()))
            .collect();
        list.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then_with(|| a.user_id.cmp(&b.user_id)));
        list.into_iter().map(Participant::view).collect()
    }

    /// Deliver to every active participant, optionally skipping one user.
    pub fn broadcast(&self, event: &ServerEvent, exclude_user: Option<&str>) {
        for p in self.participants.values() {
            if !p.active || exclude_user == Some(p.user_id.as_str()) {
                continue;
            }
            if let Some(conn) = &p.conn {
                conn.deliver(event.clone());
            }
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = crate::event::now_ms();
    }
}

/// Registry entry. `Arc` so callers can drop the registry lock before locking the room.
pub type RoomHandle = Arc<Mutex<RoomState>>;

// =============================================================================
// APP STATE
// =============================================================================

/// Shared application state, injected into Axum handlers via State extractor.
/// Clone is required by Axum; all inner fields are Arc-wrapped.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn RoomStore>,
    pub tokens: Arc<dyn TokenResolver>,
    pub rooms: Arc<RwLock<HashMap<String, RoomHandle>>>,
    /// Ordered queue into the persistence worker.
    pub persist_tx: mpsc::Sender<PersistJob>,
    /// Count of writes that were dropped after exhausting retries.
    pub persist_failures: Arc<AtomicU64>,
}

impl AppState {
    /// Build state and spawn the persistence worker. Must run inside a Tokio runtime.
    #[must_use]
    pub fn new(config: Config, store: Arc<dyn RoomStore>, tokens: Arc<dyn TokenResolver>) -> Self {
        let persist_failures = Arc::new(AtomicU64::new(0));
        let persist_tx = persistence::spawn_persistence_worker(&config, store.clone(), persist_failures.clone());
        Self {
            config: Arc::new(config),
            store,
            tokens,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            persist_tx,
            persist_failures,
        }
    }

    #[must_use]
    pub fn persist_failure_count(&self) -> u64 {
        self.persist_failures.load(Ordering::Relaxed)
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================


#[cfg(test)]
#[path = "state_test.rs"]
mod tests;
