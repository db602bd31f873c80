//! Event — the wire vocabulary between clients and the session engine.
//!
//! ARCHITECTURE
//! ============
//! Every WebSocket text message is one JSON object of the shape
//! `{"event": "<kebab-name>", "data": {...}}`. Inbound messages decode into
//! the closed `ClientEvent` enum; outbound messages are built from
//! `ServerEvent`. Nothing past the receive loop ever sees raw JSON.
//!
//! DESIGN
//! ======
//! - Action payloads stay opaque (`serde_json::Value`) but their shape is
//!   checked by `ActionInput::validate` before any room state is touched.
//! - Every room-scoped outbound event carries `roomId`; a connection may be
//!   a member of several rooms at once.
//! - Client timestamps are never read. The server stamps its own.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::state::{DrawingAction, Permissions};

// =============================================================================
// ERROR CODES
// =============================================================================

/// Grepable error code and retryable flag for structured error events.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

/// Boundary validation failure for an inbound message.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EventError {
    #[error("malformed event: {0}")]
    Malformed(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl ErrorCode for EventError {
    fn error_code(&self) -> &'static str {
        "INVALID_EVENT"
    }
}

/// Current time as milliseconds since Unix epoch.
pub(crate) fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

// =============================================================================
// ACTIONS
// =============================================================================

/// Closed set of drawing action kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Draw,
    Erase,
    Clear,
    Undo,
    Redo,
    Modify,
    Delete,
}

impl ActionKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draw => "draw",
            Self::Erase => "erase",
            Self::Clear => "clear",
            Self::Undo => "undo",
            Self::Redo => "redo",
            Self::Modify => "modify",
            Self::Delete => "delete",
        }
    }

    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "draw" => Some(Self::Draw),
            "erase" => Some(Self::Erase),
            "clear" => Some(Self::Clear),
            "undo" => Some(Self::Undo),
            "redo" => Some(Self::Redo),
            "modify" => Some(Self::Modify),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    /// Undo and redo are resolved by the history coordinator, not relayed verbatim.
    #[must_use]
    pub fn is_history(self) -> bool {
        matches!(self, Self::Undo | Self::Redo)
    }

    /// Whether a participant holding `perms` may submit this kind.
    #[must_use]
    pub fn permitted(self, perms: Permissions) -> bool {
        match self {
            Self::Draw | Self::Modify | Self::Undo | Self::Redo => perms.can_draw,
            Self::Erase | Self::Delete => perms.can_erase,
            Self::Clear => perms.can_clear,
        }
    }

    /// Kinds whose payload must be a JSON object.
    fn requires_object_payload(self) -> bool {
        matches!(self, Self::Draw | Self::Erase | Self::Modify | Self::Delete)
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Action as submitted by a client, before validation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionInput {
    #[serde(alias = "type")]
    pub kind: ActionKind,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    /// Idempotency token chosen by the origin, echoed back untouched.
    #[serde(default)]
    pub client_token: Option<String>,
    /// Any other top-level fields the client attached (tool, layer, ...).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Action whose shape has been checked at the boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidAction {
    pub kind: ActionKind,
    pub data: serde_json::Value,
    pub client_token: Option<String>,
    pub extra: serde_json::Map<String, serde_json::Value>,
}

pub const MAX_CLIENT_TOKEN_LEN: usize = 128;

/// Top-level keys the server stamps itself. Clients cannot set them.
pub const RESERVED_ACTION_KEYS: [&str; 8] =
    ["id", "kind", "type", "userId", "userName", "timestamp", "targetId", "roomId"];

impl ActionInput {
    /// Check payload shape and size.
    ///
    /// Payload and extra fields are passed through unchanged, minus any
    /// server-owned keys in `extra`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPayload` when a geometry-bearing kind lacks an object
    /// payload, the payload exceeds `max_bytes`, or the client token is oversized.
    pub fn validate(self, max_bytes: usize) -> Result<ValidAction, EventError> {
        let data = match self.data {
            Some(v @ serde_json::Value::Object(_)) => v,
            Some(_) if self.kind.requires_object_payload() => {
                return Err(EventError::InvalidPayload(format!("{} payload must be an object", self.kind)));
            }
            None if self.kind.requires_object_payload() => {
                return Err(EventError::InvalidPayload(format!("{} requires a payload", self.kind)));
            }
            Some(v) => v,
            None => serde_json::Value::Null,
        };

        let mut extra = self.extra;
        extra.retain(|key, _| !RESERVED_ACTION_KEYS.contains(&key.as_str()));

        let size = serde_json::to_vec(&data)
            .map_or(usize::MAX, |b| b.len())
            .saturating_add(serde_json::to_vec(&extra).map_or(usize::MAX, |b| b.len()));
        if size > max_bytes {
            return Err(EventError::InvalidPayload(format!("payload is {size} bytes (max {max_bytes})")));
        }

        if let Some(token) = &self.client_token {
            if token.len() > MAX_CLIENT_TOKEN_LEN {
                return Err(EventError::InvalidPayload("clientToken too long".into()));
            }
        }

        Ok(ValidAction { kind: self.kind, data, client_token: self.client_token, extra })
    }
}

/// Canvas-space cursor position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    #[must_use]
    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

// =============================================================================
// INBOUND
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    Join {
        room_id: String,
        #[serde(default)]
        secret: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    DrawingAction { room_id: String, action: ActionInput },
    #[serde(rename_all = "camelCase")]
    CursorMove { room_id: String, position: Position },
    #[serde(rename_all = "camelCase")]
    ChatMessage {
        room_id: String,
        #[serde(alias = "message")]
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    Typing { room_id: String, is_typing: bool },
    #[serde(rename_all = "camelCase")]
    Undo { room_id: String },
    #[serde(rename_all = "camelCase")]
    Redo { room_id: String },
    #[serde(rename_all = "camelCase")]
    Leave { room_id: String },
}

impl ClientEvent {
    /// Decode one inbound text message.
    ///
    /// # Errors
    ///
    /// Returns `Malformed` if the JSON does not match any known event.
    pub fn parse(text: &str) -> Result<Self, EventError> {
        serde_json::from_str(text).map_err(|e| EventError::Malformed(e.to_string()))
    }

    #[must_use]
    pub fn room_id(&self) -> &str {
        match self {
            Self::Join { room_id, .. }
            | Self::DrawingAction { room_id, .. }
            | Self::CursorMove { room_id, .. }
            | Self::ChatMessage { room_id, .. }
            | Self::Typing { room_id, .. }
            | Self::Undo { room_id }
            | Self::Redo { room_id }
            | Self::Leave { room_id } => room_id,
        }
    }

    /// High-frequency events that are never logged at info level.
    #[must_use]
    pub fn is_chatter(&self) -> bool {
        matches!(self, Self::CursorMove { .. } | Self::Typing { .. })
    }
}

// =============================================================================
// OUTBOUND
// =============================================================================

/// One entry of a `room-participants` snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantView {
    pub user_id: String,
    pub user_name: String,
    pub color: String,
    pub joined_at: i64,
    pub permissions: Permissions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    RoomParticipants { room_id: String, participants: Vec<ParticipantView> },
    #[serde(rename_all = "camelCase")]
    UserJoined { room_id: String, user_id: String, user_name: String, color: String },
    #[serde(rename_all = "camelCase")]
    UserLeft { room_id: String, user_id: String, user_name: String },
    #[serde(rename_all = "camelCase")]
    CursorMoved { room_id: String, user_id: String, position: Position, color: String },
    #[serde(rename_all = "camelCase")]
    CursorRemove { room_id: String, user_id: String },
    #[serde(rename_all = "camelCase")]
    DrawingAction {
        room_id: String,
        #[serde(flatten)]
        action: DrawingAction,
    },
    #[serde(rename_all = "camelCase")]
    ChatMessage { room_id: String, user_id: String, user_name: String, text: String, timestamp: i64 },
    #[serde(rename_all = "camelCase")]
    Typing { room_id: String, user_id: String, user_name: String, is_typing: bool },
    #[serde(rename_all = "camelCase")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        message: String,
        code: String,
        #[serde(default)]
        retryable: bool,
    },
}

impl ServerEvent {
    /// Build an `error` event from a typed error.
    #[must_use]
    pub fn error_from(room_id: Option<&str>, err: &(impl ErrorCode + ?Sized)) -> Self {
        Self::Error {
            room_id: room_id.map(str::to_owned),
            message: err.to_string(),
            code: err.error_code().to_owned(),
            retryable: err.retryable(),
        }
    }

    /// Wire name, for logging.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::RoomParticipants { .. } => "room-participants",
            Self::UserJoined { .. } => "user-joined",
            Self::UserLeft { .. } => "user-left",
            Self::CursorMoved { .. } => "cursor-moved",
            Self::CursorRemove { .. } => "cursor-remove",
            Self::DrawingAction { .. } => "drawing-action",
            Self::ChatMessage { .. } => "chat-message",
            Self::Typing { .. } => "typing",
            Self::Error { .. } => "error",
        }
    }

    #[must_use]
    pub fn is_chatter(&self) -> bool {
        matches!(self, Self::CursorMoved { .. } | Self::Typing { .. })
    }
}

#[cfg(test)]
#[path = "event_test.rs"]
mod tests;
