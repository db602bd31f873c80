//! WebSocket handler — one receive loop per connection.
//!
//! DESIGN
//! ======
//! On upgrade the connection gets an outbound queue (`ConnHandle`) and enters
//! a `select!` loop:
//! - Incoming client text → parse into `ClientEvent` → dispatch to services
//! - Events queued by room peers → serialize → forward to client
//!
//! Dispatch returns the events meant for the sender only (errors). Everything
//! aimed at other participants is delivered by the services through their
//! queues, so the socket is never written from two places.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade request → resolve token, or answer 401 `AUTH_FAILED`
//! 2. Client sends events → dispatch → sender-only replies written back
//! 3. Close, transport error or handler panic → leave every room this
//!    connection joined → done
//!
//! ERROR HANDLING
//! ==============
//! Join failures and rejected actions are echoed to the sender as `error`
//! events; the connection stays open. Cursor and typing noise from a
//! non-member is dropped silently. A panic inside dispatch is contained to
//! this connection.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::FutureExt;
use tracing::{debug, error, info, warn};

use crate::event::{ClientEvent, ErrorCode, ServerEvent};
use crate::services::auth::{self, Identity};
use crate::services::relay::{self, RelayError};
use crate::services::{history, presence};
use crate::state::{AppState, ConnHandle};

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = auth::extract_token(&params, &headers).unwrap_or_default();
    let identity = match state.tokens.resolve_token(&token) {
        Ok(identity) => identity,
        Err(e) => {
            info!(error = %e, "ws: upgrade rejected");
            return (StatusCode::UNAUTHORIZED, e.error_code()).into_response();
        }
    };

    ws.on_upgrade(move |socket| run_ws(socket, state, identity))
}

// =============================================================================
// CONNECTION
// =============================================================================

/// Per-connection context. `rooms` bounds disconnect cleanup to the rooms
/// this connection actually joined.
struct ConnCtx {
    identity: Identity,
    conn: ConnHandle,
    rooms: HashSet<String>,
}

async fn run_ws(mut socket: WebSocket, state: AppState, identity: Identity) {
    let (conn, mut rx) = ConnHandle::new(state.config.conn_queue_capacity);
    let mut ctx = ConnCtx { identity, conn, rooms: HashSet::new() };
    info!(conn_id = %ctx.conn.id, user_id = %ctx.identity.user_id, "ws: client connected");

    'conn: loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        let dispatched = AssertUnwindSafe(process_inbound_text(&state, &mut ctx, &text))
                            .catch_unwind()
                            .await;
                        let Ok(replies) = dispatched else {
                            error!(conn_id = %ctx.conn.id, "ws: dispatch panicked; closing connection");
                            break;
                        };
                        for event in replies {
                            if send_event(&mut socket, &event).await.is_err() {
                                break 'conn;
                            }
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(event) = rx.recv() => {
                if send_event(&mut socket, &event).await.is_err() {
                    break;
                }
            }
        }
    }

    disconnect(&state, &mut ctx).await;
    info!(conn_id = %ctx.conn.id, user_id = %ctx.identity.user_id, "ws: client disconnected");
}

/// Implicit leave for every room the connection is still in.
async fn disconnect(state: &AppState, ctx: &mut ConnCtx) {
    for room_id in ctx.rooms.drain() {
        presence::leave(state, ctx.conn.id, &ctx.identity.user_id, &room_id).await;
    }
}

// =============================================================================
// DISPATCH
// =============================================================================

/// Parse and process one inbound text message and return events for the sender.
///
/// Kept free of socket I/O so tests can drive dispatch directly.
async fn process_inbound_text(state: &AppState, ctx: &mut ConnCtx, text: &str) -> Vec<ServerEvent> {
    let event = match ClientEvent::parse(text) {
        Ok(event) => event,
        Err(e) => {
            warn!(conn_id = %ctx.conn.id, error = %e, "ws: invalid inbound event");
            return vec![ServerEvent::error_from(None, &e)];
        }
    };

    if event.is_chatter() {
        debug!(conn_id = %ctx.conn.id, room_id = event.room_id(), "ws: recv chatter");
    } else {
        info!(conn_id = %ctx.conn.id, user_id = %ctx.identity.user_id, room_id = event.room_id(), "ws: recv event");
    }

    let conn_id = ctx.conn.id;
    match event {
        ClientEvent::Join { room_id, secret } => {
            match presence::join(state, &ctx.conn, &ctx.identity, &room_id, secret.as_deref()).await {
                Ok(outcome) => {
                    debug!(
                        conn_id = %conn_id,
                        %room_id,
                        reconnected = outcome.reconnected,
                        color = %outcome.color,
                        can_draw = outcome.permissions.can_draw,
                        peers = outcome.participants.len(),
                        "ws: joined"
                    );
                    ctx.rooms.insert(room_id);
                    Vec::new()
                }
                Err(e) => {
                    info!(conn_id = %conn_id, %room_id, code = e.error_code(), "ws: join rejected");
                    vec![ServerEvent::error_from(Some(&room_id), &e)]
                }
            }
        }
        ClientEvent::Leave { room_id } => {
            if ctx.rooms.remove(&room_id) {
                presence::leave(state, conn_id, &ctx.identity.user_id, &room_id).await;
            }
            Vec::new()
        }
        ClientEvent::DrawingAction { room_id, action } => {
            let result = relay::submit(state, conn_id, &room_id, action).await;
            reply(&room_id, result.map(|_| ()))
        }
        ClientEvent::Undo { room_id } => reply(&room_id, history::undo(state, conn_id, &room_id).await.map(|_| ())),
        ClientEvent::Redo { room_id } => reply(&room_id, history::redo(state, conn_id, &room_id).await.map(|_| ())),
        ClientEvent::ChatMessage { room_id, text } => reply(&room_id, relay::chat(state, conn_id, &room_id, &text).await),
        ClientEvent::CursorMove { room_id, position } => {
            quiet(&room_id, relay::cursor(state, conn_id, &room_id, position).await)
        }
        ClientEvent::Typing { room_id, is_typing } => {
            quiet(&room_id, relay::typing(state, conn_id, &room_id, is_typing).await)
        }
    }
}

/// Echo a relay failure to the sender only.
fn reply(room_id: &str, result: Result<(), RelayError>) -> Vec<ServerEvent> {
    match result {
        Ok(()) => Vec::new(),
        Err(e) => {
            debug!(%room_id, code = e.error_code(), error = %e, "ws: request rejected");
            vec![ServerEvent::error_from(Some(room_id), &e)]
        }
    }
}

/// Like `reply`, but high-frequency events from non-members are dropped silently.
fn quiet(room_id: &str, result: Result<(), RelayError>) -> Vec<ServerEvent> {
    match result {
        Err(RelayError::NotAMember(_)) => Vec::new(),
        other => reply(room_id, other),
    }
}

async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), ()> {
    let json = match serde_json::to_string(event) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, event = event.name(), "ws: failed to serialize event");
            return Err(());
        }
    };
    if let ServerEvent::Error { code, message, .. } = event {
        warn!(code = %code, message = %message, "ws: send error event");
    } else if !event.is_chatter() {
        debug!(event = event.name(), "ws: send event");
    }
    socket.send(Message::Text(json.into())).await.map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
