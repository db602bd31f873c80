//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! The engine exposes exactly two endpoints: the WebSocket upgrade at
//! `/api/ws`, and a `/healthz` probe that also reports the live room count
//! and how many writes the persistence worker has dropped.

pub mod ws;

use axum::Router;
use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use serde_json::{Value, json};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/ws", get(ws::handle_ws))
        .route("/healthz", get(healthz))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> Json<Value> {
    let rooms = state.rooms.read().await.len();
    Json(json!({
        "status": "ok",
        "rooms": rooms,
        "persistFailures": state.persist_failure_count(),
    }))
}
