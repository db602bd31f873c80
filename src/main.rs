mod config;
mod db;
mod event;
mod routes;
mod services;
mod state;
mod store;

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::services::auth::JwtResolver;
use crate::store::RoomStore;
use crate::store::memory::MemoryStore;
use crate::store::postgres::PgStore;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sketchroom=info,tower_http=info")),
        )
        .init();

    let config = config::Config::from_env().expect("invalid configuration");

    let store: Arc<dyn RoomStore> = match &config.database_url {
        Some(url) => {
            let pool = db::init_pool(url, config.db_max_connections)
                .await
                .expect("database init failed");
            Arc::new(PgStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using in-memory store, nothing survives a restart");
            Arc::new(MemoryStore::new())
        }
    };
    let tokens = Arc::new(JwtResolver::new(&config.jwt_secret));
    let port = config.port;

    let state = state::AppState::new(config, store, tokens);

    // Spawn background room liveness sweep.
    let _sweeper = services::room::spawn_room_sweeper(state.clone());

    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, "sketchroom listening");
    axum::serve(listener, app).await.expect("server failed");
}
