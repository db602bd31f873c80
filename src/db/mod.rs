//! Postgres bootstrap for `PgStore`.
//!
//! The schema under `migrations/` holds whiteboards, their collaborators,
//! rooms with their participant records, and the append-only drawing action
//! log. `main` calls `init_pool` only when `DATABASE_URL` is set; otherwise
//! the engine runs on the in-memory store.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

/// Connect, then bring the room/action schema up to date.
///
/// # Errors
///
/// Returns an error if the database is unreachable or a migration fails.
pub async fn init_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;

    sqlx::migrate!("src/db/migrations").run(&pool).await?;
    info!(max_connections, "database ready; migrations applied");

    Ok(pool)
}
