//! Runtime configuration parsed from environment variables.
//!
//! DESIGN
//! ======
//! Everything is read once at startup. Parsing goes through a lookup
//! closure so tests can feed a fixed map instead of mutating the process
//! environment.

use std::time::Duration;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_CONN_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_MAX_ACTION_BYTES: usize = 64 * 1024;
pub const DEFAULT_MAX_CHAT_CHARS: usize = 2000;
pub const DEFAULT_ROOM_SWEEP_INTERVAL_MS: u64 = 5000;
pub const DEFAULT_MAX_PARTICIPANTS: u32 = 10;
pub const DEFAULT_PERSIST_QUEUE_CAPACITY: usize = 8192;
pub const DEFAULT_PERSIST_RETRIES: usize = 3;
pub const DEFAULT_PERSIST_RETRY_BASE_MS: u64 = 20;
pub const DEFAULT_MAX_HISTORY_DEPTH: usize = 500;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// HMAC secret used to verify session tokens.
    pub jwt_secret: String,
    /// Postgres URL. `None` selects the in-memory store.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    /// Bound on each connection's outbound queue. Overflow drops events for that recipient.
    pub conn_queue_capacity: usize,
    /// Maximum serialized size of one drawing action payload.
    pub max_action_bytes: usize,
    pub max_chat_chars: usize,
    /// How often live rooms are re-validated against the store.
    pub room_sweep_interval: Duration,
    /// Capacity applied when a room record carries no usable limit.
    pub default_max_participants: u32,
    pub persist_queue_capacity: usize,
    pub persist_retries: usize,
    pub persist_retry_base: Duration,
    /// Undo entries kept per room. Older entries can no longer be undone.
    pub max_history_depth: usize,
}

impl Config {
    /// Build config from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if `JWT_SECRET` is missing or a numeric variable does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Same as [`Config::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let jwt_secret = lookup("JWT_SECRET")
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("JWT_SECRET"))?;

        Ok(Self {
            port: parse_or(&lookup, "PORT", DEFAULT_PORT)?,
            jwt_secret,
            database_url: lookup("DATABASE_URL").filter(|s| !s.is_empty()),
            db_max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS)?,
            conn_queue_capacity: parse_or(&lookup, "CONN_QUEUE_CAPACITY", DEFAULT_CONN_QUEUE_CAPACITY)?.max(1),
            max_action_bytes: parse_or(&lookup, "MAX_ACTION_BYTES", DEFAULT_MAX_ACTION_BYTES)?,
            max_chat_chars: parse_or(&lookup, "MAX_CHAT_CHARS", DEFAULT_MAX_CHAT_CHARS)?,
            room_sweep_interval: Duration::from_millis(parse_or(
                &lookup,
                "ROOM_SWEEP_INTERVAL_MS",
                DEFAULT_ROOM_SWEEP_INTERVAL_MS,
            )?
            .max(1)),
            default_max_participants: parse_or(&lookup, "DEFAULT_MAX_PARTICIPANTS", DEFAULT_MAX_PARTICIPANTS)?,
            persist_queue_capacity: parse_or(&lookup, "PERSIST_QUEUE_CAPACITY", DEFAULT_PERSIST_QUEUE_CAPACITY)?
                .max(1),
            persist_retries: parse_or(&lookup, "PERSIST_RETRIES", DEFAULT_PERSIST_RETRIES)?.max(1),
            persist_retry_base: Duration::from_millis(parse_or(
                &lookup,
                "PERSIST_RETRY_BASE_MS",
                DEFAULT_PERSIST_RETRY_BASE_MS,
            )?),
            max_history_depth: parse_or(&lookup, "MAX_HISTORY_DEPTH", DEFAULT_MAX_HISTORY_DEPTH)?.max(1),
        })
    }

    /// Config with defaults everywhere and the given token secret.
    #[cfg(test)]
    #[must_use]
    pub fn with_secret(jwt_secret: impl Into<String>) -> Self {
        Self {
            port: DEFAULT_PORT,
            jwt_secret: jwt_secret.into(),
            database_url: None,
            db_max_connections: DEFAULT_DB_MAX_CONNECTIONS,
            conn_queue_capacity: DEFAULT_CONN_QUEUE_CAPACITY,
            max_action_bytes: DEFAULT_MAX_ACTION_BYTES,
            max_chat_chars: DEFAULT_MAX_CHAT_CHARS,
            room_sweep_interval: Duration::from_millis(DEFAULT_ROOM_SWEEP_INTERVAL_MS),
            default_max_participants: DEFAULT_MAX_PARTICIPANTS,
            persist_queue_capacity: DEFAULT_PERSIST_QUEUE_CAPACITY,
            persist_retries: DEFAULT_PERSIST_RETRIES,
            persist_retry_base: Duration::from_millis(DEFAULT_PERSIST_RETRY_BASE_MS),
            max_history_depth: DEFAULT_MAX_HISTORY_DEPTH,
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
