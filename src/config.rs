//! Runtime configuration loaded from the environment.
//!
//! DESIGN
//! ======
//! Every knob has a default so the server boots with an empty environment.
//! `main` calls `dotenvy::dotenv()` first, so a local `.env` file feeds the
//! same lookups. Unparseable values fall back to the default rather than
//! failing startup.

use std::str::FromStr;
use std::time::Duration;

use crate::doc::DiffOptions;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_SNAPSHOT_FLUSH_INTERVAL_MS: u64 = 250;
const DEFAULT_JOIN_TIMEOUT_MS: u64 = 3000;
const DEFAULT_CLIENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// `None` runs with in-memory access and snapshot collaborators.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub snapshot_flush_interval: Duration,
    /// How long a session waits for the initial snapshot before starting empty.
    pub join_timeout: Duration,
    /// Bounded outbound queue per connected client.
    pub client_channel_capacity: usize,
    pub diff: DiffOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            database_url: None,
            db_max_connections: DEFAULT_DB_MAX_CONNECTIONS,
            snapshot_flush_interval: Duration::from_millis(DEFAULT_SNAPSHOT_FLUSH_INTERVAL_MS),
            join_timeout: Duration::from_millis(DEFAULT_JOIN_TIMEOUT_MS),
            client_channel_capacity: DEFAULT_CLIENT_CHANNEL_CAPACITY,
            diff: DiffOptions::default(),
        }
    }
}

impl Config {
    #[must_use]
    pub fn from_env() -> Self {
        let diff_defaults = DiffOptions::default();
        Self {
            port: env_parse("PORT", DEFAULT_PORT),
            database_url: env_string("DATABASE_URL"),
            db_max_connections: env_parse("DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS),
            snapshot_flush_interval: Duration::from_millis(env_parse(
                "SNAPSHOT_FLUSH_INTERVAL_MS",
                DEFAULT_SNAPSHOT_FLUSH_INTERVAL_MS,
            )),
            join_timeout: Duration::from_millis(env_parse("JOIN_TIMEOUT_MS", DEFAULT_JOIN_TIMEOUT_MS)),
            // Zero would make every client channel unusable.
            client_channel_capacity: env_parse("CLIENT_CHANNEL_CAPACITY", DEFAULT_CLIENT_CHANNEL_CAPACITY).max(1),
            diff: DiffOptions {
                compare_field: env_string("DIFF_COMPARE_FIELD").unwrap_or(diff_defaults.compare_field),
                compare_default: env_string("DIFF_COMPARE_DEFAULT").unwrap_or(diff_defaults.compare_default),
                category_field: env_string("DIFF_CATEGORY_FIELD").unwrap_or(diff_defaults.category_field),
                fallback_category: env_string("DIFF_FALLBACK_CATEGORY").unwrap_or(diff_defaults.fallback_category),
            },
        }
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Non-empty string value for `key`, if set.
pub(crate) fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
