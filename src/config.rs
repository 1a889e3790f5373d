//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Tuning for task runtimes and their turn loops.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// How long the drive loop waits on the turn queue before re-checking
    /// the running flag. Bounds how quickly `stop()` is observed.
    pub poll_interval: Duration,
    /// Capacity of the per-turn queue between the scheduler and the drive loop.
    pub turn_queue_capacity: usize,
    /// Capacity of the outward chunk channel consumed by the transport.
    pub bridge_capacity: usize,
    /// Emit a `MessageStart` chunk at the beginning of every model call.
    pub announce_messages: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            turn_queue_capacity: 64,
            bridge_capacity: 64,
            announce_messages: false,
        }
    }
}

impl RuntimeConfig {
    /// Build from `DAIGENT_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            poll_interval: Duration::from_millis(env_parse(
                "DAIGENT_POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )?),
            turn_queue_capacity: env_parse(
                "DAIGENT_TURN_QUEUE_CAPACITY",
                defaults.turn_queue_capacity,
            )?
            .max(1),
            bridge_capacity: env_parse("DAIGENT_BRIDGE_CAPACITY", defaults.bridge_capacity)?.max(1),
            announce_messages: env_parse("DAIGENT_ANNOUNCE_MESSAGES", defaults.announce_messages)?,
        })
    }
}

/// HTTP server and process-level settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    /// Directory for rolling log files; stderr only when unset.
    pub log_dir: Option<PathBuf>,
    /// Language the agent is instructed to answer in.
    pub user_language: String,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            port: env_parse("DAIGENT_PORT", 5001)?,
            db_path: std::env::var("DAIGENT_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/daigent.db")),
            log_dir: std::env::var("DAIGENT_LOG_DIR").ok().map(PathBuf::from),
            user_language: std::env::var("DAIGENT_USER_LANGUAGE")
                .unwrap_or_else(|_| "English".to_string()),
        })
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}
