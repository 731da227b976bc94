//! Runtime configuration for the sync layer.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{SyncError, SyncResult};

pub const DEFAULT_ORIGIN: &str = "http://127.0.0.1:8080";
pub const DEFAULT_RECONNECT_MS: u64 = 5_000;
pub const DEFAULT_DEBOUNCE_MS: u64 = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Page origin; its HTTP(S) scheme is swapped for ws(s) when streaming.
    pub origin: String,
    /// Fixed delay before reopening a stream after an abnormal close.
    pub reconnect_delay_ms: u64,
    /// Quiescence window for the initial snapshot and log batches.
    pub debounce_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            origin: DEFAULT_ORIGIN.to_string(),
            reconnect_delay_ms: DEFAULT_RECONNECT_MS,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
        }
    }
}

fn parse_ms(key: &str, raw: Option<String>, default: u64) -> SyncResult<u64> {
    match raw {
        None => Ok(default),
        Some(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|e| SyncError::Config(format!("{}={:?}: {}", key, s, e))),
    }
}

impl SyncConfig {
    /// Read `KDASH_ORIGIN`, `KDASH_RECONNECT_MS` and `KDASH_DEBOUNCE_MS`, falling
    /// back to defaults for unset variables.
    pub fn from_env() -> SyncResult<Self> {
        Self::from_vars(|k| std::env::var(k).ok())
    }

    pub fn from_vars(get: impl Fn(&str) -> Option<String>) -> SyncResult<Self> {
        let cfg = Self {
            origin: get("KDASH_ORIGIN").unwrap_or_else(|| DEFAULT_ORIGIN.to_string()),
            reconnect_delay_ms: parse_ms("KDASH_RECONNECT_MS", get("KDASH_RECONNECT_MS"), DEFAULT_RECONNECT_MS)?,
            debounce_ms: parse_ms("KDASH_DEBOUNCE_MS", get("KDASH_DEBOUNCE_MS"), DEFAULT_DEBOUNCE_MS)?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> SyncResult<()> {
        kdash_transport::stream_url(&self.origin, "/", &[])
            .map(|_| ())
            .map_err(|e| SyncError::Config(e.to_string()))
    }

    pub fn reconnect_delay(&self) -> Duration { Duration::from_millis(self.reconnect_delay_ms) }
    pub fn debounce(&self) -> Duration { Duration::from_millis(self.debounce_ms) }
}
