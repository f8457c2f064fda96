//! Runtime configuration, read from `STUDY_SYNC_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::event::DEFAULT_HISTORY_CAPACITY;

/// Default timeout for remote requests, in milliseconds.
pub const DEFAULT_REMOTE_TIMEOUT_MS: u64 = 10_000;

const ENV_DATA_DIR: &str = "STUDY_SYNC_DATA_DIR";
const ENV_REMOTE_URL: &str = "STUDY_SYNC_REMOTE_URL";
const ENV_EVENT_HISTORY: &str = "STUDY_SYNC_EVENT_HISTORY";
const ENV_REMOTE_TIMEOUT_MS: &str = "STUDY_SYNC_REMOTE_TIMEOUT_MS";

/// Settings shared by the coordinator and its front ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Directory of the file-backed local cache; `None` keeps it in memory.
    pub data_dir: Option<PathBuf>,
    /// Base URL of the document service; `None` runs local-only.
    pub remote_url: Option<String>,
    /// Number of emissions kept in the event bus history.
    pub event_history: usize,
    /// Timeout applied to each remote request.
    pub remote_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            remote_url: None,
            event_history: DEFAULT_HISTORY_CAPACITY,
            remote_timeout: Duration::from_millis(DEFAULT_REMOTE_TIMEOUT_MS),
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables.
    ///
    /// Reads `STUDY_SYNC_DATA_DIR`, `STUDY_SYNC_REMOTE_URL`,
    /// `STUDY_SYNC_EVENT_HISTORY` and `STUDY_SYNC_REMOTE_TIMEOUT_MS`.
    /// Unset, empty or unparseable values fall back to the defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let value = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let event_history = value(ENV_EVENT_HISTORY)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(defaults.event_history);
        let remote_timeout = value(ENV_REMOTE_TIMEOUT_MS)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map_or(defaults.remote_timeout, Duration::from_millis);

        Self {
            data_dir: value(ENV_DATA_DIR).map(PathBuf::from),
            remote_url: value(ENV_REMOTE_URL),
            event_history,
            remote_timeout,
        }
    }
}
