//! Sync tuning configuration.
//!
//! Every field has a default so embedders can ship an empty `{}` and only
//! override what they need.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::util::compact_text;

const DEFAULT_WORKER_LIMIT: usize = 4;
const DEFAULT_MAX_CHUNK_ENTRIES: i32 = 50;
const DEFAULT_MAX_TRANSIENT_RETRIES: u32 = 5;
const DEFAULT_NETWORK_RETRY_BASE_MS: u64 = 1_000;
const DEFAULT_EXPIRY_SKEW_SECS: i64 = 60;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CONFLICT_MARKER: &str = "conflicting";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// Upper bound on concurrent linked-notebook pulls and concurrent pushes.
    #[serde(default = "default_worker_limit")]
    pub worker_limit: usize,
    /// Maximum entries requested per sync chunk.
    #[serde(default = "default_max_chunk_entries")]
    pub max_chunk_entries: i32,
    /// Retry budget for transient failures of a single call.
    #[serde(default = "default_max_transient_retries")]
    pub max_transient_retries: u32,
    /// First backoff step for network failures, doubled per attempt.
    #[serde(default = "default_network_retry_base_ms")]
    pub network_retry_base_ms: u64,
    /// Credentials expiring within this window are refreshed before use.
    #[serde(default = "default_expiry_skew_secs")]
    pub credential_expiry_skew_secs: i64,
    /// Per-request timeout of the HTTP transport.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Word inserted into the names of entities renamed by conflict resolution.
    #[serde(default = "default_conflict_marker")]
    pub conflict_marker: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            worker_limit: DEFAULT_WORKER_LIMIT,
            max_chunk_entries: DEFAULT_MAX_CHUNK_ENTRIES,
            max_transient_retries: DEFAULT_MAX_TRANSIENT_RETRIES,
            network_retry_base_ms: DEFAULT_NETWORK_RETRY_BASE_MS,
            credential_expiry_skew_secs: DEFAULT_EXPIRY_SKEW_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            conflict_marker: DEFAULT_CONFLICT_MARKER.to_string(),
        }
    }
}

impl SyncConfig {
    /// Parse and validate a JSON configuration payload.
    pub fn from_json_str(payload: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(payload).map_err(|error| {
            Error::Configuration(format!(
                "invalid sync config JSON: {}",
                compact_text(&error.to_string())
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_limit == 0 {
            return Err(Error::Configuration(
                "worker_limit must be at least 1".to_string(),
            ));
        }
        if self.max_chunk_entries < 1 {
            return Err(Error::Configuration(
                "max_chunk_entries must be at least 1".to_string(),
            ));
        }
        if self.credential_expiry_skew_secs < 0 {
            return Err(Error::Configuration(
                "credential_expiry_skew_secs must not be negative".to_string(),
            ));
        }
        if self.conflict_marker.trim().is_empty() {
            return Err(Error::Configuration(
                "conflict_marker must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub const fn network_retry_base(&self) -> Duration {
        Duration::from_millis(self.network_retry_base_ms)
    }

    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

const fn default_worker_limit() -> usize {
    DEFAULT_WORKER_LIMIT
}

const fn default_max_chunk_entries() -> i32 {
    DEFAULT_MAX_CHUNK_ENTRIES
}

const fn default_max_transient_retries() -> u32 {
    DEFAULT_MAX_TRANSIENT_RETRIES
}

const fn default_network_retry_base_ms() -> u64 {
    DEFAULT_NETWORK_RETRY_BASE_MS
}

const fn default_expiry_skew_secs() -> i64 {
    DEFAULT_EXPIRY_SKEW_SECS
}

const fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_conflict_marker() -> String {
    DEFAULT_CONFLICT_MARKER.to_string()
}
