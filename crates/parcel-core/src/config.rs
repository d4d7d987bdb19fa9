//! Dispatch configuration.
//!
//! Every field has a default, so a config file only needs the keys it changes.
//!
//! ```json
//! { "buffer_threshold": 4096, "retry": { "base_delay_ms": 50 } }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dispatch::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Binary payloads strictly larger than this (bytes) travel as separate buffers.
    pub buffer_threshold: usize,

    /// At most this many buffers are extracted per object.
    pub item_threshold: usize,

    /// Backoff between resends of an unacknowledged task.
    pub retry: RetryPolicy,

    /// How long the dispatch loop sleeps when nothing wakes it.
    pub idle_poll_ms: u64,

    /// How long to wait for an engine to acknowledge a control request.
    pub control_timeout_ms: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl DispatchConfig {
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.idle_poll_ms == 0 {
            return Err(ConfigError::Invalid("idle_poll_ms must be positive".to_string()));
        }
        if !(self.retry.multiplier.is_finite() && self.retry.multiplier >= 1.0) {
            return Err(ConfigError::Invalid(
                "retry.multiplier must be a finite number >= 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            buffer_threshold: 1024,
            item_threshold: 64,
            retry: RetryPolicy::default(),
            idle_poll_ms: 50,
            control_timeout_ms: 5_000,
        }
    }
}
