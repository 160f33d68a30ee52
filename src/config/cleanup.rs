//! Deferred cleanup configuration
//!
//! ```toml
//! [cleanup]
//! wait_ms = 500        # pause before every disposal attempt
//! max_attempts = 0     # 0 = retry until the predicate succeeds
//! join_on_close = false
//! join_timeout_ms = 0  # 0 = wait without bound when joining
//! ```

use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Controls how superseded values are disposed of
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct CleanupConfig {
    /// Pause before each disposal attempt, in milliseconds
    ///
    /// The first attempt is delayed too, which gives in-flight readers of the
    /// old value time to finish with it.
    ///
    /// Range: 0-3600000
    /// Default: 0 (retry immediately)
    #[serde(default)]
    pub wait_ms: u64,

    /// Maximum number of disposal attempts for one superseded value
    ///
    /// Default: 0, meaning the predicate is retried until it reports success.
    /// A positive value turns an exhausted cleanup into a reported
    /// `Error::Disposal`.
    #[serde(default)]
    pub max_attempts: u32,

    /// Whether `close()` waits for outstanding cleanup and refresh tasks
    ///
    /// Default: false (cleanup tasks keep running detached)
    #[serde(default)]
    pub join_on_close: bool,

    /// Upper bound for the join performed by `close()`, in milliseconds
    ///
    /// Default: 0 (no bound). Only used when `join_on_close = true`
    #[serde(default)]
    pub join_timeout_ms: u64,
}

impl CleanupConfig {
    pub fn wait_interval(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }

    /// `None` when retries are unbounded
    pub fn attempt_limit(&self) -> Option<u32> {
        (self.max_attempts > 0).then_some(self.max_attempts)
    }

    /// `None` when the join waits without bound
    pub fn join_timeout(&self) -> Option<Duration> {
        (self.join_timeout_ms > 0).then(|| Duration::from_millis(self.join_timeout_ms))
    }

    /// Validates configuration parameters
    ///
    /// Returns error if:
    /// - `wait_ms` is above one hour
    /// - `join_on_close` would wait forever on a cleanup that may never end
    pub fn validate(&self) -> Result<()> {
        if self.wait_ms > 3_600_000 {
            return Err(Error::Config(ConfigError::Message(format!(
                "cleanup wait_ms must be between 0 and 3600000, got {}",
                self.wait_ms
            ))));
        }

        if self.join_on_close && self.max_attempts == 0 && self.join_timeout_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "cleanup join_on_close requires max_attempts or join_timeout_ms to be set"
                    .to_string(),
            )));
        }

        Ok(())
    }
}
