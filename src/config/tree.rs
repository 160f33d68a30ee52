use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Subtree watch settings
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct TreeConfig {
    /// How long the first `get()` waits for the initial full sync, in milliseconds
    ///
    /// Default: 0, wait until the sync arrives
    #[serde(default)]
    pub init_timeout_ms: u64,
}

impl TreeConfig {
    /// `None` when the first `get()` waits without bound
    pub fn init_timeout(&self) -> Option<Duration> {
        (self.init_timeout_ms > 0).then(|| Duration::from_millis(self.init_timeout_ms))
    }

    pub fn validate(&self) -> Result<()> {
        // One day
        if self.init_timeout_ms > 86_400_000 {
            return Err(Error::Config(ConfigError::Message(format!(
                "tree init_timeout_ms must be at most 86400000, got {}",
                self.init_timeout_ms
            ))));
        }
        Ok(())
    }
}
