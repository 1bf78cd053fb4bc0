// Runtime configuration for the finder link core
//
// Loaded from JSON. Every field is optional in the input; missing fields take
// their defaults.

use crate::sync::LockTimeoutPolicy;
use crate::transport::ble::framing::{DEFAULT_MAX_FRAME_LEN, LENGTH_PREFIX_SIZE};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FinderConfig {
    /// Connect timeout applied when the caller gives none, in seconds
    pub connect_timeout_secs: u64,

    /// Longest a GATT operation may wait for the device lock, in seconds
    pub lock_ceiling_secs: u64,

    /// What happens when the lock ceiling is hit
    pub lock_timeout_policy: LockTimeoutPolicy,

    /// Concurrent GATT operations allowed per device
    pub lock_permits: usize,

    /// Largest write the link accepts in one go
    pub max_chunk_size: usize,

    /// Largest framed packet accepted, length prefix included
    pub max_frame_len: u32,
}

impl Default for FinderConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            lock_ceiling_secs: 300,
            lock_timeout_policy: LockTimeoutPolicy::ForceRelease,
            lock_permits: 1,
            max_chunk_size: 20,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl FinderConfig {
    /// Parse and validate a JSON document
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: FinderConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "max_chunk_size must be greater than 0".to_string(),
            ));
        }
        if self.lock_permits == 0 {
            return Err(ConfigError::Invalid(
                "lock_permits must be greater than 0".to_string(),
            ));
        }
        if self.lock_permits > Semaphore::MAX_PERMITS {
            return Err(ConfigError::Invalid(format!(
                "lock_permits must be at most {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "connect_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.lock_ceiling_secs == 0 {
            return Err(ConfigError::Invalid(
                "lock_ceiling_secs must be greater than 0".to_string(),
            ));
        }
        if (self.max_frame_len as usize) < LENGTH_PREFIX_SIZE {
            return Err(ConfigError::Invalid(format!(
                "max_frame_len must be at least {}",
                LENGTH_PREFIX_SIZE
            )));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn lock_ceiling(&self) -> Duration {
        Duration::from_secs(self.lock_ceiling_secs)
    }

    /// Builder: set the default connect timeout
    ///
    /// Stored in whole seconds; a partial second rounds up, so any non-zero
    /// duration stays non-zero.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_secs = whole_secs_rounded_up(timeout);
        self
    }

    /// Builder: set the link chunk size
    pub fn with_max_chunk_size(mut self, size: usize) -> Self {
        self.max_chunk_size = size;
        self
    }

    /// Builder: set the lock ceiling and what happens when it is hit
    pub fn with_lock_ceiling(mut self, ceiling: Duration, policy: LockTimeoutPolicy) -> Self {
        self.lock_ceiling_secs = whole_secs_rounded_up(ceiling);
        self.lock_timeout_policy = policy;
        self
    }
}

fn whole_secs_rounded_up(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs.saturating_add(1)
    } else {
        secs
    }
}
