//! Kernel-wide defaults.

use crate::pool::PoolArgs;
use crate::port::MAX_MESSAGE_QUEUE;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Config parsing failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config value for {field}: {reason}")]
    Value { field: &'static str, reason: String },
}

/// Defaults applied to pools and ports the kernel creates itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Arguments for generic pools installed on outputs.
    pub pool: PoolArgs,
    /// Input message queue limit before overflow.
    pub max_message_queue: usize,
    /// Initial chunk capacity of each input accumulator.
    pub accumulator_capacity: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            pool: PoolArgs::default(),
            max_message_queue: MAX_MESSAGE_QUEUE,
            accumulator_capacity: 64,
        }
    }
}

impl KernelConfig {
    /// Parse from JSON; missing fields keep their defaults.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the kernel cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.num_buffers == 0 {
            return Err(ConfigError::Value {
                field: "pool.num_buffers",
                reason: "must be at least 1".into(),
            });
        }
        if self.pool.buffer_size == 0 {
            return Err(ConfigError::Value {
                field: "pool.buffer_size",
                reason: "must be at least 1".into(),
            });
        }
        if self.max_message_queue == 0 {
            return Err(ConfigError::Value {
                field: "max_message_queue",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}
