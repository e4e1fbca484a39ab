//! Engine configuration.

use crate::error::{EngineError, Result};
use crate::subscriptions::DEFAULT_BUFFER_SIZE;
use serde::{Deserialize, Serialize};

/// Engine configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Entries kept per log tail (and fetched on load).
    pub log_capacity: usize,

    /// Buffered messages per subscription before it is dropped as slow.
    pub subscription_buffer: usize,

    /// Name prefix for bulk-fetch threads.
    pub fetch_thread_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_capacity: 100,
            subscription_buffer: DEFAULT_BUFFER_SIZE,
            fetch_thread_prefix: "docket-fetch".to_string(),
        }
    }
}

impl EngineConfig {
    /// Parse from JSON; missing keys take their defaults.
    pub fn from_json(input: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(input)
            .map_err(|e| EngineError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.log_capacity == 0 {
            return Err(EngineError::InvalidConfig(
                "log_capacity must be positive".to_string(),
            ));
        }
        if self.subscription_buffer == 0 {
            return Err(EngineError::InvalidConfig(
                "subscription_buffer must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
