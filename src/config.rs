//! Session configuration

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// RSSI reported for peripherals created by connect-by-address.
pub const DIRECT_CONNECT_RSSI: i16 = 127;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid session configuration: {0}")]
    Invalid(#[from] serde_json::Error),

    #[error("max_peripherals must be at least 1")]
    ZeroCapacity,
}

/// Configuration for a session manager
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Bound on the peripheral table. `None` keeps every peripheral seen
    /// for the life of the session; `Some(n)` evicts the least recently
    /// updated peripheral that is neither connected nor connecting.
    pub max_peripherals: Option<usize>,

    pub direct_connect_rssi: i16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_peripherals: None,
            direct_connect_rssi: DIRECT_CONNECT_RSSI,
        }
    }
}

impl SessionConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_peripherals == Some(0) {
            return Err(ConfigError::ZeroCapacity);
        }
        Ok(())
    }
}
