//! Protocol and resource limits.

use serde::Deserialize;

/// Maximum wire frame size (1MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Maximum concurrent client connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

/// Limits configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum size of a single wire frame in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Maximum concurrent client connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            max_connections: default_max_connections(),
        }
    }
}

impl LimitsConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_message_size < 1024 {
            return Err("limits.max_message_size must be at least 1024".to_string());
        }
        if self.max_connections == 0 {
            return Err("limits.max_connections must be greater than zero".to_string());
        }
        Ok(())
    }
}
