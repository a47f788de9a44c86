//! Cluster identity configuration.

use serde::Deserialize;

/// Cluster configuration.
///
/// The transport is provided by the embedding deployment; this section only
/// carries the identity this node announces in the replicated presence
/// state.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Name this server registers under in the cluster state.
    #[serde(default = "default_server_name")]
    pub server_name: String,
}

pub(crate) fn default_server_name() -> String {
    "rtlite-1".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            server_name: default_server_name(),
        }
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.server_name.is_empty() {
            return Err("cluster.server_name must not be empty".to_string());
        }
        Ok(())
    }
}
