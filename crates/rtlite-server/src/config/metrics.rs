//! Metrics endpoint configuration.

use std::net::SocketAddr;

use serde::Deserialize;

/// Default bind address for the metrics endpoint.
pub const DEFAULT_METRICS_BIND: &str = "0.0.0.0:9464";

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether the metrics HTTP endpoint is enabled.
    #[serde(default)]
    pub enabled: bool,
    /// Listen address for the metrics endpoint.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
}

fn default_bind() -> SocketAddr {
    DEFAULT_METRICS_BIND.parse().expect("valid default bind")
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_bind(),
        }
    }
}
