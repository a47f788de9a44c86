//! Listener and worker configuration.

use std::net::SocketAddr;

use serde::Deserialize;

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address for the client protocol.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// Number of worker threads (0 = one per CPU core).
    #[serde(default)]
    pub workers: usize,
}

fn default_bind() -> SocketAddr {
    "0.0.0.0:6021".parse().expect("valid default bind")
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            workers: 0,
        }
    }
}
