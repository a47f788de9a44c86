//! Server configuration.
//!
//! Supports configuration from:
//! - TOML file (default: `rtlite.toml`)
//! - Environment variables with `RTLITE__` prefix (double underscore for
//!   nesting)
//! - In-file variable references: `${VAR}` or `${VAR:-default}`
//!
//! Environment variable examples:
//! - `RTLITE__SERVER__BIND=0.0.0.0:6022`
//! - `RTLITE__CLUSTER__SERVER_NAME=node-2`
//! - `RTLITE__LIMITS__MAX_MESSAGE_SIZE=2097152`

mod cluster;
mod limits;
mod log;
mod metrics;
mod server;

use std::fmt;
use std::path::Path;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use cluster::ClusterConfig;
pub use limits::{LimitsConfig, DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_MESSAGE_SIZE};
pub use log::{LogConfig, LogLevel};
pub use metrics::{MetricsConfig, DEFAULT_METRICS_BIND};
pub use server::ServerConfig;

/// Expand `${NAME}` and `${NAME:-fallback}` references against the process
/// environment. An unset variable without a fallback expands to the empty
/// string; anything that does not look like a reference passes through
/// untouched.
fn expand_env_refs(input: &str) -> String {
    let pattern = Regex::new(r"\$\{(?P<name>[A-Za-z_][A-Za-z0-9_]*)(?::-(?P<fallback>[^}]*))?\}")
        .expect("env reference pattern");

    let mut out = String::with_capacity(input.len());
    let mut copied_up_to = 0;
    for captures in pattern.captures_iter(input) {
        let reference = captures.get(0).expect("whole match");
        out.push_str(&input[copied_up_to..reference.start()]);
        match std::env::var(&captures["name"]) {
            Ok(value) => out.push_str(&value),
            Err(_) => {
                if let Some(fallback) = captures.name("fallback") {
                    out.push_str(fallback.as_str());
                }
            }
        }
        copied_up_to = reference.end();
    }
    out.push_str(&input[copied_up_to..]);
    out
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration.
    pub log: LogConfig,
    /// Server configuration.
    pub server: ServerConfig,
    /// Cluster identity configuration.
    pub cluster: ClusterConfig,
    /// Limits configuration.
    pub limits: LimitsConfig,
    /// Metrics endpoint configuration.
    pub metrics: MetricsConfig,
}

/// Error raised while loading or validating the configuration.
///
/// A single message plus an optional underlying cause; callers only ever
/// report it, so no variant matching surface is exposed.
#[derive(Debug)]
pub struct ConfigError {
    message: String,
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ConfigError {
    fn invalid(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
        }
    }

    fn caused_by(
        message: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            cause: Some(Box::new(cause)),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|cause| &**cause as &(dyn std::error::Error + 'static))
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::caused_by("configuration error", e)
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable
    /// overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("server.bind", "0.0.0.0:6021")?
            .set_default("server.workers", 0)?
            .set_default("cluster.server_name", cluster::default_server_name())?
            .set_default("limits.max_message_size", DEFAULT_MAX_MESSAGE_SIZE as i64)?
            .set_default("limits.max_connections", DEFAULT_MAX_CONNECTIONS as i64)?
            .set_default("metrics.enabled", false)?
            .set_default("metrics.bind", DEFAULT_METRICS_BIND)?;

        // Load from file with env var substitution.
        let path = path.as_ref();
        if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| {
                ConfigError::caused_by(format!("failed to read {}", path.display()), e)
            })?;
            let substituted = expand_env_refs(&content);
            builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
        }

        // Override with environment variables (RTLITE__SERVER__BIND, etc.).
        let cfg = builder
            .add_source(
                Environment::with_prefix("RTLITE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables only (no file).
    #[allow(dead_code)]
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a TOML string (for testing).
    #[allow(dead_code)]
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let substituted = expand_env_refs(content);
        let config: Config = toml::from_str(&substituted)
            .map_err(|e| ConfigError::caused_by("TOML parse error", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.limits.validate().map_err(ConfigError::invalid)?;
        self.cluster.validate().map_err(ConfigError::invalid)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
[log]
level = "debug"

[server]
bind = "127.0.0.1:6022"
workers = 4

[cluster]
server_name = "node-7"

[limits]
max_message_size = 2097152
max_connections = 512
"#;
        let config = Config::parse(toml).unwrap();
        assert_eq!(config.log.level, LogLevel::Debug);
        assert_eq!(config.server.bind.port(), 6022);
        assert_eq!(config.server.workers, 4);
        assert_eq!(config.cluster.server_name, "node-7");
        assert_eq!(config.limits.max_message_size, 2097152);
        assert_eq!(config.limits.max_connections, 512);
    }

    #[test]
    fn test_parse_partial_toml() {
        // Only override some values, rest should use defaults.
        let toml = r#"
[limits]
max_message_size = 512000
"#;
        let config = Config::parse(toml).unwrap();
        assert_eq!(config.limits.max_message_size, 512000);
        assert_eq!(config.limits.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.server.bind.port(), 6021);
        assert_eq!(config.log.level, LogLevel::Info);
    }

    #[test]
    fn test_empty_server_name_is_rejected() {
        let toml = r#"
[cluster]
server_name = ""
"#;
        assert!(Config::parse(toml).is_err());
    }

    #[test]
    fn test_tiny_message_limit_is_rejected() {
        let toml = r#"
[limits]
max_message_size = 16
"#;
        assert!(Config::parse(toml).is_err());
    }

    #[test]
    fn test_env_refs_expand_from_environment() {
        std::env::set_var("RTLITE_TEST_PORT", "6025");
        let expanded = expand_env_refs(r#"bind = "0.0.0.0:${RTLITE_TEST_PORT}""#);
        assert_eq!(expanded, r#"bind = "0.0.0.0:6025""#);
        std::env::remove_var("RTLITE_TEST_PORT");
    }

    #[test]
    fn test_env_refs_fall_back_when_unset() {
        std::env::remove_var("RTLITE_NONEXISTENT_VAR");
        let expanded = expand_env_refs("${RTLITE_NONEXISTENT_VAR:-0.0.0.0:6021}");
        assert_eq!(expanded, "0.0.0.0:6021");
        // No fallback: expands to nothing.
        assert_eq!(expand_env_refs("x${RTLITE_NONEXISTENT_VAR}y"), "xy");
    }

    #[test]
    fn test_env_refs_leave_plain_text_alone() {
        assert_eq!(expand_env_refs("no references here"), "no references here");
        // A lone dollar or malformed reference passes through.
        assert_eq!(expand_env_refs("cost = $5, ${"), "cost = $5, ${");
    }

    #[test]
    fn test_parse_metrics_config() {
        let toml = r#"
[metrics]
enabled = true
bind = "0.0.0.0:9500"
"#;
        let config = Config::parse(toml).unwrap();
        assert!(config.metrics.enabled);
        assert_eq!(config.metrics.bind.port(), 9500);
    }

    #[test]
    fn test_error_display_includes_cause() {
        let err = Config::parse("limits = 3").unwrap_err();
        let text = err.to_string();
        assert!(text.starts_with("TOML parse error: "));
    }
}
