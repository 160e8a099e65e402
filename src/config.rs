//! Configuration module for Axon.
//!
//! Loads configuration from TOML files with environment variable
//! substitution.
//!
//! # Example
//!
//! ```toml
//! [redis]
//! url = "${REDIS_URL}"
//!
//! [worker]
//! concurrency = 8
//! acknowledgement_timeout_ms = 60000
//!
//! [apis."auth"]
//! rpc_timeout_ms = 5000
//! validate = "both"
//! ```

use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::schema::ValidationScope;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Which backend serves a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Redis,
    Memory,
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct BusConfig {
    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub bus: TransportSelection,

    #[serde(default)]
    pub worker: WorkerConfig,

    /// Per-API options, keyed by API name.
    #[serde(default)]
    pub apis: HashMap<String, ApiConfig>,
}

/// Redis configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

/// Which backend serves each of the four transports.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TransportSelection {
    #[serde(default)]
    pub rpc_transport: TransportKind,

    #[serde(default)]
    pub result_transport: TransportKind,

    #[serde(default)]
    pub event_transport: TransportKind,

    #[serde(default)]
    pub schema_transport: TransportKind,
}

impl TransportSelection {
    /// The single backend kind, if all four transports agree on one.
    pub fn uniform(&self) -> Option<TransportKind> {
        let kinds = [
            self.rpc_transport,
            self.result_transport,
            self.event_transport,
            self.schema_transport,
        ];
        kinds[1..].iter().all(|k| *k == kinds[0]).then_some(kinds[0])
    }
}

/// Worker / dispatcher configuration
#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    /// Unique name for this replica. Defaults to hostname or a UUID.
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_acknowledgement_timeout_ms")]
    pub acknowledgement_timeout_ms: u64,

    /// Defaults to a third of the acknowledgement timeout.
    #[serde(default)]
    pub reclaim_interval_ms: Option<u64>,

    #[serde(default = "default_max_redeliveries")]
    pub max_redeliveries: u32,

    #[serde(default = "default_graceful_shutdown_timeout_ms")]
    pub graceful_shutdown_timeout_ms: u64,

    #[serde(default = "default_schema_ttl_ms")]
    pub schema_ttl_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: None,
            concurrency: default_concurrency(),
            acknowledgement_timeout_ms: default_acknowledgement_timeout_ms(),
            reclaim_interval_ms: None,
            max_redeliveries: default_max_redeliveries(),
            graceful_shutdown_timeout_ms: default_graceful_shutdown_timeout_ms(),
            schema_ttl_ms: default_schema_ttl_ms(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}

fn default_acknowledgement_timeout_ms() -> u64 {
    60_000
}

fn default_max_redeliveries() -> u32 {
    3
}

fn default_graceful_shutdown_timeout_ms() -> u64 {
    30_000
}

fn default_schema_ttl_ms() -> u64 {
    60_000
}

impl WorkerConfig {
    pub fn acknowledgement_timeout(&self) -> Duration {
        Duration::from_millis(self.acknowledgement_timeout_ms)
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_millis(
            self.reclaim_interval_ms
                .unwrap_or(self.acknowledgement_timeout_ms / 3),
        )
    }

    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_shutdown_timeout_ms)
    }

    pub fn schema_ttl(&self) -> Duration {
        Duration::from_millis(self.schema_ttl_ms)
    }
}

/// Per-API options
#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,

    #[serde(default = "default_event_fire_timeout_ms")]
    pub event_fire_timeout_ms: u64,

    #[serde(default)]
    pub validate: ValidationScope,

    #[serde(default)]
    pub cast_values: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            rpc_timeout_ms: default_rpc_timeout_ms(),
            event_fire_timeout_ms: default_event_fire_timeout_ms(),
            validate: ValidationScope::default(),
            cast_values: false,
        }
    }
}

fn default_rpc_timeout_ms() -> u64 {
    5_000
}

fn default_event_fire_timeout_ms() -> u64 {
    5_000
}

impl ApiConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn event_fire_timeout(&self) -> Duration {
        Duration::from_millis(self.event_fire_timeout_ms)
    }
}

impl BusConfig {
    /// Options for one API, falling back to the built-in defaults for APIs
    /// with no `[apis."name"]` section.
    pub fn api(&self, api_name: &str) -> ApiConfig {
        self.apis.get(api_name).cloned().unwrap_or_default()
    }

    /// Load configuration from the default path or the `AXON_CONFIG`
    /// environment variable.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = env::var("AXON_CONFIG").unwrap_or_else(|_| "config/axon.toml".to_string());
        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            info!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            return Ok(Self::default());
        }

        info!(path = %path.display(), "Loading configuration");

        let content = fs::read_to_string(path)?;
        let content = substitute_env_vars(&content);

        debug!("Parsing TOML configuration");
        let config: BusConfig = toml::from_str(&content)?;

        config.validate()?;

        info!(
            apis = config.apis.len(),
            concurrency = config.worker.concurrency,
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "worker.concurrency must be at least 1".to_string(),
            ));
        }
        if self.worker.acknowledgement_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "worker.acknowledgement_timeout_ms must be non-zero".to_string(),
            ));
        }
        if self.worker.schema_ttl_ms == 0 {
            return Err(ConfigError::ValidationError(
                "worker.schema_ttl_ms must be non-zero".to_string(),
            ));
        }

        let needs_redis = [
            self.bus.rpc_transport,
            self.bus.result_transport,
            self.bus.event_transport,
            self.bus.schema_transport,
        ]
        .contains(&TransportKind::Redis);
        if needs_redis {
            if self.redis.url.is_empty() {
                return Err(ConfigError::ValidationError(
                    "redis.url must be set when a redis transport is selected".to_string(),
                ));
            }
            if self.redis.url.contains("${") {
                return Err(ConfigError::ValidationError(format!(
                    "redis.url contains an unsubstituted environment variable: {}",
                    self.redis.url
                )));
            }
        }

        for (name, api) in &self.apis {
            if api.rpc_timeout_ms == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "apis.\"{name}\".rpc_timeout_ms must be non-zero"
                )));
            }
            if api.event_fire_timeout_ms == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "apis.\"{name}\".event_fire_timeout_ms must be non-zero"
                )));
            }
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();

    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                debug!(var = %var_name, "Environment variable not set, keeping placeholder");
                caps[0].to_string()
            }
        }
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("AXON_TEST_VAR", "substituted_value");
        let input = "url = \"${AXON_TEST_VAR}\"";
        let output = substitute_env_vars(input);
        assert_eq!(output, "url = \"substituted_value\"");
        env::remove_var("AXON_TEST_VAR");
    }

    #[test]
    fn test_env_var_not_set() {
        let input = "url = \"${AXON_NONEXISTENT_VAR}\"";
        let output = substitute_env_vars(input);
        assert_eq!(output, "url = \"${AXON_NONEXISTENT_VAR}\"");
    }

    #[test]
    fn test_default_config() {
        let config = BusConfig::default();
        assert_eq!(config.redis.url, "redis://localhost:6379");
        assert_eq!(config.worker.concurrency, 4);
        assert_eq!(config.worker.max_redeliveries, 3);
        assert_eq!(
            config.worker.reclaim_interval(),
            Duration::from_millis(20_000)
        );
        assert_eq!(config.bus.uniform(), Some(TransportKind::Redis));
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [redis]
            url = "redis://cache:6379"

            [bus]
            event_transport = "memory"

            [worker]
            concurrency = 8
            acknowledgement_timeout_ms = 30000
            reclaim_interval_ms = 5000

            [apis."auth"]
            rpc_timeout_ms = 2000
            validate = "outgoing"
            cast_values = true
        "#;

        let config: BusConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.redis.url, "redis://cache:6379");
        assert_eq!(config.bus.event_transport, TransportKind::Memory);
        assert_eq!(config.bus.rpc_transport, TransportKind::Redis);
        assert_eq!(config.bus.uniform(), None);
        assert_eq!(config.worker.concurrency, 8);
        assert_eq!(config.worker.reclaim_interval(), Duration::from_millis(5000));

        let auth = config.api("auth");
        assert_eq!(auth.rpc_timeout(), Duration::from_millis(2000));
        assert_eq!(auth.validate, ValidationScope::Outgoing);
        assert!(auth.cast_values);

        // Unconfigured APIs fall back to defaults.
        let other = config.api("billing");
        assert_eq!(other.rpc_timeout(), Duration::from_millis(5000));
        assert_eq!(other.validate, ValidationScope::Both);
    }

    #[test]
    fn test_validation_zero_concurrency() {
        let toml = r#"
            [worker]
            concurrency = 0
        "#;
        let config: BusConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_zero_api_timeout() {
        let toml = r#"
            [apis."auth"]
            rpc_timeout_ms = 0
        "#;
        let config: BusConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_unsubstituted_redis_url() {
        let toml = r#"
            [redis]
            url = "${AXON_MISSING_REDIS_URL}"
        "#;
        let config: BusConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_transport_kind_rejected() {
        let toml = r#"
            [bus]
            rpc_transport = "carrier-pigeon"
        "#;
        assert!(toml::from_str::<BusConfig>(toml).is_err());
    }
}
