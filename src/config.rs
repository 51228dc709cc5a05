//! Configuration management for Ratewarden.

use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, WardenError};
use crate::ratelimit::FailurePolicy;
use crate::store::RemoteStoreConfig;

/// Prefix for environment variable overrides, e.g.
/// `RATEWARDEN__LIMITER__FAILURE_POLICY=fail_open`.
pub const ENV_PREFIX: &str = "RATEWARDEN";

/// Main configuration for Ratewarden.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Limiter behaviour shared by every rule
    #[serde(default)]
    pub limiter: LimiterSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Shared store settings
    #[serde(default)]
    pub remote_store: RemoteStoreConfig,

    /// Path to the rate limit rules file
    #[serde(default)]
    pub rules_path: Option<String>,
}

/// Limiter settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// What to answer when the store is unreachable
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Idle eviction interval in seconds (0 disables the sweeper)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Where limiter state lives
    #[serde(default)]
    pub store: StoreKind,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::default(),
            sweep_interval_secs: default_sweep_interval(),
            store: StoreKind::default(),
        }
    }
}

/// Store selection for rule limiters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// State stays in this process
    #[default]
    Local,
    /// State lives in a key/value backend configured by `remote_store`
    Shared,
}

fn default_sweep_interval() -> u64 {
    60
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl WardenConfig {
    /// Load configuration from an optional YAML file, then apply
    /// `RATEWARDEN__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml));
        }
        let config: WardenConfig = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string, without environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: WardenConfig = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.remote_store.max_attempts == 0 {
            return Err(WardenError::Config(
                "remote_store.max_attempts must be greater than 0".to_string(),
            ));
        }
        if self.remote_store.namespace.is_empty() {
            return Err(WardenError::Config(
                "remote_store.namespace must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WardenConfig::default();
        assert_eq!(config.limiter.failure_policy, FailurePolicy::FailClosed);
        assert_eq!(config.limiter.sweep_interval_secs, 60);
        assert_eq!(config.limiter.store, StoreKind::Local);
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
        assert_eq!(config.remote_store.namespace, "ratewarden");
        assert!(config.rules_path.is_none());
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
limiter:
  failure_policy: fail_open
  sweep_interval_secs: 5
  store: shared
logging:
  json: true
remote_store:
  namespace: edge
  entry_ttl_secs: 3600
rules_path: /etc/ratewarden/rules.yaml
"#;
        let config = WardenConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.limiter.failure_policy, FailurePolicy::FailOpen);
        assert_eq!(config.limiter.sweep_interval_secs, 5);
        assert_eq!(config.limiter.store, StoreKind::Shared);
        assert!(config.logging.json);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.remote_store.namespace, "edge");
        assert_eq!(config.remote_store.entry_ttl_secs, Some(3600));
        assert_eq!(config.remote_store.max_attempts, 16);
        assert_eq!(
            config.rules_path.as_deref(),
            Some("/etc/ratewarden/rules.yaml")
        );
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = WardenConfig::from_yaml("").unwrap();
        assert_eq!(config, WardenConfig::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let yaml = r#"
remote_store:
  max_attempts: 0
"#;
        assert!(matches!(
            WardenConfig::from_yaml(yaml),
            Err(WardenError::Config(_))
        ));

        let yaml = r#"
limiter:
  failure_policy: sometimes
"#;
        assert!(WardenConfig::from_yaml(yaml).is_err());

        let yaml = r#"
limiter:
  store: redis
"#;
        assert!(WardenConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_load_without_file() {
        let config = WardenConfig::load(None).unwrap();
        assert!(config.validate().is_ok());
    }
}
