//! Configuration management for Turnstile.
//!
//! Configuration is layered: built-in defaults, then an optional YAML file,
//! then `TURNSTILE__`-prefixed environment variables (for example
//! `TURNSTILE__STORAGE__BACKEND=remote`).

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{EngineConfig, KeyBuilder, Rule, RuleSet, DEFAULT_NAMESPACE};
use crate::ratelimit::rules::{ClientRule, ResourceRule};

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "TURNSTILE";
/// Separator between nested keys in environment variable names.
pub const ENV_SEPARATOR: &str = "__";

/// Main configuration for Turnstile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Counter store configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
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

/// Which counter store to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// In-process memory; counters are not shared between processes
    #[default]
    Local,
    /// Shared Redis instance
    Remote,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Store implementation
    #[serde(default)]
    pub backend: StorageBackend,

    /// Redis URL, required for the remote backend
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Namespace tag prepended to every counter key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// How often the local store purges expired counters
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Keys requested per SCAN step when resetting by pattern
    #[serde(default = "default_scan_batch_size")]
    pub scan_batch_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            redis_url: None,
            key_prefix: default_key_prefix(),
            sweep_interval_secs: default_sweep_interval(),
            scan_batch_size: default_scan_batch_size(),
        }
    }
}

fn default_key_prefix() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_scan_batch_size() -> usize {
    crate::store::DEFAULT_SCAN_BATCH
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Global switch; `false` admits everything without counting
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Rule used when no client or resource rule matches
    #[serde(default)]
    pub default_rule: Rule,

    /// Per-client rules, matched on the exact identity
    #[serde(default)]
    pub client_rules: Vec<ClientRule>,

    /// Per-resource rules, first match in declaration order wins
    #[serde(default)]
    pub resource_rules: Vec<ResourceRule>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            default_rule: Rule::default(),
            client_rules: Vec::new(),
            resource_rules: Vec::new(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

impl RateLimitingConfig {
    /// The rules as a resolvable set.
    pub fn rule_set(&self) -> RuleSet {
        RuleSet {
            default_rule: self.default_rule,
            client_rules: self.client_rules.clone(),
            resource_rules: self.resource_rules.clone(),
        }
    }

    /// The engine configuration snapshot described by this section.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::new(self.rule_set()).with_enabled(self.enabled)
    }
}

impl TurnstileConfig {
    /// Load layered configuration: defaults, optional file, environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(::config::File::from(path).format(::config::FileFormat::Yaml));
        }

        let config: TurnstileConfig = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file, without environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints and every configured rule.
    pub fn validate(&self) -> Result<()> {
        if self.storage.backend == StorageBackend::Remote && self.storage.redis_url.is_none() {
            return Err(TurnstileError::Config(
                "storage.redis_url is required for the remote backend".to_string(),
            ));
        }
        if self.storage.sweep_interval_secs == 0 {
            return Err(TurnstileError::Config(
                "storage.sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        self.rate_limiting.rule_set().validate()
    }

    /// Key builder for the configured namespace.
    pub fn key_builder(&self) -> KeyBuilder {
        KeyBuilder::new(&self.storage.key_prefix)
    }
}
