//! Application configuration.
//!
//! Plain serde structs with defaults, loadable from YAML files or
//! environment variables.

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "weft.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "WEFT_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "WEFT";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "WEFT_LOG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Transport configuration.
    pub transport: TransportConfig,
    /// Node configuration.
    pub node: NodeConfig,
    /// Redelivery configuration.
    pub redelivery: RedeliveryConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `weft.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `WEFT_CONFIG` environment variable (if set)
    /// 4. Environment variables with `WEFT` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}

/// Transport configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Maximum envelopes held per queue before publishes are rejected.
    pub queue_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
        }
    }
}

/// Node configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Worker pool size per subscription.
    pub workers: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self { workers: 4 }
    }
}

/// Redelivery configuration for faulted pipeline runs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedeliveryConfig {
    /// Maximum redelivery attempts after the first run.
    pub max_attempts: usize,
    /// Minimum backoff delay in milliseconds.
    pub min_delay_ms: u64,
    /// Maximum backoff delay in milliseconds.
    pub max_delay_ms: u64,
    /// Whether to add jitter to backoff delays.
    pub jitter: bool,
}

impl Default for RedeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_delay_ms: 10,
            max_delay_ms: 2_000,
            jitter: true,
        }
    }
}
