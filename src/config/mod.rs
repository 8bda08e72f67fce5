//! Application configuration.
//!
//! Aggregates store, bus, consumer and maintenance settings into a single
//! Config struct that can be loaded from YAML files or environment variables.

mod bus;
mod maintenance;
mod store;

pub use bus::{BusConfig, ConsumerDefaults};
pub use maintenance::MaintenanceConfig;
pub use store::{
    MemoryStoreConfig, PostgresStoreConfig, RedisStoreConfig, SqliteStoreConfig, StoreConfig,
    StoreType,
};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "eventline.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "EVENTLINE_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "EVENTLINE";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "EVENTLINE_LOG";
/// Environment variable selecting the log format (`json` or text).
pub const LOG_FORMAT_ENV_VAR: &str = "EVENTLINE_LOG_FORMAT";

use serde::Deserialize;

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Event store backend.
    pub store: StoreConfig,
    /// Event bus behavior.
    pub bus: BusConfig,
    /// Defaults for durable subscriptions.
    pub consumer: ConsumerDefaults,
    /// Retention loop settings.
    pub maintenance: MaintenanceConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `eventline.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix, `__` separated
    ///    (`EVENTLINE__STORE__TYPE=redis`)
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
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// In-memory store, everything else default.
    pub fn for_test() -> Self {
        Self::default()
    }
}
