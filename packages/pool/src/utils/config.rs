// packages/pool/src/utils/config.rs
//! Configuration loading
//!
//! Sources are layered, later ones overriding earlier ones:
//!
//! 1. Built-in defaults
//! 2. `engine-pool.{toml,yaml,json}` in the working directory (optional),
//!    or an explicit file passed to [`AppConfig::load_from`]
//! 3. `ENGINE_POOL__*` environment variables, `__` separating nested keys
//!    (e.g. `ENGINE_POOL__POOL__MAX_INSTANCES=4`)

use crate::utils::errors::{PoolError, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "ENGINE_POOL";

/// Default config file stem looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "engine-pool";

/// Pool sizing and scaling configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum concurrent sessions hosted by one instance (default: 5)
    pub per_instance_capacity: usize,

    /// Upper bound on the number of instances (default: 3)
    pub max_instances: usize,

    /// Instances created at initialization and never reaped (default: 1)
    pub min_instances: usize,

    /// Create instances on demand when all are saturated (default: true)
    pub autoscale: bool,

    /// Idle age after which an empty instance may be reaped (default: 300)
    pub idle_timeout_secs: u64,

    /// Reaper tick period (default: 30)
    pub reaper_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            per_instance_capacity: 5,
            max_instances: 3,
            min_instances: 1,
            autoscale: true,
            idle_timeout_secs: 300,
            reaper_interval_secs: 30,
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    /// Total session slots when the pool is at `instances` instances
    pub fn capacity_for(&self, instances: usize) -> usize {
        instances * self.per_instance_capacity
    }

    /// Validate sizing parameters
    pub fn validate(&self) -> Result<()> {
        if self.per_instance_capacity == 0 {
            return Err(PoolError::config("per_instance_capacity must be at least 1"));
        }
        if self.max_instances == 0 {
            return Err(PoolError::config("max_instances must be at least 1"));
        }
        if self.min_instances > self.max_instances {
            return Err(PoolError::config(format!(
                "min_instances ({}) must not exceed max_instances ({})",
                self.min_instances, self.max_instances
            )));
        }
        if self.reaper_interval_secs == 0 {
            return Err(PoolError::config("reaper_interval_secs must be at least 1"));
        }
        Ok(())
    }
}

/// Which engine driver the host binary builds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    InMemory,
    Process,
}

/// Driver selection and process launch settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub kind: DriverKind,

    /// Executable launched per instance (process driver only)
    pub executable: String,

    /// Extra arguments appended after the headless flags
    pub args: Vec<String>,

    pub headless: bool,

    /// Grace period between SIGTERM and SIGKILL
    pub stop_grace_secs: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            kind: DriverKind::InMemory,
            executable: "chromium".to_string(),
            args: vec![],
            headless: true,
            stop_grace_secs: 2,
        }
    }
}

/// Logging output settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,

    /// Install the Prometheus recorder
    pub metrics: bool,

    /// How often the host binary logs a stats snapshot
    pub stats_interval_secs: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            metrics: true,
            stats_interval_secs: 60,
        }
    }
}

/// Top-level application configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub pool: PoolConfig,
    pub driver: DriverConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load from the default file (if present) and the environment
    pub fn load() -> Result<Self> {
        Self::build(File::with_name(DEFAULT_CONFIG_FILE).required(false))
    }

    /// Load from an explicit file and the environment
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        Self::build(File::from(path.as_ref()).required(true))
    }

    fn build<S>(file: S) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let config: AppConfig = Config::builder()
            .add_source(Config::try_from(&AppConfig::default())?)
            .add_source(file)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("driver.args")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.pool.validate()?;
        Ok(config)
    }
}
