// packages/pool/src/observability/mod.rs
//! Logging and metrics setup
//!
//! Structured logs go through `tracing`; `RUST_LOG` overrides the configured
//! level. Metrics are recorded with the `metrics` facade and exported in
//! Prometheus text format.

use crate::utils::config::LoggingConfig;
use anyhow::{anyhow, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::EnvFilter;

/// Metric names
pub mod names {
    pub const SESSIONS_STARTED: &str = "engine_pool_sessions_started_total";
    pub const SESSIONS_COMPLETED: &str = "engine_pool_sessions_completed_total";
    pub const INSTANCES_CREATED: &str = "engine_pool_instances_created_total";
    pub const INSTANCES_CLOSED: &str = "engine_pool_instances_closed_total";
    pub const INSTANCES: &str = "engine_pool_instances";
    pub const ACTIVE_SESSIONS: &str = "engine_pool_active_sessions";
}

/// Install the global tracing subscriber
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| anyhow!("invalid log filter '{}': {}", config.level, e))?;

    let result = if config.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_target(true)
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };

    result.map_err(|e| anyhow!("failed to install tracing subscriber: {}", e))
}

/// Install the Prometheus recorder and return a handle for rendering
pub fn init_metrics() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow!("failed to install metrics recorder: {}", e))
}
