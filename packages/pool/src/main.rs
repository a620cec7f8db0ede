// packages/pool/src/main.rs
//! Engine Pool host
//!
//! Loads configuration, brings the pool up to its minimum size and keeps it
//! running (with the idle reaper) until interrupted, logging a stats snapshot
//! at a fixed interval.

use anyhow::Result;
use engine_pool::driver::{EngineDriver, InMemoryDriver, LaunchOptions, ProcessDriver};
use engine_pool::observability::{init_metrics, init_tracing};
use engine_pool::utils::config::{AppConfig, DriverKind};
use engine_pool::{PoolManager, ProcessDriverConfig};
use metrics_exporter_prometheus::PrometheusHandle;
use std::time::Duration;
use tracing::{debug, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Config path may be given as the only argument
    let config = match std::env::args().nth(1) {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };

    init_tracing(&config.logging)?;
    let metrics = if config.logging.metrics {
        Some(init_metrics()?)
    } else {
        None
    };

    info!("Starting Engine Pool v{}", engine_pool::VERSION);
    info!("Configuration loaded: {:?}", config);

    let launch_options = LaunchOptions {
        headless: config.driver.headless,
        args: vec![],
    };

    match config.driver.kind {
        DriverKind::InMemory => run(&config, InMemoryDriver::new(), launch_options, metrics).await,
        DriverKind::Process => {
            let driver = ProcessDriver::new(ProcessDriverConfig::from(&config.driver));
            run(&config, driver, launch_options, metrics).await
        }
    }
}

async fn run<D: EngineDriver>(
    config: &AppConfig,
    driver: D,
    launch_options: LaunchOptions,
    metrics: Option<PrometheusHandle>,
) -> Result<()> {
    let pool = PoolManager::with_options(
        config.pool.clone(),
        driver,
        launch_options,
        Default::default(),
    )?;
    pool.initialize().await?;
    info!("Health: {}", serde_json::to_string(&pool.health())?);

    let period = Duration::from_secs(config.logging.stats_interval_secs.max(1));
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result?;
                info!("Received shutdown signal, cleaning up...");
                break;
            }
            _ = ticker.tick() => {
                info!("Pool stats: {}", serde_json::to_string(&pool.get_stats())?);
                if let Some(handle) = &metrics {
                    debug!("Metrics:\n{}", handle.render());
                }
            }
        }
    }

    pool.close().await;
    info!("Engine pool stopped");
    Ok(())
}
