// packages/pool/src/pool/reaper.rs
//! Idle reaper
//!
//! A background task that periodically evicts instances which have been empty
//! for longer than the idle timeout, walking from the newest instance so the
//! oldest ones survive. The pool never shrinks below `min_instances`, and an
//! instance with an active session is never touched.
//!
//! The task holds only a weak reference to the pool and stops on its own when
//! the pool is dropped.

use crate::driver::EngineDriver;
use crate::pool::instance::WorkerInstance;
use crate::pool::manager::PoolInner;
use serde::Serialize;
use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Result of one reaping pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    /// Instances removed from the pool, newest first
    pub evicted: Vec<u64>,

    /// Evicted instances whose close reported an error
    pub failures: usize,
}

/// Pick idle instances to evict, newest first, keeping `min_instances`
pub(crate) fn select_idle<D: EngineDriver>(
    instances: &[WorkerInstance<D>],
    now: Instant,
    idle_timeout: Duration,
    min_instances: usize,
) -> Vec<u64> {
    let budget = instances.len().saturating_sub(min_instances);

    instances
        .iter()
        .rev()
        .filter(|instance| instance.is_idle(now, idle_timeout))
        .take(budget)
        .map(|instance| instance.id)
        .collect()
}

/// Handle to the running reaper task
pub(crate) struct IdleReaper {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl IdleReaper {
    pub(crate) fn spawn<D: EngineDriver>(pool: Weak<PoolInner<D>>, period: Duration) -> Self {
        let token = CancellationToken::new();
        let handle = tokio::spawn(run(pool, token.clone(), period));
        Self { token, handle }
    }

    /// Cancel and wait for the task to exit
    pub(crate) async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            warn!("Idle reaper terminated abnormally: {}", e);
        }
    }
}

async fn run<D: EngineDriver>(pool: Weak<PoolInner<D>>, token: CancellationToken, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!("Idle reaper started (interval: {:?})", period);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(inner) = pool.upgrade() else {
            break;
        };

        // close() holds the topology lock while it stops us
        let topology = tokio::select! {
            _ = token.cancelled() => break,
            guard = inner.topology.lock() => guard,
        };

        let report = inner.reap_idle_locked(&topology).await;
        if report.failures > 0 {
            warn!(
                "Idle reaper: {} of {} evicted instances failed to close cleanly",
                report.failures,
                report.evicted.len()
            );
        }
    }

    debug!("Idle reaper stopped");
}
