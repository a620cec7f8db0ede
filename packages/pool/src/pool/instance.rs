// packages/pool/src/pool/instance.rs
//! Worker instance: one engine, its shared context and an admission semaphore
//!
//! Counters on an instance are plain fields. They are only read or written
//! while the pool's bookkeeping lock is held, which keeps the per-instance
//! counts and the global counters consistent with each other.

use crate::driver::{
    ContextOf, ContextOptions, Engine, EngineContext, EngineDriver, EngineOf, LaunchOptions,
};
use crate::pool::stats::InstanceInfo;
use crate::utils::errors::{PoolError, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

/// A pooled engine instance hosting up to `capacity_limit` sessions
pub(crate) struct WorkerInstance<D: EngineDriver> {
    pub(crate) id: u64,
    pub(crate) capacity_limit: usize,
    pub(crate) active_sessions: usize,

    /// Sessions served over the instance lifetime (or since the last reset)
    pub(crate) total_served: u64,

    pub(crate) created_at: Instant,
    pub(crate) created_wall: DateTime<Utc>,
    pub(crate) last_used_at: Instant,

    engine: EngineOf<D>,
    pub(crate) context: Arc<ContextOf<D>>,

    /// One permit per session slot
    pub(crate) semaphore: Arc<Semaphore>,
}

impl<D: EngineDriver> WorkerInstance<D> {
    /// Launch an engine and open its shared context
    ///
    /// If the context cannot be opened the engine is closed again, so a failed
    /// launch never leaves a running engine behind.
    pub(crate) async fn launch(
        id: u64,
        driver: &D,
        capacity_limit: usize,
        launch_options: &LaunchOptions,
        context_options: &ContextOptions,
    ) -> Result<Self> {
        debug!("Launching engine for instance #{}", id);

        let engine = driver
            .launch(launch_options)
            .await
            .map_err(|source| PoolError::ResourceInit {
                instance_id: id,
                source,
            })?;

        let context = match engine.new_persistent_context(context_options).await {
            Ok(context) => context,
            Err(source) => {
                if let Err(e) = engine.close().await {
                    warn!("Failed to close engine of instance #{} after context error: {}", id, e);
                }
                return Err(PoolError::ResourceInit {
                    instance_id: id,
                    source,
                });
            }
        };

        let now = Instant::now();
        Ok(Self {
            id,
            capacity_limit,
            active_sessions: 0,
            total_served: 0,
            created_at: now,
            created_wall: Utc::now(),
            last_used_at: now,
            engine,
            context: Arc::new(context),
            semaphore: Arc::new(Semaphore::new(capacity_limit)),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Take a free slot without waiting
    pub(crate) fn try_admit(&mut self) -> Option<OwnedSemaphorePermit> {
        let permit = Arc::clone(&self.semaphore).try_acquire_owned().ok()?;
        self.admit();
        Some(permit)
    }

    /// Count a session whose permit was obtained by waiting
    pub(crate) fn admit(&mut self) {
        self.active_sessions += 1;
        debug_assert!(self.active_sessions <= self.capacity_limit);
    }

    /// Return a slot after a session ends
    pub(crate) fn release(&mut self) {
        debug_assert!(self.active_sessions > 0);
        self.active_sessions = self.active_sessions.saturating_sub(1);
        self.total_served += 1;
        self.last_used_at = Instant::now();
    }

    /// Empty and unused for longer than `idle_timeout`
    pub(crate) fn is_idle(&self, now: Instant, idle_timeout: Duration) -> bool {
        self.active_sessions == 0 && now.saturating_duration_since(self.last_used_at) > idle_timeout
    }

    /// Stop admitting sessions. Waiters on the semaphore are woken with an
    /// error and restart admission elsewhere.
    pub(crate) fn retire(&self) {
        self.semaphore.close();
    }

    /// Close the shared context and the engine
    ///
    /// Both are attempted even if the first fails; the engine error wins.
    pub(crate) async fn shutdown(self) -> Result<()> {
        debug!(
            "Closing instance #{} ({} active sessions)",
            self.id, self.active_sessions
        );
        self.retire();

        if let Err(e) = self.context.close().await {
            warn!("Failed to close context of instance #{}: {}", self.id, e);
        }

        self.engine
            .close()
            .await
            .map_err(|source| PoolError::Cleanup {
                instance_id: self.id,
                source,
            })
    }

    pub(crate) fn info(&self, now: Instant) -> InstanceInfo {
        InstanceInfo {
            id: self.id,
            active_sessions: self.active_sessions,
            capacity_limit: self.capacity_limit,
            available_slots: self.semaphore.available_permits(),
            total_served: self.total_served,
            uptime_secs: now.saturating_duration_since(self.created_at).as_secs(),
            idle_secs: now.saturating_duration_since(self.last_used_at).as_secs(),
            created_at: self.created_wall,
        }
    }
}
