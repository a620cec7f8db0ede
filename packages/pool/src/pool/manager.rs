// packages/pool/src/pool/manager.rs
//! Pool manager
//!
//! Owns the instance list and exposes the public operations: initialize,
//! acquire, stats, manual scale, reset and close.
//!
//! # Locking
//!
//! ```text
//! topology  (tokio Mutex)      initialize, autoscale, reaper pass, scale_to, close
//!    │                         held across engine launches and closes
//!    ▼
//! state     (parking_lot)      instance list, per-instance counts, counters
//!                              never held across an await
//! ```
//!
//! When both are needed they are taken in that order. Admission and release
//! only touch `state`, so sessions keep flowing while an engine starts or
//! stops. Instances are removed from the list before they are closed; a
//! removed instance is never handed out again.

use crate::driver::{ContextOptions, EngineDriver, LaunchOptions, SessionOf};
use crate::pool::admission::SessionLease;
use crate::pool::identity::SessionHint;
use crate::pool::instance::WorkerInstance;
use crate::pool::reaper::{select_idle, IdleReaper, ReapReport};
use crate::pool::stats::{publish_gauges, HealthReport, PoolCounters, PoolStats};
use crate::utils::config::PoolConfig;
use crate::utils::errors::{PoolError, Result};
use futures::future::join_all;
use serde::Serialize;
use std::cmp::Ordering;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

type TopologyGuard<'a> = tokio::sync::MutexGuard<'a, ()>;

/// Mutable pool bookkeeping, guarded by `PoolInner::state`
pub(crate) struct PoolState<D: EngineDriver> {
    /// Live instances in creation order
    pub(crate) instances: Vec<WorkerInstance<D>>,
    pub(crate) counters: PoolCounters,
    pub(crate) initialized: bool,

    /// Bumped by every `close()`; admissions started earlier must not revive the pool
    pub(crate) close_epoch: u64,

    next_instance_id: u64,
    reaper: Option<IdleReaper>,
}

impl<D: EngineDriver> PoolState<D> {
    fn new() -> Self {
        Self {
            instances: Vec::new(),
            counters: PoolCounters::default(),
            initialized: false,
            close_epoch: 0,
            next_instance_id: 0,
            reaper: None,
        }
    }

    pub(crate) fn active_sessions(&self) -> usize {
        self.instances.iter().map(|i| i.active_sessions).sum()
    }

    pub(crate) fn instance_mut(&mut self, id: u64) -> Option<&mut WorkerInstance<D>> {
        self.instances.iter_mut().find(|i| i.id == id)
    }

    fn allocate_id(&mut self) -> u64 {
        self.next_instance_id += 1;
        self.next_instance_id
    }

    /// Detach instances from the pool and stop them admitting
    fn remove(&mut self, ids: &[u64]) -> Vec<WorkerInstance<D>> {
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.instances)
            .into_iter()
            .partition(|i| ids.contains(&i.id));
        self.instances = kept;

        for instance in &removed {
            instance.retire();
        }
        publish_gauges(self.instances.len(), self.active_sessions());
        removed
    }
}

/// Shared pool core, referenced by the manager handles, leases and the reaper
pub(crate) struct PoolInner<D: EngineDriver> {
    pub(crate) config: PoolConfig,
    driver: D,
    launch_options: LaunchOptions,
    context_options: ContextOptions,
    pub(crate) topology: tokio::sync::Mutex<()>,
    pub(crate) state: parking_lot::Mutex<PoolState<D>>,
}

impl<D: EngineDriver> PoolInner<D> {
    fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    pub(crate) fn close_epoch(&self) -> u64 {
        self.state.lock().close_epoch
    }

    /// Initialize unless a `close()` has run since `epoch` was observed
    pub(crate) async fn ensure_initialized(self: &Arc<Self>, epoch: u64) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }
        let topology = self.topology.lock().await;
        if self.close_epoch() != epoch {
            return Err(PoolError::Closed);
        }
        self.initialize_locked(&topology).await
    }

    /// Create `min_instances` instances and start the reaper
    ///
    /// If any creation fails the instances created so far are closed and the
    /// pool stays uninitialized.
    async fn initialize_locked(self: &Arc<Self>, topology: &TopologyGuard<'_>) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }

        info!(
            "Initializing engine pool: min={}, max={}, capacity/instance={}, autoscale={}",
            self.config.min_instances,
            self.config.max_instances,
            self.config.per_instance_capacity,
            self.config.autoscale
        );

        let mut created = Vec::with_capacity(self.config.min_instances);
        for _ in 0..self.config.min_instances {
            match self.create_instance(topology).await {
                Ok(id) => created.push(id),
                Err(e) => {
                    error!("Pool initialization failed: {}", e);
                    let removed = self.state.lock().remove(&created);
                    self.close_instances(removed).await;
                    return Err(e);
                }
            }
        }

        let mut state = self.state.lock();
        state.initialized = true;
        state.reaper = Some(IdleReaper::spawn(
            Arc::downgrade(self),
            self.config.reaper_interval(),
        ));

        info!(
            "Engine pool ready with {} instances ({} session slots)",
            state.instances.len(),
            self.config.capacity_for(state.instances.len())
        );
        Ok(())
    }

    /// Launch one instance and append it to the pool
    pub(crate) async fn create_instance(&self, _topology: &TopologyGuard<'_>) -> Result<u64> {
        let id = self.state.lock().allocate_id();

        let instance = WorkerInstance::launch(
            id,
            &self.driver,
            self.config.per_instance_capacity,
            &self.launch_options,
            &self.context_options,
        )
        .await?;

        let mut state = self.state.lock();
        state.instances.push(instance);
        let pool_size = state.instances.len();
        state.counters.record_created(pool_size);
        publish_gauges(pool_size, state.active_sessions());

        info!("Created instance #{} (pool size: {})", id, pool_size);
        Ok(id)
    }

    /// Close detached instances concurrently, returning the failure count
    ///
    /// Every instance counts as closed whether or not its engine shut down
    /// cleanly.
    async fn close_instances(&self, instances: Vec<WorkerInstance<D>>) -> usize {
        if instances.is_empty() {
            return 0;
        }

        let count = instances.len();
        let results = join_all(instances.into_iter().map(WorkerInstance::shutdown)).await;

        let mut failures = 0;
        for result in results {
            if let Err(e) = result {
                warn!("{}", e);
                failures += 1;
            }
        }

        let mut state = self.state.lock();
        state.counters.record_closed(count);
        publish_gauges(state.instances.len(), state.active_sessions());
        failures
    }

    /// One reaping pass
    pub(crate) async fn reap_idle_locked(&self, _topology: &TopologyGuard<'_>) -> ReapReport {
        let removed = {
            let mut state = self.state.lock();
            let ids = select_idle(
                &state.instances,
                Instant::now(),
                self.config.idle_timeout(),
                self.config.min_instances,
            );
            state.remove(&ids)
        };

        if removed.is_empty() {
            return ReapReport::default();
        }

        let evicted: Vec<u64> = removed.iter().map(|i| i.id).collect();
        info!("Reaping {} idle instances: {:?}", evicted.len(), evicted);

        let failures = self.close_instances(removed).await;
        ReapReport { evicted, failures }
    }

    async fn scale_to(self: &Arc<Self>, target: usize) -> Result<ScaleOutcome> {
        let (min, max) = (self.config.min_instances, self.config.max_instances);
        if target < min || target > max {
            return Err(PoolError::config(format!(
                "scale target {} outside [{}, {}]",
                target, min, max
            )));
        }

        let topology = self.topology.lock().await;
        self.initialize_locked(&topology).await?;

        let previous = self.state.lock().instances.len();

        let (action, partial) = match target.cmp(&previous) {
            Ordering::Greater => {
                info!("Scaling up from {} to {} instances", previous, target);
                for _ in previous..target {
                    self.create_instance(&topology).await?;
                }
                (ScaleAction::ScaledUp, false)
            }
            Ordering::Less => {
                let wanted = previous - target;
                let removed = {
                    let mut state = self.state.lock();
                    let ids: Vec<u64> = state
                        .instances
                        .iter()
                        .rev()
                        .filter(|i| i.active_sessions == 0)
                        .take(wanted)
                        .map(|i| i.id)
                        .collect();
                    state.remove(&ids)
                };

                let closed = removed.len();
                if closed < wanted {
                    warn!(
                        "Scale down to {} is partial: only {} of {} instances were idle",
                        target, closed, wanted
                    );
                } else {
                    info!("Scaling down from {} to {} instances", previous, target);
                }

                self.close_instances(removed).await;
                (ScaleAction::ScaledDown, closed < wanted)
            }
            Ordering::Equal => (ScaleAction::NoChange, false),
        };

        let current = self.state.lock().instances.len();
        Ok(ScaleOutcome {
            action,
            previous,
            current,
            requested: target,
            partial,
        })
    }

    async fn close(&self) {
        let _topology = self.topology.lock().await;

        let reaper = self.state.lock().reaper.take();
        if let Some(reaper) = reaper {
            reaper.stop().await;
        }

        let (instances, was_initialized) = {
            let mut state = self.state.lock();
            let was_initialized = std::mem::replace(&mut state.initialized, false);
            state.close_epoch += 1;
            for instance in &state.instances {
                instance.retire();
            }
            (std::mem::take(&mut state.instances), was_initialized)
        };

        if !was_initialized && instances.is_empty() {
            debug!("Engine pool already closed");
            return;
        }

        info!("Closing engine pool ({} instances)", instances.len());
        let failures = self.close_instances(instances).await;
        if failures > 0 {
            warn!("{} instances failed to close cleanly", failures);
        }

        if let Err(e) = self.driver.shutdown().await {
            warn!("Failed to shut down engine driver: {}", e);
        }

        info!("Engine pool closed");
    }
}

/// Direction taken by [`PoolManager::scale_to`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleAction {
    ScaledUp,
    ScaledDown,
    NoChange,
}

/// Result of a manual scale request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScaleOutcome {
    pub action: ScaleAction,
    pub previous: usize,
    pub current: usize,
    pub requested: usize,

    /// Fewer instances were closed than requested because the rest were busy
    pub partial: bool,
}

/// Elastic pool of engine instances
///
/// Cheap to clone; clones share the same pool.
///
/// # Example
///
/// ```no_run
/// use engine_pool::{InMemoryDriver, PoolConfig, PoolManager, SessionHint};
///
/// # async fn demo() -> engine_pool::Result<()> {
/// let pool = PoolManager::new(PoolConfig::default(), InMemoryDriver::new())?;
///
/// let lease = pool
///     .acquire_session(Some(SessionHint::domain("www.tokopedia.com")))
///     .await?;
/// // ... drive the session ...
/// lease.finish(true).await;
///
/// pool.close().await;
/// # Ok(())
/// # }
/// ```
pub struct PoolManager<D: EngineDriver> {
    inner: Arc<PoolInner<D>>,
}

impl<D: EngineDriver> Clone for PoolManager<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: EngineDriver> PoolManager<D> {
    /// Create an uninitialized pool with default engine options
    pub fn new(config: PoolConfig, driver: D) -> Result<Self> {
        Self::with_options(
            config,
            driver,
            LaunchOptions::default(),
            ContextOptions::default(),
        )
    }

    pub fn with_options(
        config: PoolConfig,
        driver: D,
        launch_options: LaunchOptions,
        context_options: ContextOptions,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                driver,
                launch_options,
                context_options,
                topology: tokio::sync::Mutex::new(()),
                state: parking_lot::Mutex::new(PoolState::new()),
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn driver(&self) -> &D {
        &self.inner.driver
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.is_initialized()
    }

    /// Create the minimum instance set and start the idle reaper
    ///
    /// Idempotent, and safe to call concurrently. Called implicitly by the
    /// first acquire.
    pub async fn initialize(&self) -> Result<()> {
        let epoch = self.inner.close_epoch();
        self.inner.ensure_initialized(epoch).await
    }

    /// Check out a session
    ///
    /// Blocks while the pool is saturated at its ceiling. The hint selects the
    /// identity applied to this session only.
    pub async fn acquire_session(&self, hint: Option<SessionHint>) -> Result<SessionLease<D>> {
        SessionLease::open(&self.inner, hint.as_ref()).await
    }

    /// Run `body` inside a checked-out session
    ///
    /// The slot is released when the body completes; an `Err` from the body
    /// is recorded as a failed session and returned unchanged. If the future
    /// is dropped mid-body, the slot is still released.
    pub async fn with_session<F, Fut, T, E>(
        &self,
        hint: Option<SessionHint>,
        body: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce(Arc<SessionOf<D>>) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<PoolError>,
    {
        let lease = self.acquire_session(hint).await?;
        let result = body(lease.shared_session()).await;
        lease.finish(result.is_ok()).await;
        result
    }

    /// Snapshot recomputed from live instances
    pub fn get_stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        let now = Instant::now();

        PoolStats::new(
            state.initialized,
            self.inner.config.per_instance_capacity,
            &state.counters,
            state.instances.iter().map(|i| i.info(now)).collect(),
        )
    }

    pub fn health(&self) -> HealthReport {
        let state = self.inner.state.lock();
        let instance_count = state.instances.len();

        HealthReport {
            status: if state.initialized { "healthy" } else { "initializing" },
            initialized: state.initialized,
            instance_count,
            active_sessions: state.active_sessions(),
            total_capacity: self.inner.config.capacity_for(instance_count),
        }
    }

    /// Start a new statistics window
    ///
    /// Topology is untouched. Sessions in flight and live instances are
    /// carried into the new window as started and created.
    pub fn reset_stats(&self) {
        let mut state = self.inner.state.lock();
        let pool_size = state.instances.len();
        let active = state.active_sessions();

        state.counters.reset(pool_size, active);
        for instance in &mut state.instances {
            instance.total_served = 0;
        }

        info!("Pool statistics reset");
    }

    /// Resize the pool to `target` instances
    ///
    /// Scaling down only closes idle instances, newest first; if too few are
    /// idle the outcome is marked partial. A target outside
    /// `[min_instances, max_instances]` is rejected without touching the pool.
    pub async fn scale_to(&self, target: usize) -> Result<ScaleOutcome> {
        self.inner.scale_to(target).await
    }

    /// Run one reaping pass now instead of waiting for the next tick
    pub async fn reap_idle(&self) -> ReapReport {
        let topology = self.inner.topology.lock().await;
        self.inner.reap_idle_locked(&topology).await
    }

    /// Stop the reaper and close every instance, busy or not
    ///
    /// Idempotent. A later acquire initializes the pool again.
    pub async fn close(&self) {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{EngineSession, InMemoryDriver};
    use crate::pool::identity::{IdentityProfile, ANDROID_CHROME_UA};
    use std::time::Duration;

    fn config(capacity: usize, min: usize, max: usize) -> PoolConfig {
        PoolConfig {
            per_instance_capacity: capacity,
            min_instances: min,
            max_instances: max,
            idle_timeout_secs: 5,
            reaper_interval_secs: 1,
            ..Default::default()
        }
    }

    fn pool(config: PoolConfig) -> (PoolManager<InMemoryDriver>, InMemoryDriver) {
        let driver = InMemoryDriver::new();
        (PoolManager::new(config, driver.clone()).unwrap(), driver)
    }

    fn assert_consistent(manager: &PoolManager<InMemoryDriver>) {
        let stats = manager.get_stats();
        let config = manager.config();
        let mut sum = 0;
        for instance in &stats.instances {
            assert!(instance.active_sessions <= config.per_instance_capacity);
            sum += instance.active_sessions;
        }
        assert_eq!(sum, stats.active_sessions);
        assert!(stats.instance_count <= config.max_instances);
        if stats.initialized {
            assert!(stats.instance_count >= config.min_instances);
        }
    }

    #[derive(Debug, PartialEq)]
    enum TaskError {
        Pool(String),
        Body,
    }

    impl From<PoolError> for TaskError {
        fn from(e: PoolError) -> Self {
            TaskError::Pool(e.to_string())
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = PoolManager::new(config(0, 1, 1), InMemoryDriver::new());
        assert!(matches!(result, Err(PoolError::Config(_))));
    }

    #[tokio::test]
    async fn test_concurrent_initialize_is_idempotent() {
        let driver = InMemoryDriver::new().with_launch_delay(Duration::from_millis(10));
        let manager = PoolManager::new(config(2, 2, 4), driver.clone()).unwrap();

        let (a, b) = tokio::join!(manager.initialize(), manager.initialize());
        a.unwrap();
        b.unwrap();
        manager.initialize().await.unwrap();

        assert_eq!(manager.get_stats().instance_count, 2);
        assert_eq!(driver.stats().launched, 2);
        assert!(manager.health().initialized);
        manager.close().await;
    }

    #[tokio::test]
    async fn test_autoscale_creates_exactly_one_instance() {
        let (manager, driver) = pool(config(2, 1, 3));
        manager.initialize().await.unwrap();

        let (a, b, c) = tokio::join!(
            manager.acquire_session(None),
            manager.acquire_session(None),
            manager.acquire_session(None),
        );
        let leases = [a.unwrap(), b.unwrap(), c.unwrap()];

        let stats = manager.get_stats();
        assert_eq!(stats.instance_count, 2);
        assert_eq!(stats.active_sessions, 3);
        assert_eq!(stats.instances[0].active_sessions, 2);
        assert_eq!(stats.instances[1].active_sessions, 1);
        assert_eq!(driver.stats().launched, 2);
        assert_consistent(&manager);

        for lease in leases {
            lease.finish(true).await;
        }
        manager.close().await;
    }

    #[tokio::test]
    async fn test_first_fit_in_creation_order() {
        let (manager, _) = pool(config(2, 3, 3));
        manager.initialize().await.unwrap();

        let a = manager.acquire_session(None).await.unwrap();
        let b = manager.acquire_session(None).await.unwrap();
        let c = manager.acquire_session(None).await.unwrap();
        assert_eq!(a.instance_id(), 1);
        assert_eq!(b.instance_id(), 1);
        assert_eq!(c.instance_id(), 2);

        a.finish(true).await;
        let d = manager.acquire_session(None).await.unwrap();
        assert_eq!(d.instance_id(), 1);

        for lease in [b, c, d] {
            lease.finish(true).await;
        }
        manager.close().await;
    }

    #[tokio::test]
    async fn test_saturated_pool_waits_for_release() {
        let (manager, _) = pool(config(1, 1, 1));
        let held = manager.acquire_session(None).await.unwrap();

        let waiting = tokio::time::timeout(
            Duration::from_millis(50),
            manager.acquire_session(None),
        )
        .await;
        assert!(waiting.is_err());

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.acquire_session(None).await })
        };
        tokio::task::yield_now().await;
        held.finish(true).await;

        let lease = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(lease.instance_id(), 1);
        assert_consistent(&manager);

        lease.finish(true).await;

        // The abandoned wait consumed nothing
        let stats = manager.get_stats();
        assert_eq!(stats.counters.total_started, 2);
        assert_eq!(stats.active_sessions, 0);
        assert_eq!(stats.instances[0].available_slots, 1);
        manager.close().await;
    }

    #[tokio::test]
    async fn test_autoscale_disabled_queues_on_least_loaded() {
        let (manager, driver) = pool(PoolConfig {
            autoscale: false,
            ..config(1, 2, 3)
        });
        let a = manager.acquire_session(None).await.unwrap();
        let b = manager.acquire_session(None).await.unwrap();

        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            manager.acquire_session(None),
        )
        .await;
        assert!(blocked.is_err());
        assert_eq!(driver.stats().launched, 2);

        a.finish(true).await;
        b.finish(true).await;
        manager.close().await;
    }

    #[tokio::test]
    async fn test_empty_pool_without_autoscale_errors() {
        let (manager, _) = pool(PoolConfig {
            autoscale: false,
            ..config(1, 0, 2)
        });

        let result = manager.acquire_session(None).await;
        assert!(matches!(result, Err(PoolError::Config(_))));

        // Manual scale makes it usable
        manager.scale_to(1).await.unwrap();
        let lease = manager.acquire_session(None).await.unwrap();
        lease.finish(true).await;
        manager.close().await;
    }

    #[tokio::test]
    async fn test_body_error_releases_slot() {
        let (manager, _) = pool(config(1, 1, 1));

        let result: std::result::Result<(), TaskError> = manager
            .with_session(None, |_session| async { Err(TaskError::Body) })
            .await;
        assert_eq!(result, Err(TaskError::Body));

        // Slot is immediately reusable
        let value = tokio::time::timeout(
            Duration::from_millis(200),
            manager.with_session(None, |session| async move {
                Ok::<_, TaskError>(session.id().len())
            }),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(value > 0);

        let stats = manager.get_stats();
        assert_eq!(stats.counters.completed_err, 1);
        assert_eq!(stats.counters.completed_ok, 1);
        assert_eq!(stats.active_sessions, 0);
        manager.close().await;
    }

    #[tokio::test]
    async fn test_success_rate() {
        let (manager, driver) = pool(config(3, 1, 2));

        for i in 0..10 {
            let _: std::result::Result<(), TaskError> = manager
                .with_session(None, |_session| async move {
                    if i < 7 {
                        Ok(())
                    } else {
                        Err(TaskError::Body)
                    }
                })
                .await;
        }

        let stats = manager.get_stats();
        assert_eq!(stats.counters.total_started, 10);
        assert_eq!(stats.counters.completed_ok, 7);
        assert_eq!(stats.counters.completed_err, 3);
        assert_eq!(stats.success_rate, 70.0);
        assert_eq!(stats.instances[0].total_served, 10);
        assert_eq!(driver.stats().live_sessions(), 0);
        manager.close().await;
    }

    #[tokio::test]
    async fn test_dropped_lease_counts_as_failure() {
        let (manager, driver) = pool(config(1, 1, 1));

        let lease = manager.acquire_session(None).await.unwrap();
        drop(lease);

        let stats = manager.get_stats();
        assert_eq!(stats.active_sessions, 0);
        assert_eq!(stats.counters.completed_err, 1);
        assert_eq!(stats.instances[0].available_slots, 1);

        // Background close of the abandoned session
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(driver.stats().live_sessions(), 0);
        manager.close().await;
    }

    #[tokio::test]
    async fn test_cancelled_body_releases_slot() {
        let (manager, _) = pool(config(1, 1, 1));

        let task = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .with_session(None, |_session| async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok::<_, TaskError>(())
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.get_stats().active_sessions, 1);

        task.abort();
        let _ = task.await;

        let stats = manager.get_stats();
        assert_eq!(stats.active_sessions, 0);
        assert_eq!(stats.counters.completed_err, 1);
        manager.close().await;
    }

    #[tokio::test]
    async fn test_identity_applied_per_session() {
        let (manager, _) = pool(config(2, 1, 1));

        let mobile = manager
            .acquire_session(Some(SessionHint::domain("www.tokopedia.com")))
            .await
            .unwrap();
        let custom = manager
            .acquire_session(Some(IdentityProfile::new("agent/9").into()))
            .await
            .unwrap();

        assert_eq!(mobile.instance_id(), custom.instance_id());
        assert_eq!(mobile.user_agent(), Some(ANDROID_CHROME_UA));
        assert_eq!(custom.user_agent(), Some("agent/9"));

        mobile.finish(true).await;
        custom.finish(true).await;

        let plain = manager.acquire_session(None).await.unwrap();
        assert!(plain.user_agent().is_none());
        plain.finish(true).await;
        manager.close().await;
    }

    #[tokio::test]
    async fn test_identity_rejection_falls_back() {
        let (manager, driver) = pool(config(2, 1, 1));
        driver.reject_identity(true);

        let lease = manager
            .acquire_session(Some(SessionHint::Domain("example.com".into())))
            .await
            .unwrap();
        assert!(lease.user_agent().is_none());
        lease.finish(true).await;

        assert_eq!(manager.get_stats().counters.identity_fallbacks, 1);
        manager.close().await;
    }

    #[tokio::test]
    async fn test_initialize_rolls_back_on_launch_failure() {
        let driver = InMemoryDriver::new();
        let manager = PoolManager::new(config(2, 3, 3), driver.clone()).unwrap();
        driver.fail_next_launches(1);

        let result = manager.initialize().await;
        assert!(matches!(result, Err(PoolError::ResourceInit { .. })));
        assert!(!manager.is_initialized());
        assert_eq!(manager.get_stats().instance_count, 0);
        assert_eq!(driver.stats().live_engines(), 0);

        // The next attempt starts from scratch
        manager.initialize().await.unwrap();
        assert_eq!(manager.get_stats().instance_count, 3);
        manager.close().await;
    }

    #[tokio::test]
    async fn test_autoscale_failure_surfaces_error() {
        let (manager, driver) = pool(config(1, 1, 2));
        let held = manager.acquire_session(None).await.unwrap();

        driver.fail_next_launches(1);
        let result = manager.acquire_session(None).await;
        assert!(matches!(result, Err(PoolError::ResourceInit { .. })));
        assert_eq!(manager.get_stats().instance_count, 1);

        held.finish(true).await;
        manager.close().await;
    }

    #[tokio::test]
    async fn test_scale_to_bounds_rejected() {
        let (manager, driver) = pool(config(2, 1, 3));

        assert!(matches!(manager.scale_to(0).await, Err(PoolError::Config(_))));
        assert!(matches!(manager.scale_to(4).await, Err(PoolError::Config(_))));
        assert!(!manager.is_initialized());
        assert_eq!(driver.stats().launched, 0);
    }

    #[tokio::test]
    async fn test_scale_up_and_down() {
        let (manager, _) = pool(config(2, 1, 3));

        let up = manager.scale_to(3).await.unwrap();
        assert_eq!(up.action, ScaleAction::ScaledUp);
        assert_eq!((up.previous, up.current), (1, 3));

        let same = manager.scale_to(3).await.unwrap();
        assert_eq!(same.action, ScaleAction::NoChange);

        let down = manager.scale_to(1).await.unwrap();
        assert_eq!(down.action, ScaleAction::ScaledDown);
        assert_eq!(down.current, 1);
        assert!(!down.partial);
        assert_eq!(manager.get_stats().instances[0].id, 1);

        let json = serde_json::to_value(&down).unwrap();
        assert_eq!(json["action"], "scaled_down");
        manager.close().await;
    }

    #[tokio::test]
    async fn test_scale_down_never_closes_busy_instances() {
        let (manager, driver) = pool(config(1, 1, 3));
        manager.scale_to(3).await.unwrap();

        let leases = [
            manager.acquire_session(None).await.unwrap(),
            manager.acquire_session(None).await.unwrap(),
            manager.acquire_session(None).await.unwrap(),
        ];
        let outcome = manager.scale_to(1).await.unwrap();
        assert_eq!(outcome.current, 3);
        assert!(outcome.partial);
        assert_eq!(driver.stats().engines_closed, 0);

        let [a, b, c] = leases;
        b.finish(true).await;
        let outcome = manager.scale_to(1).await.unwrap();
        assert_eq!(outcome.current, 2);
        assert!(outcome.partial);
        let ids: Vec<u64> = manager.get_stats().instances.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![1, 3]);

        a.finish(true).await;
        c.finish(true).await;
        manager.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_evicts_idle_instances() {
        let (manager, driver) = pool(config(1, 1, 3));
        manager.scale_to(3).await.unwrap();

        let a = manager.acquire_session(None).await.unwrap();
        let b = manager.acquire_session(None).await.unwrap();
        let c = manager.acquire_session(None).await.unwrap();
        b.finish(true).await;

        tokio::time::sleep(Duration::from_secs(8)).await;
        let ids: Vec<u64> = manager.get_stats().instances.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(driver.stats().engines_closed, 1);

        a.finish(true).await;
        c.finish(true).await;
        tokio::time::sleep(Duration::from_secs(8)).await;

        let ids: Vec<u64> = manager.get_stats().instances.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![1]);
        assert_eq!(manager.get_stats().counters.instances_closed, 2);
        manager.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_idle_continues_past_close_failures() {
        let (manager, driver) = pool(PoolConfig {
            reaper_interval_secs: 3600,
            ..config(1, 0, 3)
        });
        manager.scale_to(3).await.unwrap();
        driver.fail_next_closes(1);

        tokio::time::advance(Duration::from_secs(6)).await;
        let report = manager.reap_idle().await;

        assert_eq!(report.evicted, vec![3, 2, 1]);
        assert_eq!(report.failures, 1);
        assert_eq!(manager.get_stats().instance_count, 0);
        manager.close().await;
    }

    #[tokio::test]
    async fn test_reset_stats_keeps_topology() {
        let (manager, _) = pool(config(2, 1, 2));
        let _: std::result::Result<(), TaskError> =
            manager.with_session(None, |_| async { Ok(()) }).await;
        let held = manager.acquire_session(None).await.unwrap();

        manager.reset_stats();
        let stats = manager.get_stats();
        assert_eq!(stats.counters.total_started, 1);
        assert_eq!(stats.counters.completed_ok, 0);
        assert_eq!(stats.counters.peak_active_sessions, 1);
        assert_eq!(stats.counters.instances_created, 1);
        assert_eq!(stats.active_sessions, 1);
        assert_eq!(stats.instance_count, 1);
        assert_eq!(stats.instances[0].total_served, 0);

        held.finish(true).await;
        assert_eq!(manager.get_stats().counters.completed_ok, 1);
        manager.close().await;
    }

    #[tokio::test]
    async fn test_success_rate_bounded_across_reset() {
        let (manager, _) = pool(config(2, 1, 1));
        let held = manager.acquire_session(None).await.unwrap();

        manager.reset_stats();
        held.finish(true).await;
        let _: std::result::Result<(), TaskError> =
            manager.with_session(None, |_| async { Ok(()) }).await;

        let stats = manager.get_stats();
        assert_eq!(stats.counters.total_started, 2);
        assert_eq!(stats.counters.completed_ok, 2);
        assert_eq!(stats.success_rate, 100.0);
        manager.close().await;
    }

    #[tokio::test]
    async fn test_waiter_fails_when_pool_closes() {
        let (manager, driver) = pool(config(1, 1, 1));
        let held = manager.acquire_session(None).await.unwrap();

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.acquire_session(None).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        manager.close().await;
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(PoolError::Closed)));

        // Nothing was started again behind the close
        assert!(!manager.is_initialized());
        assert_eq!(manager.get_stats().instance_count, 0);
        assert_eq!(driver.stats().live_engines(), 0);

        held.finish(true).await;

        // A fresh acquire still brings the pool back
        let lease = manager.acquire_session(None).await.unwrap();
        assert!(manager.is_initialized());
        lease.finish(true).await;
        manager.close().await;
        assert_eq!(driver.stats().live_engines(), 0);
    }

    #[tokio::test]
    async fn test_waiter_moves_on_when_its_instance_is_scaled_away() {
        let (manager, driver) = pool(PoolConfig {
            autoscale: false,
            ..config(1, 1, 2)
        });
        manager.scale_to(2).await.unwrap();
        let a = manager.acquire_session(None).await.unwrap();
        let b = manager.acquire_session(None).await.unwrap();
        assert_eq!((a.instance_id(), b.instance_id()), (1, 2));

        // Both full: the waiter queues on the oldest instance
        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.acquire_session(None).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Freeing #1 and scaling down before the waiter runs retires #1 under it
        a.finish(true).await;
        let outcome = manager.scale_to(1).await.unwrap();
        assert_eq!(outcome.current, 1);
        assert_eq!(manager.get_stats().instances[0].id, 2);

        b.finish(true).await;
        let lease = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(lease.instance_id(), 2);

        let stats = manager.get_stats();
        assert_eq!(stats.active_sessions, 1);
        assert_eq!(stats.counters.total_started, 3);
        assert!(manager.is_initialized());
        assert_eq!(driver.stats().launched, 2);

        lease.finish(true).await;
        manager.close().await;
    }

    #[tokio::test]
    async fn test_close_then_reinitialize() {
        let (manager, driver) = pool(config(2, 2, 3));
        manager.initialize().await.unwrap();
        let lease = manager.acquire_session(None).await.unwrap();

        manager.close().await;
        manager.close().await;

        let stats = driver.stats();
        assert_eq!(stats.live_engines(), 0);
        assert_eq!(stats.shutdowns, 1);
        assert!(!manager.health().initialized);
        assert_eq!(manager.get_stats().instance_count, 0);

        // Outstanding lease finishes without touching the new pool
        lease.finish(true).await;
        assert_eq!(manager.get_stats().counters.completed_ok, 1);

        let lease = manager.acquire_session(None).await.unwrap();
        assert_eq!(manager.get_stats().instance_count, 2);
        assert_eq!(lease.instance_id(), 3);
        lease.finish(true).await;
        manager.close().await;
        assert_eq!(driver.stats().shutdowns, 2);
    }

    #[tokio::test]
    async fn test_health_report() {
        let (manager, _) = pool(config(4, 2, 3));
        assert_eq!(manager.health().status, "initializing");

        manager.initialize().await.unwrap();
        let health = manager.health();
        assert_eq!(health.status, "healthy");
        assert_eq!(health.instance_count, 2);
        assert_eq!(health.total_capacity, 8);
        manager.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_load_respects_capacity() {
        let (manager, driver) = pool(config(3, 1, 3));
        manager.initialize().await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..60u64 {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                manager
                    .with_session(None, |_| async move {
                        tokio::time::sleep(Duration::from_millis(i % 7)).await;
                        if i % 5 == 0 {
                            Err(TaskError::Body)
                        } else {
                            Ok(())
                        }
                    })
                    .await
            }));
        }

        let monitor = {
            let manager = manager.clone();
            tokio::spawn(async move {
                for _ in 0..50 {
                    assert_consistent(&manager);
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            })
        };

        for task in tasks {
            let _ = task.await.unwrap();
        }
        monitor.await.unwrap();

        let stats = manager.get_stats();
        assert_eq!(stats.active_sessions, 0);
        assert_eq!(stats.counters.total_started, 60);
        assert_eq!(stats.counters.completed_ok, 48);
        assert_eq!(stats.counters.completed_err, 12);
        assert!(stats.counters.peak_active_sessions <= 9);
        assert!(stats.instance_count <= 3);
        assert_eq!(driver.stats().live_sessions(), 0);
        manager.close().await;
    }
}
