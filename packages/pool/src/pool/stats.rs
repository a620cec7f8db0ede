// packages/pool/src/pool/stats.rs
//! Pool statistics
//!
//! Running counters live inside the pool state and are only touched under the
//! bookkeeping lock. Everything derived from topology (active sessions,
//! capacity, utilization) is recomputed from the live instances on every
//! snapshot and never cached.

use crate::observability::names;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Running counters since startup or the last reset
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolCounters {
    /// Sessions checked out
    pub total_started: u64,

    /// Sessions released after a successful body
    pub completed_ok: u64,

    /// Sessions released after an error, a panic or cancellation
    pub completed_err: u64,

    pub peak_active_sessions: usize,
    pub peak_instance_count: usize,
    pub instances_created: u64,
    pub instances_closed: u64,

    /// Sessions that could not honor their identity profile and fell back to
    /// the instance default
    pub identity_fallbacks: u64,
}

impl PoolCounters {
    pub(crate) fn record_started(&mut self, active_now: usize) {
        self.total_started += 1;
        self.peak_active_sessions = self.peak_active_sessions.max(active_now);
        metrics::counter!(names::SESSIONS_STARTED).increment(1);
    }

    pub(crate) fn record_completed(&mut self, ok: bool) {
        let outcome = if ok {
            self.completed_ok += 1;
            "ok"
        } else {
            self.completed_err += 1;
            "err"
        };
        metrics::counter!(names::SESSIONS_COMPLETED, "outcome" => outcome).increment(1);
    }

    pub(crate) fn record_created(&mut self, pool_size: usize) {
        self.instances_created += 1;
        self.peak_instance_count = self.peak_instance_count.max(pool_size);
        metrics::counter!(names::INSTANCES_CREATED).increment(1);
    }

    pub(crate) fn record_closed(&mut self, count: usize) {
        self.instances_closed += count as u64;
        metrics::counter!(names::INSTANCES_CLOSED).increment(count as u64);
    }

    pub(crate) fn record_identity_fallback(&mut self) {
        self.identity_fallbacks += 1;
    }

    /// Start a new counting window over the live topology
    ///
    /// Sessions still in flight count as started in the new window, so their
    /// completions never outnumber starts. Live instances count as created.
    pub(crate) fn reset(&mut self, pool_size: usize, active_now: usize) {
        *self = Self {
            total_started: active_now as u64,
            peak_active_sessions: active_now,
            peak_instance_count: pool_size,
            instances_created: pool_size as u64,
            ..Self::default()
        };
    }
}

/// Publish topology gauges
pub(crate) fn publish_gauges(instances: usize, active_sessions: usize) {
    metrics::gauge!(names::INSTANCES).set(instances as f64);
    metrics::gauge!(names::ACTIVE_SESSIONS).set(active_sessions as f64);
}

/// Per-instance view
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceInfo {
    pub id: u64,
    pub active_sessions: usize,
    pub capacity_limit: usize,

    /// Admission permits currently free on the instance semaphore
    pub available_slots: usize,

    pub total_served: u64,
    pub uptime_secs: u64,
    pub idle_secs: u64,
    pub created_at: DateTime<Utc>,
}

/// Live snapshot returned by `get_stats()`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub initialized: bool,
    pub instance_count: usize,

    /// Sum of `active_sessions` over live instances
    pub active_sessions: usize,

    /// `instance_count × per_instance_capacity`
    pub total_capacity: usize,

    pub utilization_percent: f64,

    /// `completed_ok / total_started × 100`
    pub success_rate: f64,

    #[serde(flatten)]
    pub counters: PoolCounters,

    pub instances: Vec<InstanceInfo>,
}

impl PoolStats {
    pub(crate) fn new(
        initialized: bool,
        per_instance_capacity: usize,
        counters: &PoolCounters,
        instances: Vec<InstanceInfo>,
    ) -> Self {
        let instance_count = instances.len();
        let active_sessions: usize = instances.iter().map(|i| i.active_sessions).sum();
        let total_capacity = instance_count * per_instance_capacity;

        Self {
            initialized,
            instance_count,
            active_sessions,
            total_capacity,
            utilization_percent: percentage(active_sessions as u64, total_capacity as u64),
            success_rate: percentage(counters.completed_ok, counters.total_started),
            counters: counters.clone(),
            instances,
        }
    }
}

/// Compact liveness summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub initialized: bool,
    pub instance_count: usize,
    pub active_sessions: usize,
    pub total_capacity: usize,
}

/// `part / whole × 100`, or 0 when `whole` is 0
fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        (part as f64 / whole as f64) * 100.0
    }
}
