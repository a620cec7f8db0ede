// packages/pool/src/pool/mod.rs
//! Elastic engine pool
//!
//! Multiplexes many short sessions over a small, elastic set of heavyweight
//! engine instances:
//!
//! - **Manager**: public API, lifecycle and manual scaling
//! - **Admission**: select-or-scale, blocking backpressure, session leases
//! - **Instance**: one engine, its shared context and admission semaphore
//! - **Reaper**: background eviction of idle instances
//! - **Identity**: per-session user agent and header profiles
//! - **Stats**: counters and live snapshots
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                 PoolManager (min..=max)                   │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐        │
//! │  │ Instance #1 │  │ Instance #2 │  │ Instance #3 │        │
//! │  │ ▣ ▣ ▣ □ □   │  │ ▣ □ □ □ □   │  │ □ □ □ □ □   │ ◀─ idle │
//! │  └─────────────┘  └─────────────┘  └─────────────┘  reaper │
//! │         ▲                ▲                                │
//! │         └───── first fit ┴── autoscale ── least loaded    │
//! │                          │                                │
//! │                acquire_session(hint)                      │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ▣ = active session slot, □ = free slot (`per_instance_capacity` each)

pub mod admission;
pub mod identity;
mod instance;
pub mod manager;
pub mod reaper;
pub mod stats;

pub use admission::SessionLease;
pub use identity::{IdentityProfile, SessionHint};
pub use manager::{PoolManager, ScaleAction, ScaleOutcome};
pub use reaper::ReapReport;
pub use stats::{HealthReport, InstanceInfo, PoolCounters, PoolStats};
