// packages/pool/src/lib.rs
//! Engine Pool Library
//!
//! An elastic pool of heavyweight engine instances (headless browsers and
//! similar), each hosting a bounded number of concurrent lightweight sessions.
//!
//! # Architecture
//!
//! The crate is structured into a few modules:
//!
//! - **pool**: pool manager, admission control, idle reaper, statistics
//! - **driver**: engine driver traits plus in-memory and process drivers
//! - **observability**: tracing and metrics setup
//! - **utils**: configuration and error types

pub mod driver;
pub mod observability;
pub mod pool;
pub mod utils;

// Re-export commonly used types
pub use driver::{
    EngineDriver, EngineSession, InMemoryDriver, ProcessDriver, ProcessDriverConfig, SessionOf,
};
pub use pool::{
    HealthReport, IdentityProfile, PoolManager, PoolStats, ReapReport, ScaleAction, ScaleOutcome,
    SessionHint, SessionLease,
};
pub use utils::config::{AppConfig, PoolConfig};
pub use utils::errors::{DriverError, PoolError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
