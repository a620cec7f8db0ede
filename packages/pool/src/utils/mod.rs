// packages/pool/src/utils/mod.rs
//! Shared configuration and error types

pub mod config;
pub mod errors;

pub use config::{AppConfig, DriverConfig, DriverKind, LoggingConfig, PoolConfig};
pub use errors::{DriverError, PoolError, Result};
