// packages/pool/src/utils/errors.rs
//! Error types for the pool and the engine drivers it consumes

use thiserror::Error;

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, PoolError>;

/// Failures reported by an engine driver
///
/// Drivers are black boxes to the pool: their errors are never retried, only
/// classified and propagated.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The engine process could not be started
    #[error("engine launch failed: {0}")]
    Launch(String),

    /// The shared execution context could not be opened
    #[error("context creation failed: {0}")]
    Context(String),

    /// A session could not be opened or failed while in use
    #[error("session failed: {0}")]
    Session(String),

    /// The session could not apply the requested identity profile
    #[error("identity profile rejected: {0}")]
    IdentityRejected(String),

    /// Tearing down a session, context or engine failed
    #[error("close failed: {0}")]
    Close(String),
}

/// Errors surfaced by the pool manager
#[derive(Debug, Error)]
pub enum PoolError {
    /// Invalid construction parameters or scale target. Never mutates state.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An instance failed to start; nothing was registered for it
    #[error("instance #{instance_id} failed to start: {source}")]
    ResourceInit {
        instance_id: u64,
        #[source]
        source: DriverError,
    },

    /// A checked-out session could not be opened or failed in use
    #[error("session error: {0}")]
    Session(#[source] DriverError),

    /// The pool was closed while this caller waited for a slot
    #[error("pool closed while waiting for a session slot")]
    Closed,

    /// Closing an instance failed during eviction or shutdown
    #[error("cleanup of instance #{instance_id} failed: {source}")]
    Cleanup {
        instance_id: u64,
        #[source]
        source: DriverError,
    },

    /// Loading configuration from files or the environment failed
    #[error("failed to load configuration: {0}")]
    LoadConfig(#[from] config::ConfigError),
}

impl PoolError {
    /// Build a [`PoolError::Config`] from anything printable
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Short operator hint for the error, if one applies
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::Config(_) => Some("check min_instances <= target <= max_instances"),
            Self::ResourceInit { .. } => {
                Some("the engine executable may be missing or out of resources")
            }
            Self::Cleanup { .. } => Some("the instance was removed from the pool regardless"),
            Self::Closed => Some("acquire again to start a fresh pool"),
            Self::Session(_) | Self::LoadConfig(_) => None,
        }
    }
}
