// packages/pool/src/driver/mod.rs
//! Engine driver abstraction
//!
//! The pool never talks to an engine directly. It consumes a driver through
//! four traits mirroring the engine's object model:
//!
//! ```text
//! EngineDriver ──launch──▶ Engine ──new_persistent_context──▶ EngineContext
//!                                                                  │
//!                                                            new_session
//!                                                                  ▼
//!                                                            EngineSession
//! ```
//!
//! Every call may fail and none is retried by the pool. Associated types keep
//! the concrete session type visible to callers, so work done inside a session
//! uses the driver's own API.
//!
//! Bundled drivers:
//!
//! - [`InMemoryDriver`]: in-process model with failure injection
//! - [`ProcessDriver`]: one child process per engine instance

pub mod in_memory;
pub mod process;

use crate::pool::identity::IdentityProfile;
use crate::utils::errors::DriverError;
use async_trait::async_trait;

pub use in_memory::{InMemoryDriver, InMemoryDriverStats, InMemorySession};
pub use process::{ProcessDriver, ProcessDriverConfig, ProcessSession};

/// Options used when launching an engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOptions {
    pub headless: bool,

    /// Extra engine arguments
    pub args: Vec<String>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            headless: true,
            args: vec![],
        }
    }
}

/// Options for the long-lived context shared by all sessions of an instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextOptions {
    pub locale: String,
    pub extra_headers: Vec<(String, String)>,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            locale: "en-US".to_string(),
            extra_headers: vec![("Accept-Language".to_string(), "en-US,en;q=0.9".to_string())],
        }
    }
}

/// Options for a single session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOptions {
    /// Identity applied to this session only. `None` keeps the context default.
    pub identity: Option<IdentityProfile>,
}

impl SessionOptions {
    pub fn with_identity(identity: IdentityProfile) -> Self {
        Self {
            identity: Some(identity),
        }
    }
}

/// Entry point of an engine driver (one per process)
#[async_trait]
pub trait EngineDriver: Send + Sync + 'static {
    type Engine: Engine;

    /// Start one engine
    async fn launch(&self, options: &LaunchOptions) -> Result<Self::Engine, DriverError>;

    /// Release the process-wide driver handle
    async fn shutdown(&self) -> Result<(), DriverError>;
}

/// A running engine
#[async_trait]
pub trait Engine: Send + Sync + 'static {
    type Context: EngineContext;

    /// Open the long-lived context reused by every session on this engine
    async fn new_persistent_context(
        &self,
        options: &ContextOptions,
    ) -> Result<Self::Context, DriverError>;

    async fn close(&self) -> Result<(), DriverError>;
}

/// Shared execution context of an engine
#[async_trait]
pub trait EngineContext: Send + Sync + 'static {
    type Session: EngineSession;

    async fn new_session(&self, options: &SessionOptions) -> Result<Self::Session, DriverError>;

    async fn close(&self) -> Result<(), DriverError>;
}

/// A lightweight unit of work inside a context
#[async_trait]
pub trait EngineSession: Send + Sync + 'static {
    fn id(&self) -> &str;

    async fn close(&self) -> Result<(), DriverError>;
}

/// Engine type of a driver
pub type EngineOf<D> = <D as EngineDriver>::Engine;

/// Context type of a driver
pub type ContextOf<D> = <EngineOf<D> as Engine>::Context;

/// Session type of a driver
pub type SessionOf<D> = <ContextOf<D> as EngineContext>::Session;
