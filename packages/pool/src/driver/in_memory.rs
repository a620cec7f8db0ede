// packages/pool/src/driver/in_memory.rs
//! In-process engine driver
//!
//! Models engines, contexts and sessions without any external process. Useful
//! for dry runs of the host binary and for exercising the pool under injected
//! failures:
//!
//! - launches, context opens and closes can be made to fail N times
//! - identity profiles can be rejected
//! - launches can be slowed down to widen race windows
//!
//! Live-resource counters make leaks observable.

use crate::driver::{
    ContextOptions, Engine, EngineContext, EngineDriver, EngineSession, LaunchOptions,
    SessionOptions,
};
use crate::utils::errors::DriverError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;
use ulid::Ulid;

#[derive(Debug, Default)]
struct Shared {
    launched: AtomicU64,
    engines_closed: AtomicU64,
    contexts_opened: AtomicU64,
    contexts_closed: AtomicU64,
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
    shutdowns: AtomicU64,

    fail_launches: AtomicUsize,
    fail_contexts: AtomicUsize,
    fail_closes: AtomicUsize,
    reject_identity: AtomicBool,
    launch_delay_ms: AtomicU64,
}

/// Consume one pending injected failure, if any
fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// In-process driver. Cloning shares the same counters and knobs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDriver {
    shared: Arc<Shared>,
}

/// Counters of an [`InMemoryDriver`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InMemoryDriverStats {
    pub launched: u64,
    pub engines_closed: u64,
    pub contexts_opened: u64,
    pub contexts_closed: u64,
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub shutdowns: u64,
}

impl InMemoryDriverStats {
    /// Engines launched and not yet closed
    pub fn live_engines(&self) -> u64 {
        self.launched - self.engines_closed
    }

    /// Sessions opened and not yet closed
    pub fn live_sessions(&self) -> u64 {
        self.sessions_opened - self.sessions_closed
    }
}

impl InMemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every launch, simulating a slow engine start
    pub fn with_launch_delay(self, delay: Duration) -> Self {
        self.shared
            .launch_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
        self
    }

    /// Make the next `n` launches fail
    pub fn fail_next_launches(&self, n: usize) {
        self.shared.fail_launches.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` context opens fail
    pub fn fail_next_contexts(&self, n: usize) {
        self.shared.fail_contexts.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` engine closes fail
    pub fn fail_next_closes(&self, n: usize) {
        self.shared.fail_closes.store(n, Ordering::SeqCst);
    }

    /// Reject every session that asks for an identity profile
    pub fn reject_identity(&self, reject: bool) {
        self.shared.reject_identity.store(reject, Ordering::SeqCst);
    }

    pub fn stats(&self) -> InMemoryDriverStats {
        let s = &self.shared;
        InMemoryDriverStats {
            launched: s.launched.load(Ordering::SeqCst),
            engines_closed: s.engines_closed.load(Ordering::SeqCst),
            contexts_opened: s.contexts_opened.load(Ordering::SeqCst),
            contexts_closed: s.contexts_closed.load(Ordering::SeqCst),
            sessions_opened: s.sessions_opened.load(Ordering::SeqCst),
            sessions_closed: s.sessions_closed.load(Ordering::SeqCst),
            shutdowns: s.shutdowns.load(Ordering::SeqCst),
        }
    }
}

#[async_trait]
impl EngineDriver for InMemoryDriver {
    type Engine = InMemoryEngine;

    async fn launch(&self, options: &LaunchOptions) -> Result<InMemoryEngine, DriverError> {
        let delay = self.shared.launch_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if take_failure(&self.shared.fail_launches) {
            return Err(DriverError::Launch("injected launch failure".into()));
        }

        let id = self.shared.launched.fetch_add(1, Ordering::SeqCst) + 1;
        trace!("In-memory engine #{} launched (headless: {})", id, options.headless);

        Ok(InMemoryEngine {
            id,
            shared: Arc::clone(&self.shared),
            closed: AtomicBool::new(false),
        })
    }

    async fn shutdown(&self) -> Result<(), DriverError> {
        self.shared.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Engine created by [`InMemoryDriver`]
#[derive(Debug)]
pub struct InMemoryEngine {
    id: u64,
    shared: Arc<Shared>,
    closed: AtomicBool,
}

#[async_trait]
impl Engine for InMemoryEngine {
    type Context = InMemoryContext;

    async fn new_persistent_context(
        &self,
        options: &ContextOptions,
    ) -> Result<InMemoryContext, DriverError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DriverError::Context("engine is closed".into()));
        }
        if take_failure(&self.shared.fail_contexts) {
            return Err(DriverError::Context("injected context failure".into()));
        }

        self.shared.contexts_opened.fetch_add(1, Ordering::SeqCst);
        Ok(InMemoryContext {
            engine_id: self.id,
            options: options.clone(),
            shared: Arc::clone(&self.shared),
            closed: AtomicBool::new(false),
        })
    }

    async fn close(&self) -> Result<(), DriverError> {
        if take_failure(&self.shared.fail_closes) {
            return Err(DriverError::Close(format!(
                "injected close failure for engine #{}",
                self.id
            )));
        }
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shared.engines_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Shared context created by [`InMemoryEngine`]
#[derive(Debug)]
pub struct InMemoryContext {
    engine_id: u64,
    options: ContextOptions,
    shared: Arc<Shared>,
    closed: AtomicBool,
}

#[async_trait]
impl EngineContext for InMemoryContext {
    type Session = InMemorySession;

    async fn new_session(&self, options: &SessionOptions) -> Result<InMemorySession, DriverError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DriverError::Session("context is closed".into()));
        }
        if options.identity.is_some() && self.shared.reject_identity.load(Ordering::SeqCst) {
            return Err(DriverError::IdentityRejected(
                "user agent override not supported".into(),
            ));
        }

        self.shared.sessions_opened.fetch_add(1, Ordering::SeqCst);

        let mut headers = self.options.extra_headers.clone();
        let user_agent = options.identity.as_ref().map(|identity| {
            headers.extend(identity.extra_headers.iter().cloned());
            identity.user_agent.clone()
        });

        Ok(InMemorySession {
            id: Ulid::new().to_string(),
            engine_id: self.engine_id,
            user_agent,
            headers,
            shared: Arc::clone(&self.shared),
        })
    }

    async fn close(&self) -> Result<(), DriverError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shared.contexts_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Session created by [`InMemoryContext`]
#[derive(Debug)]
pub struct InMemorySession {
    id: String,
    engine_id: u64,
    user_agent: Option<String>,
    headers: Vec<(String, String)>,
    shared: Arc<Shared>,
}

impl InMemorySession {
    /// Engine hosting this session
    pub fn engine_id(&self) -> u64 {
        self.engine_id
    }

    /// Identity override, `None` when the context default applies
    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }
}

#[async_trait]
impl EngineSession for InMemorySession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.shared.sessions_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
