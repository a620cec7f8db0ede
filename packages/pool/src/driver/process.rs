// packages/pool/src/driver/process.rs
//! Child-process engine driver
//!
//! Each engine is one child process of a configurable executable (typically a
//! headless browser). The executable is resolved once through `PATH`.
//! Stopping sends SIGTERM, waits for a grace period, then falls back to
//! SIGKILL.
//!
//! Contexts and sessions are logical handles over the running process; the
//! wire protocol spoken to the engine belongs to the caller.

use crate::driver::{
    ContextOptions, Engine, EngineContext, EngineDriver, EngineSession, LaunchOptions,
    SessionOptions,
};
use crate::pool::identity::IdentityProfile;
use crate::utils::config::DriverConfig;
use crate::utils::errors::DriverError;
use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use ulid::Ulid;

/// Configuration for [`ProcessDriver`]
#[derive(Debug, Clone)]
pub struct ProcessDriverConfig {
    /// Executable name or path
    pub executable: String,

    /// Arguments passed to every launch
    pub args: Vec<String>,

    /// Time allowed between SIGTERM and SIGKILL
    pub stop_grace: Duration,
}

impl Default for ProcessDriverConfig {
    fn default() -> Self {
        Self {
            executable: "chromium".to_string(),
            args: vec![],
            stop_grace: Duration::from_secs(2),
        }
    }
}

impl From<&DriverConfig> for ProcessDriverConfig {
    fn from(config: &DriverConfig) -> Self {
        Self {
            executable: config.executable.clone(),
            args: config.args.clone(),
            stop_grace: Duration::from_secs(config.stop_grace_secs),
        }
    }
}

/// Driver launching one child process per engine
pub struct ProcessDriver {
    config: ProcessDriverConfig,

    /// Resolved executable path (cached)
    executable_path: Mutex<Option<PathBuf>>,
}

impl ProcessDriver {
    pub fn new(config: ProcessDriverConfig) -> Self {
        Self {
            config,
            executable_path: Mutex::new(None),
        }
    }

    /// Find the configured executable in PATH
    fn find_executable(&self) -> Result<PathBuf, DriverError> {
        let mut cached = self.executable_path.lock();
        if let Some(path) = cached.as_ref() {
            return Ok(path.clone());
        }

        let path = which::which(&self.config.executable).map_err(|e| {
            DriverError::Launch(format!(
                "executable '{}' not found in PATH: {}",
                self.config.executable, e
            ))
        })?;

        info!("Found {} at {:?}", self.config.executable, path);
        *cached = Some(path.clone());
        Ok(path)
    }
}

#[async_trait]
impl EngineDriver for ProcessDriver {
    type Engine = ProcessEngine;

    async fn launch(&self, options: &LaunchOptions) -> Result<ProcessEngine, DriverError> {
        let executable = self.find_executable()?;

        let mut command = Command::new(&executable);
        if options.headless {
            command.arg("--headless");
        }
        command
            .args(&options.args)
            .args(&self.config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| DriverError::Launch(format!("failed to spawn {:?}: {}", executable, e)))?;

        let pid = child
            .id()
            .ok_or_else(|| DriverError::Launch("process exited before reporting a pid".into()))?;

        debug!("Engine process spawned with PID {}", pid);

        Ok(ProcessEngine {
            pid,
            child: tokio::sync::Mutex::new(Some(child)),
            stop_grace: self.config.stop_grace,
        })
    }

    async fn shutdown(&self) -> Result<(), DriverError> {
        // Forget the resolved path so a later restart picks up a reinstalled binary
        self.executable_path.lock().take();
        Ok(())
    }
}

/// One running engine process
pub struct ProcessEngine {
    pid: u32,
    child: tokio::sync::Mutex<Option<Child>>,
    stop_grace: Duration,
}

impl ProcessEngine {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether the process still exists
    pub fn is_running(&self) -> bool {
        kill(Pid::from_raw(self.pid as i32), None).is_ok()
    }
}

#[async_trait]
impl Engine for ProcessEngine {
    type Context = ProcessContext;

    async fn new_persistent_context(
        &self,
        options: &ContextOptions,
    ) -> Result<ProcessContext, DriverError> {
        if self.child.lock().await.is_none() {
            return Err(DriverError::Context(format!(
                "engine process {} is stopped",
                self.pid
            )));
        }

        Ok(ProcessContext {
            pid: self.pid,
            options: options.clone(),
            sessions: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    async fn close(&self) -> Result<(), DriverError> {
        let mut guard = self.child.lock().await;
        let Some(mut child) = guard.take() else {
            return Ok(());
        };

        debug!("Sending SIGTERM to PID {}", self.pid);
        if let Err(e) = kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM) {
            warn!("Failed to send SIGTERM to PID {}: {}", self.pid, e);
        }

        match tokio::time::timeout(self.stop_grace, child.wait()).await {
            Ok(Ok(status)) => {
                debug!("Engine process {} exited with status: {}", self.pid, status);
                Ok(())
            }
            Ok(Err(e)) => Err(DriverError::Close(format!(
                "error waiting for PID {}: {}",
                self.pid, e
            ))),
            Err(_) => {
                debug!("PID {} still alive after grace period, sending SIGKILL", self.pid);
                child.kill().await.map_err(|e| {
                    DriverError::Close(format!("failed to kill PID {}: {}", self.pid, e))
                })
            }
        }
    }
}

/// Logical shared context over an engine process
pub struct ProcessContext {
    pid: u32,
    options: ContextOptions,
    sessions: AtomicU64,
    closed: AtomicBool,
}

impl ProcessContext {
    pub fn locale(&self) -> &str {
        &self.options.locale
    }

    /// Sessions opened on this context so far
    pub fn sessions_opened(&self) -> u64 {
        self.sessions.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EngineContext for ProcessContext {
    type Session = ProcessSession;

    async fn new_session(&self, options: &SessionOptions) -> Result<ProcessSession, DriverError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DriverError::Session("context is closed".into()));
        }
        self.sessions.fetch_add(1, Ordering::Relaxed);

        Ok(ProcessSession {
            id: Ulid::new().to_string(),
            pid: self.pid,
            identity: options.identity.clone(),
        })
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Session handle bound to an engine process
#[derive(Debug)]
pub struct ProcessSession {
    id: String,
    pid: u32,
    identity: Option<IdentityProfile>,
}

impl ProcessSession {
    /// PID of the engine hosting this session
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn identity(&self) -> Option<&IdentityProfile> {
        self.identity.as_ref()
    }
}

#[async_trait]
impl EngineSession for ProcessSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn close(&self) -> Result<(), DriverError> {
        Ok(())
    }
}
