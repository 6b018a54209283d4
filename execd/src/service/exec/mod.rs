//! Exec session service.
//!
//! Creates, starts, attaches to and inspects exec sessions: extra processes
//! launched inside already-running containers.
//!
//! ## Architecture
//!
//! - **Service Layer** (mod.rs): the five session operations
//! - **State Layer** (registry.rs, state.rs): sessions and their lifecycle
//! - **Launch Layer** (launch.rs, executor.rs, exec_handle.rs): resolving and
//!   spawning the process
//! - **Stream Layer** (attach.rs): wiring a connection to process stdio
//! - **Lifecycle Layer** (reaper.rs): recording the exit

pub mod attach;
pub mod exec_handle;
pub mod executor;
pub mod launch;
mod reaper;
pub mod registry;
pub mod state;

pub use attach::{AttachMode, Attachment};
pub use executor::{Executor, NamespaceExecutor, SpawnError};
pub use launch::LaunchSpec;
pub use registry::SessionRegistry;
pub use state::{ExecSession, SessionState};

use crate::container::{ContainerProvider, ContainerRecord, UserDb};
use execd_shared::constants::daemon::DEFAULT_DRAIN_GRACE_MS;
use execd_shared::errors::{ExecdError, ExecdResult};
use execd_shared::{ExecConfig, ExecInspect};
use exec_handle::ExecHandle;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Exec session service.
pub struct ExecService {
    registry: SessionRegistry,
    containers: Arc<dyn ContainerProvider>,
    executor: Arc<dyn Executor>,
    drain_grace: Duration,
}

impl ExecService {
    pub fn new(containers: Arc<dyn ContainerProvider>) -> Self {
        Self {
            registry: SessionRegistry::new(),
            containers,
            executor: Arc::new(NamespaceExecutor),
            drain_grace: Duration::from_millis(DEFAULT_DRAIN_GRACE_MS),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }

    /// How long attached output keeps draining after the process exited.
    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    /// Register a new session in `Created` state.
    pub async fn create(&self, container: &str, config: ExecConfig) -> ExecdResult<String> {
        let record = self.running_container(container).await?;
        launch::validate(&config, record.platform)?;

        let session = self.registry.create(&record.id, config).await;

        let sessions = self.registry.len().await;
        info!(
            exec_id = %session.id(),
            container_id = %record.id,
            cmd = ?session.config().cmd,
            tty = session.config().tty,
            sessions,
            "exec session created"
        );

        Ok(session.id().to_string())
    }

    pub async fn inspect(&self, exec_id: &str) -> ExecdResult<ExecInspect> {
        Ok(self.registry.get(exec_id).await?.inspect())
    }

    /// Launch the session's process.
    ///
    /// With `attach` the stdio comes back as an [`Attachment`] for the
    /// calling connection; otherwise it is parked for one later
    /// [`attach`](Self::attach).
    pub async fn start(&self, exec_id: &str, attach: bool) -> ExecdResult<Option<Attachment>> {
        let session = self.registry.get(exec_id).await?;

        if session.state() != SessionState::Created {
            return Err(ExecdError::InvalidState(format!(
                "exec {} has already been started",
                exec_id
            )));
        }

        // Checked before claiming: a stopped container leaves the session
        // startable.
        let container = self.running_container(session.container_id()).await?;
        session.claim_start()?;

        let mut handle = match self.launch(&session, &container).await {
            Ok(handle) => handle,
            Err(failure) => {
                warn!(
                    exec_id = %exec_id,
                    exit_code = failure.exit_code,
                    error = %failure.error,
                    "exec launch failed"
                );
                if let Err(e) = session.mark_exited(failure.exit_code) {
                    debug!(exec_id = %exec_id, error = %e, "launch failure not recorded");
                }
                return Err(failure.into());
            }
        };

        let pid = handle.pid();
        session.mark_running(pid)?;
        info!(exec_id = %exec_id, pid, "exec process started");

        if let Some(controller) = handle.take_pty() {
            session.set_pty(controller).await;
        }
        let stdio = handle.take_stdio();

        // The slot is settled before the watcher can release it.
        let attachment = if attach {
            session.mark_stdio_claimed().await;
            Some(self.attachment(&session, stdio))
        } else {
            session.park_stdio(stdio).await;
            None
        };
        reaper::start_exit_watcher(session.clone(), handle);

        Ok(attachment)
    }

    /// Attach to a session started detached.
    pub async fn attach(&self, exec_id: &str) -> ExecdResult<Attachment> {
        let session = self.registry.get(exec_id).await?;
        let stdio = session.claim_stdio().await?;
        debug!(exec_id = %exec_id, "attached to running exec");
        Ok(self.attachment(&session, stdio))
    }

    pub async fn resize(&self, exec_id: &str, rows: u16, cols: u16) -> ExecdResult<()> {
        let session = self.registry.get(exec_id).await?;
        session.resize(rows, cols).await?;
        debug!(exec_id = %exec_id, rows, cols, "exec tty resized");
        Ok(())
    }

    async fn running_container(&self, reference: &str) -> ExecdResult<ContainerRecord> {
        let record = self
            .containers
            .lookup(reference)
            .await
            .ok_or_else(|| ExecdError::NotFound(format!("no such container: {}", reference)))?;

        if !record.running {
            return Err(ExecdError::InvalidState(format!(
                "container {} is not running",
                record.id
            )));
        }
        Ok(record)
    }

    async fn launch(
        &self,
        session: &ExecSession,
        container: &ContainerRecord,
    ) -> Result<ExecHandle, SpawnError> {
        let users = UserDb::load(&container.rootfs).map_err(SpawnError::cannot_execute)?;
        let spec = LaunchSpec::resolve(session.config(), container, &users)
            .map_err(SpawnError::cannot_execute)?;
        self.executor.spawn(&spec, container).await
    }

    fn attachment(&self, session: &ExecSession, stdio: exec_handle::ProcessStdio) -> Attachment {
        Attachment::new(
            session.id(),
            session.config().tty,
            stdio,
            session.subscribe(),
            self.drain_grace,
        )
    }
}
