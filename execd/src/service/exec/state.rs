//! Exec session state.
//!
//! A session moves `Created -> Running -> Exited` (or `Created -> Exited`
//! when the launch fails) and never backwards. The state lives in a watch
//! channel so the attach multiplexer can observe the exit.

use crate::service::exec::exec_handle::{ProcessStdio, PtyController};
use execd_shared::errors::{ExecdError, ExecdResult};
use execd_shared::{ExecConfig, ExecInspect, ProcessConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{watch, Mutex};

/// Lifecycle state of an exec session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Running { pid: u32 },
    /// `pid` is `None` when the process never launched.
    Exited { exit_code: i32, pid: Option<u32> },
}

impl SessionState {
    pub fn is_running(&self) -> bool {
        matches!(self, SessionState::Running { .. })
    }

    pub fn is_exited(&self) -> bool {
        matches!(self, SessionState::Exited { .. })
    }

    pub fn pid(&self) -> Option<u32> {
        match self {
            SessionState::Created => None,
            SessionState::Running { pid } => Some(*pid),
            SessionState::Exited { pid, .. } => *pid,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            SessionState::Exited { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            SessionState::Created => 0,
            SessionState::Running { .. } => 1,
            SessionState::Exited { .. } => 2,
        }
    }
}

/// Where the process stdio currently lives.
enum StdioSlot {
    /// Not started yet.
    Pending,
    /// Started detached; waiting for one attach.
    Parked(ProcessStdio),
    /// Handed to a connection.
    Claimed,
}

/// One exec session.
///
/// Immutable identity and config plus the mutable lifecycle. Shared as
/// `Arc<ExecSession>` between the registry, the exit watcher and
/// connections.
pub struct ExecSession {
    id: String,
    container_id: String,
    config: ExecConfig,
    state: watch::Sender<SessionState>,
    start_claimed: AtomicBool,
    stdio: Mutex<StdioSlot>,
    pty: Mutex<Option<PtyController>>,
}

impl ExecSession {
    pub(super) fn new(id: String, container_id: String, config: ExecConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Created);
        Self {
            id,
            container_id,
            config,
            state,
            start_claimed: AtomicBool::new(false),
            stdio: Mutex::new(StdioSlot::Pending),
            pty: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    /// Current state snapshot.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Observe state changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Claim the right to start. Succeeds exactly once per session.
    pub(super) fn claim_start(&self) -> ExecdResult<()> {
        self.start_claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| ExecdError::InvalidState(format!("exec {} has already been started", self.id)))
    }

    pub(super) fn mark_running(&self, pid: u32) -> ExecdResult<()> {
        self.advance(SessionState::Running { pid })
    }

    /// Record the exit code. Keeps the pid of a running process.
    pub(super) fn mark_exited(&self, exit_code: i32) -> ExecdResult<()> {
        let pid = self.state().pid();
        self.advance(SessionState::Exited { exit_code, pid })
    }

    fn advance(&self, next: SessionState) -> ExecdResult<()> {
        let mut current = SessionState::Created;
        let changed = self.state.send_if_modified(|state| {
            current = *state;
            if next.rank() > state.rank() {
                *state = next;
                true
            } else {
                false
            }
        });

        if changed {
            Ok(())
        } else {
            Err(ExecdError::InvalidState(format!(
                "exec {}: cannot move from {:?} to {:?}",
                self.id, current, next
            )))
        }
    }

    /// Keep the stdio of a detached start for a later attach.
    ///
    /// Dropped instead when the process is already gone: nobody can attach
    /// to an exited session.
    pub(super) async fn park_stdio(&self, stdio: ProcessStdio) {
        let mut slot = self.stdio.lock().await;
        *slot = if self.state().is_exited() {
            StdioSlot::Claimed
        } else {
            StdioSlot::Parked(stdio)
        };
    }

    /// Whether stdio is parked waiting for an attach.
    #[cfg(test)]
    pub(super) async fn has_parked_stdio(&self) -> bool {
        matches!(*self.stdio.lock().await, StdioSlot::Parked(_))
    }

    /// Record that the stdio went straight to the starting connection.
    pub(super) async fn mark_stdio_claimed(&self) {
        *self.stdio.lock().await = StdioSlot::Claimed;
    }

    /// Take the parked stdio for an attach.
    pub(super) async fn claim_stdio(&self) -> ExecdResult<ProcessStdio> {
        let mut slot = self.stdio.lock().await;

        if !self.state().is_running() {
            return Err(ExecdError::InvalidState(format!(
                "exec {} is not running",
                self.id
            )));
        }

        match std::mem::replace(&mut *slot, StdioSlot::Claimed) {
            StdioSlot::Parked(stdio) => Ok(stdio),
            StdioSlot::Claimed => Err(ExecdError::InvalidState(format!(
                "exec {} is already attached",
                self.id
            ))),
            StdioSlot::Pending => {
                *slot = StdioSlot::Pending;
                Err(ExecdError::InvalidState(format!(
                    "exec {} has not been started",
                    self.id
                )))
            }
        }
    }

    pub(super) async fn set_pty(&self, controller: PtyController) {
        *self.pty.lock().await = Some(controller);
    }

    /// Resize the session's terminal.
    pub async fn resize(&self, rows: u16, cols: u16) -> ExecdResult<()> {
        if !self.config.tty {
            return Err(ExecdError::InvalidState(format!(
                "exec {} has no terminal",
                self.id
            )));
        }

        let pty = self.pty.lock().await;
        match pty.as_ref() {
            Some(controller) if self.state().is_running() => controller.resize(rows, cols),
            _ => Err(ExecdError::InvalidState(format!(
                "exec {} is not running",
                self.id
            ))),
        }
    }

    /// Drop descriptors nobody can use once the process is gone.
    pub(super) async fn release_io(&self) {
        self.pty.lock().await.take();
        let mut slot = self.stdio.lock().await;
        if matches!(*slot, StdioSlot::Parked(_)) {
            *slot = StdioSlot::Claimed;
        }
    }

    /// Read-only view for inspect.
    pub fn inspect(&self) -> ExecInspect {
        let state = self.state();
        let (entrypoint, arguments) = match self.config.cmd.split_first() {
            Some((first, rest)) => (first.clone(), rest.to_vec()),
            None => (String::new(), Vec::new()),
        };

        ExecInspect {
            id: self.id.clone(),
            container_id: self.container_id.clone(),
            running: state.is_running(),
            exit_code: state.exit_code(),
            pid: state.pid(),
            open_stdin: self.config.attach_stdin,
            open_stdout: self.config.attach_stdout,
            open_stderr: self.config.attach_stderr,
            process_config: ProcessConfig {
                entrypoint,
                arguments,
                tty: self.config.tty,
                user: self.config.user.clone(),
                working_dir: self.config.working_dir.clone(),
            },
        }
    }
}
