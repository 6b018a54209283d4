//! Exit watcher.
//!
//! Waits for an exec process and records its exit code on the session.

use crate::service::exec::exec_handle::{ExecHandle, ExitStatus};
use crate::service::exec::state::ExecSession;
use std::sync::Arc;
use tracing::{info, warn};

/// Start the exit watcher for a freshly launched process.
///
/// Once the process is gone the session moves to `Exited`, which also ends
/// any attached output stream after its drain grace.
pub(super) fn start_exit_watcher(session: Arc<ExecSession>, handle: ExecHandle) {
    let mut child = handle.into_child();

    tokio::spawn(async move {
        let exit_code = match child.wait().await {
            Ok(status) => ExitStatus::from(status).exit_code(),
            Err(e) => {
                warn!(exec_id = %session.id(), error = %e, "failed to wait for exec process");
                -1
            }
        };

        if let Err(e) = session.mark_exited(exit_code) {
            warn!(exec_id = %session.id(), error = %e, "exit recorded twice");
        }
        session.release_io().await;

        info!(exec_id = %session.id(), exit_code, "exec process exited");
    });
}
