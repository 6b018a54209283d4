//! OCI runtime state lookup.
//!
//! Reads `<state_root>/<id>/state.json` as written by an OCI runtime
//! (`id`, `status`, `pid`, `bundle`) and the bundle's `config.json` for the
//! container defaults.

use super::{ContainerProvider, ContainerRecord, ContainerUser, Platform};
use async_trait::async_trait;
use execd_shared::errors::{ExecdError, ExecdResult};
use oci_spec::runtime::Spec;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const STATE_FILE: &str = "state.json";
const CONFIG_FILE: &str = "config.json";
const STATUS_RUNNING: &str = "running";

/// OCI runtime state document.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RuntimeState {
    id: String,
    status: String,
    #[serde(default)]
    pid: Option<i32>,
    bundle: PathBuf,
}

/// Container provider backed by an OCI runtime state directory.
pub struct OciStateProvider {
    state_root: PathBuf,
}

impl OciStateProvider {
    pub fn new(state_root: impl Into<PathBuf>) -> Self {
        Self {
            state_root: state_root.into(),
        }
    }
}

#[async_trait]
impl ContainerProvider for OciStateProvider {
    async fn lookup(&self, reference: &str) -> Option<ContainerRecord> {
        if !is_valid_reference(reference) {
            debug!(reference = %reference, "rejecting malformed container reference");
            return None;
        }

        let state_dir = self.state_root.join(reference);
        if !state_dir.join(STATE_FILE).exists() {
            return None;
        }

        let reference = reference.to_string();
        let result = tokio::task::spawn_blocking(move || load_record(&state_dir)).await;

        match result {
            Ok(Ok(record)) => Some(record),
            Ok(Err(e)) => {
                warn!(container_id = %reference, error = %e, "unreadable container state");
                None
            }
            Err(e) => {
                warn!(container_id = %reference, error = %e, "container lookup task failed");
                None
            }
        }
    }
}

fn is_valid_reference(reference: &str) -> bool {
    !reference.is_empty()
        && reference != "."
        && reference != ".."
        && !reference.contains('/')
        && !reference.contains('\0')
}

fn load_record(state_dir: &Path) -> ExecdResult<ContainerRecord> {
    let raw = std::fs::read(state_dir.join(STATE_FILE))?;
    let state: RuntimeState = serde_json::from_slice(&raw)
        .map_err(|e| ExecdError::Internal(format!("invalid {}: {}", STATE_FILE, e)))?;

    let spec = Spec::load(state.bundle.join(CONFIG_FILE)).map_err(|e| {
        ExecdError::Internal(format!(
            "failed to load {} from bundle {}: {}",
            CONFIG_FILE,
            state.bundle.display(),
            e
        ))
    })?;

    let live_pid = state.pid.filter(|pid| pid_alive(*pid));
    let running = state.status == STATUS_RUNNING && live_pid.is_some();

    let process = spec.process().as_ref();
    let env = process
        .and_then(|p| p.env().clone())
        .unwrap_or_default();
    let working_dir = process
        .map(|p| p.cwd().to_string_lossy().into_owned())
        .filter(|cwd| !cwd.is_empty())
        .unwrap_or_else(|| "/".to_string());
    let user = process
        .map(|p| {
            let user = p.user();
            ContainerUser {
                uid: user.uid(),
                gid: user.gid(),
                additional_gids: user.additional_gids().clone().unwrap_or_default(),
            }
        })
        .unwrap_or_default();

    let platform = if spec.windows().is_some() {
        Platform::Windows
    } else {
        Platform::Linux
    };

    // The live init process sees the fully mounted root; the bundle path is
    // only the lower layer when nothing runs.
    let rootfs = match live_pid {
        Some(pid) => PathBuf::from(format!("/proc/{}/root", pid)),
        None => {
            let root = spec
                .root()
                .as_ref()
                .map(|r| r.path().clone())
                .unwrap_or_else(|| PathBuf::from("rootfs"));
            if root.is_absolute() {
                root
            } else {
                state.bundle.join(root)
            }
        }
    };

    debug!(
        container_id = %state.id,
        status = %state.status,
        pid = ?live_pid,
        "loaded container state"
    );

    Ok(ContainerRecord {
        id: state.id,
        running,
        pid: live_pid,
        rootfs,
        env,
        working_dir,
        user,
        platform,
    })
}

fn pid_alive(pid: i32) -> bool {
    use procfs::process::{ProcState, Process};

    match Process::new(pid).and_then(|p| p.stat()) {
        Ok(stat) => !matches!(stat.state(), Ok(ProcState::Zombie) | Ok(ProcState::Dead)),
        Err(_) => false,
    }
}
