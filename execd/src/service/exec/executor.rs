//! Executor trait and implementations.
//!
//! Provides the abstraction for spawning exec processes:
//! - NamespaceExecutor: joins the container's namespaces, switches to the
//!   resolved identity and execs the command
//!
//! The pid namespace cannot be entered by the process itself: `setns` on it
//! only moves the caller's future children. A short-lived spawn thread joins
//! it and forks the process from there.

use crate::container::{ContainerRecord, Platform};
use crate::service::exec::exec_handle::{
    ExecHandle, InputSink, OutputStream, ProcessStdio, PtyController,
};
use crate::service::exec::launch::LaunchSpec;
use async_trait::async_trait;
use execd_shared::constants::exit_codes::{CANNOT_EXECUTE, COMMAND_NOT_FOUND};
use execd_shared::errors::ExecdError;
use nix::sched::CloneFlags;
use std::ffi::CString;
use std::fs::File;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Namespaces the forked child joins itself, in join order. The mount
/// namespace goes last so the other `/proc/<pid>/ns` handles are opened
/// from the host view.
const NAMESPACES: &[(&str, CloneFlags)] = &[
    ("cgroup", CloneFlags::CLONE_NEWCGROUP),
    ("ipc", CloneFlags::CLONE_NEWIPC),
    ("uts", CloneFlags::CLONE_NEWUTS),
    ("net", CloneFlags::CLONE_NEWNET),
    ("mnt", CloneFlags::CLONE_NEWNS),
];

/// A launch that never produced a running process.
///
/// Carries the exit code recorded on the session.
#[derive(Debug)]
pub struct SpawnError {
    pub exit_code: i32,
    pub error: ExecdError,
}

impl SpawnError {
    pub fn cannot_execute(error: ExecdError) -> Self {
        Self {
            exit_code: CANNOT_EXECUTE,
            error,
        }
    }

    fn from_io(program: &str, err: std::io::Error) -> Self {
        let exit_code = if err.kind() == std::io::ErrorKind::NotFound {
            COMMAND_NOT_FOUND
        } else {
            CANNOT_EXECUTE
        };
        Self {
            exit_code,
            error: ExecdError::Launch(format!("failed to spawn '{}': {}", program, err)),
        }
    }
}

impl From<SpawnError> for ExecdError {
    fn from(err: SpawnError) -> Self {
        err.error
    }
}

/// Executor spawns processes.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Spawn the process described by `spec` inside `container`.
    async fn spawn(
        &self,
        spec: &LaunchSpec,
        container: &ContainerRecord,
    ) -> Result<ExecHandle, SpawnError>;
}

/// Runs exec processes in the namespaces of a container's init process.
///
/// Containers without a pid share the daemon's namespaces.
#[derive(Clone, Copy, Debug, Default)]
pub struct NamespaceExecutor;

#[async_trait]
impl Executor for NamespaceExecutor {
    async fn spawn(
        &self,
        spec: &LaunchSpec,
        container: &ContainerRecord,
    ) -> Result<ExecHandle, SpawnError> {
        if container.platform == Platform::Windows {
            return Err(SpawnError::cannot_execute(ExecdError::Launch(format!(
                "container {} runs a windows platform this launcher cannot enter",
                container.id
            ))));
        }

        let (namespaces, pid_namespace) = match container.pid {
            Some(pid) => {
                let namespaces = open_namespaces(pid).map_err(SpawnError::cannot_execute)?;
                let pid_namespace =
                    open_pid_namespace(pid).map_err(SpawnError::cannot_execute)?;
                (namespaces, pid_namespace)
            }
            None => (Vec::new(), None),
        };

        let setup = ChildSetup::new(spec, namespaces).map_err(SpawnError::cannot_execute)?;

        debug!(
            container_id = %container.id,
            program = %spec.program(),
            tty = spec.tty,
            uid = spec.identity.uid,
            gid = spec.identity.gid,
            pid_namespace = pid_namespace.is_some(),
            "spawning exec process"
        );

        match pid_namespace {
            Some(pid_ns) => {
                let spec = spec.clone();
                spawn_in_pid_namespace(pid_ns, move || spawn_process(&spec, setup)).await
            }
            None => spawn_process(spec, setup),
        }
    }
}

fn spawn_process(spec: &LaunchSpec, setup: ChildSetup) -> Result<ExecHandle, SpawnError> {
    if spec.tty {
        spawn_with_pty(spec, setup)
    } else {
        spawn_with_pipes(spec, setup)
    }
}

/// Run `spawn` on a fresh thread that has joined `pid_ns` first.
///
/// The thread exits right after the fork, so no other process the daemon
/// spawns lands in the container's pid namespace.
async fn spawn_in_pid_namespace<F>(pid_ns: File, spawn: F) -> Result<ExecHandle, SpawnError>
where
    F: FnOnce() -> Result<ExecHandle, SpawnError> + Send + 'static,
{
    let runtime = tokio::runtime::Handle::current();
    let (tx, rx) = tokio::sync::oneshot::channel();

    std::thread::Builder::new()
        .name("execd-spawn".to_string())
        .spawn(move || {
            let _runtime = runtime.enter();
            let result = nix::sched::setns(&pid_ns, CloneFlags::CLONE_NEWPID)
                .map_err(|e| {
                    SpawnError::cannot_execute(ExecdError::Launch(format!(
                        "failed to join pid namespace: {}",
                        e
                    )))
                })
                .and_then(|()| spawn());
            let _ = tx.send(result);
        })
        .map_err(|e| {
            SpawnError::cannot_execute(ExecdError::Internal(format!(
                "failed to start spawn thread: {}",
                e
            )))
        })?;

    rx.await.map_err(|_| {
        SpawnError::cannot_execute(ExecdError::Internal(
            "spawn thread ended without a result".into(),
        ))
    })?
}

/// Everything the child does between fork and exec.
struct ChildSetup {
    namespaces: Vec<(File, CloneFlags)>,
    working_dir: CString,
    uid: nix::unistd::Uid,
    gid: nix::unistd::Gid,
    groups: Vec<nix::unistd::Gid>,
    switch_identity: bool,
    controlling_tty: bool,
}

impl ChildSetup {
    fn new(spec: &LaunchSpec, namespaces: Vec<(File, CloneFlags)>) -> Result<Self, ExecdError> {
        use nix::unistd::{getegid, geteuid, getgid, getuid, Gid, Uid};

        let working_dir = CString::new(spec.working_dir.as_str()).map_err(|_| {
            ExecdError::InvalidArgument(format!(
                "working directory contains a NUL byte: {:?}",
                spec.working_dir
            ))
        })?;

        let uid = Uid::from_raw(spec.identity.uid);
        let gid = Gid::from_raw(spec.identity.gid);

        // Without privileges the only identity we can run as is our own.
        let switch_identity = geteuid().is_root()
            || uid != getuid()
            || uid != geteuid()
            || gid != getgid()
            || gid != getegid();

        Ok(Self {
            namespaces,
            working_dir,
            uid,
            gid,
            groups: spec
                .identity
                .additional_gids
                .iter()
                .copied()
                .map(Gid::from_raw)
                .collect(),
            switch_identity,
            controlling_tty: false,
        })
    }

    /// Runs in the forked child; only async-signal-safe calls.
    fn apply(&self) -> std::io::Result<()> {
        use nix::unistd::{chdir, setgid, setgroups, setsid, setuid};

        if self.controlling_tty {
            setsid()?;
            // SAFETY: fd 0 is the pty slave installed by the spawn.
            if unsafe { nix::libc::ioctl(0, nix::libc::TIOCSCTTY, 0) } == -1 {
                return Err(std::io::Error::last_os_error());
            }
        }

        for (ns, flag) in &self.namespaces {
            nix::sched::setns(ns, *flag)?;
        }

        chdir(self.working_dir.as_c_str())?;

        if self.switch_identity {
            setgroups(&self.groups)?;
            setgid(self.gid)?;
            setuid(self.uid)?;
        }

        Ok(())
    }
}

/// Open the namespace handles of `pid` that differ from our own.
fn open_namespaces(pid: i32) -> Result<Vec<(File, CloneFlags)>, ExecdError> {
    let proc_dir = format!("/proc/{}", pid);
    if !std::path::Path::new(&proc_dir).exists() {
        return Err(ExecdError::Launch(format!(
            "container process {} is gone",
            pid
        )));
    }

    let mut handles = Vec::with_capacity(NAMESPACES.len());
    for (name, flag) in NAMESPACES {
        let target = format!("{}/ns/{}", proc_dir, name);
        if same_namespace(&target, &format!("/proc/self/ns/{}", name)) {
            continue;
        }
        match File::open(&target) {
            Ok(file) => handles.push((file, *flag)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(namespace = %name, "namespace not supported by kernel, skipping");
            }
            Err(e) => {
                return Err(ExecdError::Launch(format!(
                    "failed to open {}: {}",
                    target, e
                )))
            }
        }
    }
    Ok(handles)
}

/// Open the pid namespace of `pid` unless it is our own.
fn open_pid_namespace(pid: i32) -> Result<Option<File>, ExecdError> {
    let target = format!("/proc/{}/ns/pid", pid);
    if same_namespace(&target, "/proc/self/ns/pid") {
        return Ok(None);
    }
    File::open(&target)
        .map(Some)
        .map_err(|e| ExecdError::Launch(format!("failed to open {}: {}", target, e)))
}

fn same_namespace(a: &str, b: &str) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (std::fs::metadata(a), std::fs::metadata(b)) {
        (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
        _ => false,
    }
}

fn build_command(spec: &LaunchSpec, setup: ChildSetup) -> Command {
    let mut cmd = Command::new(spec.program());
    cmd.args(&spec.argv[1..]);

    cmd.env_clear();
    for entry in &spec.env {
        if let Some((key, value)) = entry.split_once('=') {
            cmd.env(key, value);
        }
    }

    // SAFETY: `apply` only makes async-signal-safe calls.
    unsafe {
        cmd.pre_exec(move || setup.apply());
    }

    cmd
}

fn stdio_for(attached: bool) -> Stdio {
    if attached {
        Stdio::piped()
    } else {
        Stdio::null()
    }
}

/// Spawn process with pipes (standard mode).
fn spawn_with_pipes(spec: &LaunchSpec, setup: ChildSetup) -> Result<ExecHandle, SpawnError> {
    let mut cmd = build_command(spec, setup);
    cmd.stdin(stdio_for(spec.stdin));
    cmd.stdout(stdio_for(spec.stdout));
    cmd.stderr(stdio_for(spec.stderr));

    let mut child = cmd
        .spawn()
        .map_err(|e| SpawnError::from_io(spec.program(), e))?;

    let pid = child.id().ok_or_else(|| {
        SpawnError::cannot_execute(ExecdError::Launch("process exited immediately".into()))
    })?;

    let stdio = ProcessStdio {
        stdin: child.stdin.take().map(InputSink::pipe),
        stdout: child.stdout.take().map(OutputStream::new),
        stderr: child.stderr.take().map(OutputStream::new),
    };

    Ok(ExecHandle::new(pid, child, stdio))
}

/// Spawn process with PTY (interactive mode).
fn spawn_with_pty(spec: &LaunchSpec, mut setup: ChildSetup) -> Result<ExecHandle, SpawnError> {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};
    use nix::pty::{openpty, OpenptyResult, Winsize};
    use std::os::fd::{AsRawFd, OwnedFd};

    let internal = |what: &str, e: &dyn std::fmt::Display| {
        SpawnError::cannot_execute(ExecdError::Internal(format!("{}: {}", what, e)))
    };

    let winsize = Winsize {
        ws_row: spec.console_size.rows,
        ws_col: spec.console_size.cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };

    let OpenptyResult { master, slave } =
        openpty(Some(&winsize), None).map_err(|e| internal("failed to create PTY", &e))?;

    // Keep the pair out of concurrently spawned children.
    for fd in [&master, &slave] {
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
            .map_err(|e| internal("failed to mark PTY close-on-exec", &e))?;
    }

    let slave_stdio = |what: &str| -> Result<Stdio, SpawnError> {
        slave
            .try_clone()
            .map(Stdio::from)
            .map_err(|e| internal(what, &e))
    };

    setup.controlling_tty = true;
    let mut cmd = build_command(spec, setup);
    cmd.stdin(slave_stdio("failed to dup PTY slave for stdin")?);
    cmd.stdout(slave_stdio("failed to dup PTY slave for stdout")?);
    cmd.stderr(slave_stdio("failed to dup PTY slave for stderr")?);

    let spawned = cmd.spawn();

    // The parent must not hold any slave descriptor, or reads on the master
    // never see the end of output.
    drop(cmd);
    drop(slave);

    let child = spawned.map_err(|e| SpawnError::from_io(spec.program(), e))?;
    let pid = child.id().ok_or_else(|| {
        SpawnError::cannot_execute(ExecdError::Launch("process exited immediately".into()))
    })?;

    let clone_master = |what: &str| -> Result<tokio::fs::File, SpawnError> {
        master
            .try_clone()
            .map(|fd: OwnedFd| tokio::fs::File::from_std(File::from(fd)))
            .map_err(|e| internal(what, &e))
    };

    let output = OutputStream::new(clone_master("failed to dup PTY master for output")?);
    let stdout = if spec.stdout || spec.stderr {
        Some(output)
    } else {
        tokio::spawn(output.discard());
        None
    };

    let stdin = if spec.stdin {
        Some(InputSink::pty(clone_master("failed to dup PTY master for input")?))
    } else {
        None
    };

    let stdio = ProcessStdio {
        stdin,
        stdout,
        stderr: None,
    };

    Ok(ExecHandle::new(pid, child, stdio).with_pty(PtyController::new(File::from(master))))
}
