//! Shared fixtures for execd tests.
//!
//! [`TestDaemon`] runs a real execd server on a temporary unix socket with one
//! container that shares the test process's namespaces, so exec sessions run
//! host binaries without needing a container runtime.

use execd::container::{ContainerRecord, ContainerUser, Platform, StaticContainers};
use execd::net::Listener;
use execd::{ExecClient, ExecServer, ExecService};
use execd_shared::{ExecInspect, Transport};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::oneshot;

/// Container every [`TestDaemon`] knows about.
pub const CONTAINER_ID: &str = "test-container";

/// Environment every test container starts with.
pub const CONTAINER_ENV: &[&str] = &[
    "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin",
    "IMAGE_VAR=from-image",
];

/// Output drain grace used by test daemons.
pub const TEST_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Whether the tests run with root privileges.
pub fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions.
    unsafe { libc::geteuid() == 0 }
}

fn current_ids() -> (u32, u32) {
    // SAFETY: getuid/getgid have no preconditions.
    unsafe { (libc::getuid(), libc::getgid()) }
}

/// A root filesystem holding only `/etc/passwd` and `/etc/group`.
pub fn fake_rootfs() -> TempDir {
    let dir = TempDir::new().expect("Failed to create rootfs dir");
    let etc = dir.path().join("etc");
    std::fs::create_dir_all(&etc).expect("Failed to create etc");

    let (uid, gid) = current_ids();
    let mut passwd = String::from(
        "root:x:0:0:root:/root:/bin/sh\n\
         daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin\n",
    );
    let mut group = String::from("root:x:0:\ndaemon:x:1:\n");
    if uid != 0 {
        passwd.push_str(&format!("tester:x:{}:{}::/home/tester:/bin/sh\n", uid, gid));
        group.push_str(&format!("tester:x:{}:\n", gid));
    }

    std::fs::write(etc.join("passwd"), passwd).expect("Failed to write passwd");
    std::fs::write(etc.join("group"), group).expect("Failed to write group");
    dir
}

/// A running container that shares the test process's namespaces and
/// identity.
pub fn host_container(id: &str, rootfs: &Path) -> ContainerRecord {
    let (uid, gid) = current_ids();
    ContainerRecord {
        id: id.to_string(),
        running: true,
        pid: None,
        rootfs: rootfs.to_path_buf(),
        env: CONTAINER_ENV.iter().map(|e| e.to_string()).collect(),
        working_dir: "/".to_string(),
        user: ContainerUser {
            uid,
            gid,
            additional_gids: Vec::new(),
        },
        platform: Platform::Linux,
    }
}

/// `sleep` running as pid 1 of its own pid and mount namespace, killed on
/// drop. Stands in for the init process of a real container.
pub struct NamespacedInit {
    unshare: Child,
    pid: i32,
}

impl NamespacedInit {
    /// `None` when `unshare` is missing or not permitted.
    pub fn spawn() -> Option<Self> {
        let mut unshare = Command::new("unshare")
            .args(["--pid", "--fork", "--mount-proc", "sleep", "60"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .ok()?;

        let children = format!("/proc/{0}/task/{0}/children", unshare.id());
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Ok(Some(_)) = unshare.try_wait() {
                return None;
            }

            // Ready once the forked child has mounted /proc and exec'd sleep.
            let pid = std::fs::read_to_string(&children)
                .ok()
                .and_then(|list| list.split_whitespace().next()?.parse::<i32>().ok());
            if let Some(pid) = pid {
                let comm = std::fs::read_to_string(format!("/proc/{}/comm", pid))
                    .unwrap_or_default();
                if comm.trim() == "sleep" {
                    return Some(Self { unshare, pid });
                }
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        let _ = unshare.kill();
        let _ = unshare.wait();
        None
    }

    /// Host pid of the namespace's init.
    pub fn pid(&self) -> i32 {
        self.pid
    }
}

impl Drop for NamespacedInit {
    fn drop(&mut self) {
        // SAFETY: kill has no memory preconditions.
        unsafe {
            libc::kill(self.pid, libc::SIGKILL);
        }
        let _ = self.unshare.kill();
        let _ = self.unshare.wait();
    }
}

/// An execd server on a temporary socket, stopped on drop.
pub struct TestDaemon {
    pub client: ExecClient,
    pub service: Arc<ExecService>,
    pub containers: Arc<StaticContainers>,
    shutdown: Option<oneshot::Sender<()>>,
    _rootfs: TempDir,
    _socket_dir: TempDir,
}

impl TestDaemon {
    pub async fn start() -> Self {
        let rootfs = fake_rootfs();
        let containers = Arc::new(StaticContainers::new());
        containers
            .insert(host_container(CONTAINER_ID, rootfs.path()))
            .await;

        let service = Arc::new(
            ExecService::new(containers.clone()).with_drain_grace(TEST_DRAIN_GRACE),
        );

        let socket_dir = TempDir::new().expect("Failed to create socket dir");
        let transport = Transport::unix(socket_dir.path().join("execd.sock"));
        let listener = Listener::bind(&transport)
            .await
            .expect("Failed to bind test socket");

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = ExecServer::new(service.clone());
        tokio::spawn(async move {
            let _ = server
                .serve(listener, async {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        Self {
            client: ExecClient::new(transport),
            service,
            containers,
            shutdown: Some(shutdown_tx),
            _rootfs: rootfs,
            _socket_dir: socket_dir,
        }
    }

    /// Poll inspect until the session has exited.
    pub async fn wait_exited(&self, id: &str, limit: Duration) -> ExecInspect {
        let deadline = Instant::now() + limit;
        loop {
            let view = self.client.inspect(id).await.expect("inspect failed");
            if view.exit_code.is_some() {
                return view;
            }
            assert!(
                Instant::now() < deadline,
                "exec {} still running after {:?}",
                id,
                limit
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}
