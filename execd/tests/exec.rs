//! Integration tests for exec sessions (create, start, attach, inspect).
//!
//! Sessions run host binaries in a container that shares the test
//! process's namespaces.

use execd_shared::{ErrorKind, ExecConfig, ExecdError};
use execd_test_utils::{
    fake_rootfs, host_container, is_root, NamespacedInit, TestDaemon, CONTAINER_ID,
};
use std::collections::HashSet;
use std::time::Duration;

const OUTPUT_LIMIT: Duration = Duration::from_secs(3);
const EXIT_LIMIT: Duration = Duration::from_secs(5);

fn sh(script: &str) -> ExecConfig {
    ExecConfig::new(["sh", "-c", script])
}

// ============================================================================
// STDIO TESTS
// ============================================================================

#[tokio::test]
async fn close_write_ends_input_but_keeps_output() {
    let daemon = TestDaemon::start().await;
    let config = sh("cat && echo closeIO")
        .attach_stdin(true)
        .attach_stdout(true)
        .attach_stderr(true);
    let id = daemon.client.create(CONTAINER_ID, config).await.unwrap();

    let mut attached = daemon.client.start_attach(&id).await.unwrap();
    assert!(!attached.tty());
    attached.close_write().await.unwrap();

    let output = attached.output_timeout(OUTPUT_LIMIT).await.unwrap();
    assert!(
        output.stdout_lossy().contains("closeIO"),
        "stdout was {:?}",
        output.stdout_lossy()
    );

    let view = daemon.wait_exited(&id, EXIT_LIMIT).await;
    assert_eq!(view.exit_code, Some(0));
}

#[tokio::test]
async fn stdin_is_delivered_before_close() {
    let daemon = TestDaemon::start().await;
    let config = ExecConfig::new(["cat"])
        .attach_stdin(true)
        .attach_stdout(true);
    let id = daemon.client.create(CONTAINER_ID, config).await.unwrap();

    let mut attached = daemon.client.start_attach(&id).await.unwrap();
    attached.write_stdin(b"hello from stdin\n").await.unwrap();
    attached.close_write().await.unwrap();

    let output = attached.output_timeout(OUTPUT_LIMIT).await.unwrap();
    assert_eq!(output.stdout_lossy(), "hello from stdin\n");
}

#[tokio::test]
async fn stdout_and_stderr_are_demultiplexed() {
    let daemon = TestDaemon::start().await;
    let config = sh("echo out; echo err >&2")
        .attach_stdout(true)
        .attach_stderr(true);
    let id = daemon.client.create(CONTAINER_ID, config).await.unwrap();

    let output = daemon
        .client
        .start_attach(&id)
        .await
        .unwrap()
        .output_timeout(OUTPUT_LIMIT)
        .await
        .unwrap();

    assert_eq!(output.stdout_lossy(), "out\n");
    assert_eq!(output.stderr_lossy(), "err\n");
}

#[tokio::test]
async fn unattached_stream_is_not_forwarded() {
    let daemon = TestDaemon::start().await;
    let config = sh("echo out; echo err >&2").attach_stdout(true);
    let id = daemon.client.create(CONTAINER_ID, config).await.unwrap();

    let output = daemon
        .client
        .start_attach(&id)
        .await
        .unwrap()
        .output_timeout(OUTPUT_LIMIT)
        .await
        .unwrap();

    assert_eq!(output.stdout_lossy(), "out\n");
    assert!(output.stderr.is_empty());
}

// ============================================================================
// TTY AND ENVIRONMENT TESTS
// ============================================================================

#[tokio::test]
async fn tty_session_sees_workdir_and_env() {
    let daemon = TestDaemon::start().await;
    let config = sh("env")
        .tty(true)
        .working_dir("/tmp")
        .env("FOO=BAR")
        .attach_stdout(true);
    let id = daemon.client.create(CONTAINER_ID, config).await.unwrap();

    let view = daemon.client.inspect(&id).await.unwrap();
    assert_eq!(view.id, id);
    assert!(view.process_config.tty);

    let attached = daemon.client.start_attach(&id).await.unwrap();
    assert!(attached.tty());
    let output = attached.output_timeout(OUTPUT_LIMIT).await.unwrap();
    let text = output.stdout_lossy();

    assert!(text.contains("PWD=/tmp"), "env output was {:?}", text);
    assert!(text.contains("FOO=BAR"), "env output was {:?}", text);
    assert!(text.contains("IMAGE_VAR=from-image"), "env output was {:?}", text);
}

#[tokio::test]
async fn env_entry_without_value_unsets_container_var() {
    let daemon = TestDaemon::start().await;
    let config = sh("env").env("IMAGE_VAR").attach_stdout(true);
    let id = daemon.client.create(CONTAINER_ID, config).await.unwrap();

    let output = daemon
        .client
        .start_attach(&id)
        .await
        .unwrap()
        .output_timeout(OUTPUT_LIMIT)
        .await
        .unwrap();
    assert!(!output.stdout_lossy().contains("IMAGE_VAR="));
}

#[tokio::test]
async fn tty_resize_is_visible_to_process() {
    let daemon = TestDaemon::start().await;
    let config = sh("sleep 0.3; stty size")
        .tty(true)
        .console_size(24, 80)
        .attach_stdout(true);
    let id = daemon.client.create(CONTAINER_ID, config).await.unwrap();

    let attached = daemon.client.start_attach(&id).await.unwrap();
    daemon.client.resize(&id, 40, 120).await.unwrap();

    let output = attached.output_timeout(OUTPUT_LIMIT).await.unwrap();
    assert!(
        output.stdout_lossy().contains("40 120"),
        "stty output was {:?}",
        output.stdout_lossy()
    );
}

#[tokio::test]
async fn tty_close_write_sends_end_of_input() {
    let daemon = TestDaemon::start().await;
    let config = ExecConfig::new(["cat"])
        .tty(true)
        .attach_stdin(true)
        .attach_stdout(true);
    let id = daemon.client.create(CONTAINER_ID, config).await.unwrap();

    let mut attached = daemon.client.start_attach(&id).await.unwrap();
    assert!(attached.tty());
    attached.write_stdin(b"typed\n").await.unwrap();
    attached.close_write().await.unwrap();

    let output = attached.output_timeout(OUTPUT_LIMIT).await.unwrap();
    assert!(
        output.stdout_lossy().contains("typed"),
        "tty output was {:?}",
        output.stdout_lossy()
    );

    let view = daemon.wait_exited(&id, EXIT_LIMIT).await;
    assert_eq!(view.exit_code, Some(0));
}

// ============================================================================
// NAMESPACE TESTS
// ============================================================================

#[tokio::test]
async fn exec_joins_container_pid_namespace() {
    if !is_root() {
        eprintln!("skipping: joining namespaces requires root");
        return;
    }
    let Some(init) = NamespacedInit::spawn() else {
        eprintln!("skipping: unshare is not available");
        return;
    };

    let daemon = TestDaemon::start().await;
    let rootfs = fake_rootfs();
    let mut record = host_container("pid-ns", rootfs.path());
    record.pid = Some(init.pid());
    daemon.containers.insert(record).await;

    let config = sh("readlink /proc/self/ns/pid; cat /proc/1/comm; echo $$").attach_stdout(true);
    let id = daemon.client.create("pid-ns", config).await.unwrap();
    let output = daemon
        .client
        .start_attach(&id)
        .await
        .unwrap()
        .output_timeout(OUTPUT_LIMIT)
        .await
        .unwrap();

    let text = output.stdout_lossy();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 3, "output was {:?}", text);

    let expected = std::fs::read_link(format!("/proc/{}/ns/pid", init.pid())).unwrap();
    assert_eq!(lines[0], expected.to_string_lossy());
    assert_eq!(lines[1], "sleep");

    let inner_pid: u32 = lines[2].parse().unwrap();
    let view = daemon.wait_exited(&id, EXIT_LIMIT).await;
    assert_eq!(view.exit_code, Some(0));
    assert_ne!(view.pid, Some(inner_pid));
}

// ============================================================================
// IDENTITY TESTS
// ============================================================================

#[tokio::test]
async fn user_spec_switches_identity() {
    if !is_root() {
        eprintln!("skipping: switching identity requires root");
        return;
    }

    let daemon = TestDaemon::start().await;
    for user in ["1:1", "daemon:daemon"] {
        let config = ExecConfig::new(["id"]).user(user).attach_stdout(true);
        let id = daemon.client.create(CONTAINER_ID, config).await.unwrap();

        let output = daemon
            .client
            .start_attach(&id)
            .await
            .unwrap()
            .output_timeout(OUTPUT_LIMIT)
            .await
            .unwrap();
        let text = output.stdout_lossy();
        assert!(text.contains("uid=1"), "id output for {} was {:?}", user, text);
        assert!(text.contains("gid=1"), "id output for {} was {:?}", user, text);
    }
}

#[tokio::test]
async fn unknown_user_fails_start() {
    let daemon = TestDaemon::start().await;
    let config = ExecConfig::new(["id"]).user("nobody-here").attach_stdout(true);
    let id = daemon.client.create(CONTAINER_ID, config).await.unwrap();

    let err = daemon.client.start_attach(&id).await.err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Identity);

    let view = daemon.client.inspect(&id).await.unwrap();
    assert!(!view.running);
    assert_eq!(view.exit_code, Some(126));
}

// ============================================================================
// LIFECYCLE TESTS
// ============================================================================

#[tokio::test]
async fn concurrent_creates_get_unique_ids() {
    let daemon = TestDaemon::start().await;

    let creates = (0..16).map(|_| {
        daemon
            .client
            .create(CONTAINER_ID, ExecConfig::new(["true"]))
    });
    let ids: Vec<String> = futures::future::join_all(creates)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let unique: HashSet<&String> = ids.iter().collect();
    assert_eq!(unique.len(), ids.len());
}

#[tokio::test]
async fn detached_start_records_exit_code() {
    let daemon = TestDaemon::start().await;
    let id = daemon
        .client
        .create(CONTAINER_ID, sh("exit 3"))
        .await
        .unwrap();

    daemon.client.start(&id).await.unwrap();
    let view = daemon.wait_exited(&id, EXIT_LIMIT).await;
    assert!(!view.running);
    assert_eq!(view.exit_code, Some(3));
    assert!(view.pid.is_some());
}

#[tokio::test]
async fn signal_exit_is_128_plus_signo() {
    let daemon = TestDaemon::start().await;
    let id = daemon
        .client
        .create(CONTAINER_ID, sh("kill -9 $$"))
        .await
        .unwrap();

    daemon.client.start(&id).await.unwrap();
    let view = daemon.wait_exited(&id, EXIT_LIMIT).await;
    assert_eq!(view.exit_code, Some(137));
}

#[tokio::test]
async fn detached_start_then_single_attach() {
    let daemon = TestDaemon::start().await;
    let config = sh("read line; echo got:$line")
        .attach_stdin(true)
        .attach_stdout(true);
    let id = daemon.client.create(CONTAINER_ID, config).await.unwrap();

    daemon.client.start(&id).await.unwrap();
    assert!(daemon.client.inspect(&id).await.unwrap().running);

    let mut attached = daemon.client.attach(&id).await.unwrap();
    let err = daemon.client.attach(&id).await.err().unwrap();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    attached.write_stdin(b"ping\n").await.unwrap();
    attached.close_write().await.unwrap();
    let output = attached.output_timeout(OUTPUT_LIMIT).await.unwrap();
    assert_eq!(output.stdout_lossy(), "got:ping\n");
}

#[tokio::test]
async fn second_start_is_rejected() {
    let daemon = TestDaemon::start().await;
    let id = daemon
        .client
        .create(CONTAINER_ID, ExecConfig::new(["true"]))
        .await
        .unwrap();

    daemon.client.start(&id).await.unwrap();
    let err = daemon.client.start(&id).await.unwrap_err();
    assert!(matches!(err, ExecdError::InvalidState(_)));
}

#[tokio::test]
async fn missing_binary_exits_127() {
    let daemon = TestDaemon::start().await;
    let config = ExecConfig::new(["/definitely/not/here"]).attach_stdout(true);
    let id = daemon.client.create(CONTAINER_ID, config).await.unwrap();

    let err = daemon.client.start_attach(&id).await.err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Launch);

    let view = daemon.client.inspect(&id).await.unwrap();
    assert!(!view.running);
    assert_eq!(view.exit_code, Some(127));
}

#[tokio::test]
async fn client_timeout_leaves_session_running() {
    let daemon = TestDaemon::start().await;
    let config = sh("sleep 1; echo late").attach_stdout(true);
    let id = daemon.client.create(CONTAINER_ID, config).await.unwrap();

    let attached = daemon.client.start_attach(&id).await.unwrap();
    let err = attached
        .read_to_end_timeout(Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecdError::Timeout(_)));

    assert!(daemon.client.inspect(&id).await.unwrap().running);
    let view = daemon.wait_exited(&id, EXIT_LIMIT).await;
    assert_eq!(view.exit_code, Some(0));
}

#[tokio::test]
async fn background_child_does_not_hold_stream_open() {
    let daemon = TestDaemon::start().await;
    let config = sh("sleep 30 & echo started").attach_stdout(true);
    let id = daemon.client.create(CONTAINER_ID, config).await.unwrap();

    let output = daemon
        .client
        .start_attach(&id)
        .await
        .unwrap()
        .output_timeout(OUTPUT_LIMIT)
        .await
        .unwrap();
    assert_eq!(output.stdout_lossy(), "started\n");
}

// ============================================================================
// ERROR CASES
// ============================================================================

#[tokio::test]
async fn create_rejects_bad_requests() {
    let daemon = TestDaemon::start().await;

    let err = daemon
        .client
        .create("no-such-container", ExecConfig::new(["true"]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = daemon
        .client
        .create(CONTAINER_ID, ExecConfig::new(Vec::<String>::new()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let err = daemon
        .client
        .create(CONTAINER_ID, ExecConfig::new(["ls"]).working_dir("relative"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[tokio::test]
async fn stopped_container_blocks_create_and_start() {
    let daemon = TestDaemon::start().await;
    let id = daemon
        .client
        .create(CONTAINER_ID, ExecConfig::new(["true"]))
        .await
        .unwrap();

    daemon.containers.set_running(CONTAINER_ID, false).await;

    let err = daemon
        .client
        .create(CONTAINER_ID, ExecConfig::new(["true"]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    let err = daemon.client.start(&id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    // The session was never claimed and starts once the container runs.
    daemon.containers.set_running(CONTAINER_ID, true).await;
    daemon.client.start(&id).await.unwrap();
    let view = daemon.wait_exited(&id, EXIT_LIMIT).await;
    assert_eq!(view.exit_code, Some(0));
}

#[tokio::test]
async fn unknown_exec_id_is_not_found() {
    let daemon = TestDaemon::start().await;

    let err = daemon.client.inspect("deadbeef").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = daemon.client.start("deadbeef").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = daemon.client.attach("deadbeef").await.err().unwrap();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
