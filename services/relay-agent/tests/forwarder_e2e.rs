//! End-to-end forwarder supervision against real processes.
//!
//! A shell script stands in for socat: `pgrep -a` sees its command line, so
//! the probe finds it by the `tcp-listen:` argument exactly as it would a real
//! forwarder. Scripts are written before anything is spawned; executing a file
//! another thread still has open for writing fails with ETXTBSY.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::killpg;
use nix::unistd::Pid;
use tailrelay_agent::caddy::MockAdmin;
use tailrelay_agent::forwarder::{
    ForwarderError, PgrepProbe, ProbeStatus, ProcessProbe, RelayHandle, RelayRuntime,
    SocatSupervisor, StopOutcome, SupervisorConfig,
};
use tailrelay_agent::state::StateStore;
use tailrelay_agent::{OnCreate, Reconciler, ReconcilerConfig, RelaySpec, RelayStatus};

const LISTEN_PORT: u16 = 39517;

fn pgrep_available() -> bool {
    std::process::Command::new("pgrep")
        .arg("-V")
        .output()
        .is_ok()
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn supervisor(bin: &Path) -> (Arc<SocatSupervisor>, Arc<PgrepProbe>) {
    supervisor_with_log(bin, None)
}

fn supervisor_with_log(
    bin: &Path,
    stderr_log: Option<PathBuf>,
) -> (Arc<SocatSupervisor>, Arc<PgrepProbe>) {
    let probe = Arc::new(PgrepProbe::new(bin));
    let supervisor = Arc::new(SocatSupervisor::new(
        SupervisorConfig {
            forwarder_bin: bin.to_path_buf(),
            spawn_settle: Duration::from_millis(200),
            stderr_log,
            ..SupervisorConfig::default()
        },
        probe.clone(),
    ));
    (supervisor, probe)
}

async fn wait_group_gone(pgid: u32) -> bool {
    for _ in 0..40 {
        if killpg(Pid::from_raw(pgid as i32), None) == Err(Errno::ESRCH) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_forwarder_lifecycle_with_real_processes() {
    if !pgrep_available() {
        eprintln!("pgrep not available, skipping");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let looping = write_script(
        dir.path(),
        "fake-socat",
        "#!/bin/sh\nwhile true; do sleep 1; done\n",
    );
    let failing = write_script(
        dir.path(),
        "broken-socat",
        "#!/bin/sh\necho 'E bind: Address already in use' >&2\nexit 1\n",
    );

    // Running forwarder through the reconciler.
    let (runtime, probe) = supervisor(&looping);
    assert_eq!(probe.process_name(), "fake-socat");
    let reconciler = Reconciler::new(
        Arc::new(StateStore::open_in_memory().unwrap()),
        Arc::new(MockAdmin::new()),
        runtime.clone(),
        probe.clone(),
        ReconcilerConfig {
            stop_grace: Duration::from_secs(5),
        },
    );

    let relay = reconciler
        .create_relay(RelaySpec::new(LISTEN_PORT, "10.0.0.5", 80), OnCreate::Start)
        .await
        .unwrap();
    assert_eq!(relay.last_known_status, RelayStatus::Running);

    let ProbeStatus::Running(pid) = runtime.probe_status(LISTEN_PORT).await.unwrap() else {
        panic!("forwarder on {LISTEN_PORT} not found by the probe");
    };
    assert_eq!(probe.owner_of(LISTEN_PORT).await.unwrap(), Some(pid));

    // A second start finds the live process instead of spawning another.
    let again = reconciler.start_relay(relay.id).await.unwrap();
    assert_eq!(again.last_known_status, RelayStatus::Running);
    assert_eq!(probe.find_owners().await.unwrap().len(), 1);

    let stopped = reconciler.stop_relay(relay.id).await.unwrap();
    assert_eq!(stopped.last_known_status, RelayStatus::Stopped);
    assert_eq!(
        runtime.probe_status(LISTEN_PORT).await.unwrap(),
        ProbeStatus::Stopped
    );
    assert!(wait_group_gone(pid).await, "process group {pid} survived stop");

    // A forwarder that dies during startup reports its stderr.
    let (broken, _) = supervisor(&failing);
    let err = broken
        .start(&RelaySpec::new(LISTEN_PORT + 1, "10.0.0.5", 80))
        .await
        .unwrap_err();
    match err {
        ForwarderError::SpawnFailed(msg) => {
            assert!(msg.contains("Address already in use"), "{msg}")
        }
        other => panic!("expected SpawnFailed, got {other:?}"),
    }

    // A missing executable is distinguished from a failed spawn.
    let (missing, _) = supervisor(&dir.path().join("no-such-socat"));
    let err = missing
        .start(&RelaySpec::new(LISTEN_PORT + 2, "10.0.0.5", 80))
        .await
        .unwrap_err();
    assert!(matches!(err, ForwarderError::BinaryMissing(_)), "{err:?}");
}

#[tokio::test]
async fn test_forwarder_ignoring_sigterm_is_killed() {
    if !pgrep_available() {
        eprintln!("pgrep not available, skipping");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let stubborn = write_script(
        dir.path(),
        "stubborn-socat",
        "#!/bin/sh\ntrap '' TERM\nwhile true; do sleep 1; done\n",
    );
    let port = LISTEN_PORT + 10;
    let (runtime, _) = supervisor(&stubborn);

    let handle = runtime
        .start(&RelaySpec::new(port, "10.0.0.5", 80))
        .await
        .unwrap();

    let grace = Duration::from_millis(300);
    let started = Instant::now();
    let outcome = runtime.stop(&handle, grace).await.unwrap();
    assert!(started.elapsed() >= grace);
    assert!(
        matches!(outcome, StopOutcome::Exited { forced: true, .. }),
        "{outcome:?}"
    );
    assert!(wait_group_gone(handle.pid).await, "process group {} survived", handle.pid);
    assert_eq!(runtime.probe_status(port).await.unwrap(), ProbeStatus::Stopped);
}

#[tokio::test]
async fn test_stop_forwarder_spawned_by_previous_supervisor() {
    if !pgrep_available() {
        eprintln!("pgrep not available, skipping");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let looping = write_script(
        dir.path(),
        "orphan-socat",
        "#!/bin/sh\nwhile true; do sleep 1; done\n",
    );
    let port = LISTEN_PORT + 20;

    let (first, _) = supervisor(&looping);
    let spawned = first
        .start(&RelaySpec::new(port, "10.0.0.5", 80))
        .await
        .unwrap();

    // A fresh instance has no cached child and must find the process itself.
    let (second, probe) = supervisor(&looping);
    let ProbeStatus::Running(pid) = second.probe_status(port).await.unwrap() else {
        panic!("forwarder on {port} not found by a fresh supervisor");
    };
    assert_eq!(pid, spawned.pid);

    let handle = RelayHandle {
        listening_port: port,
        pid,
    };
    let outcome = second.stop(&handle, Duration::from_secs(5)).await.unwrap();
    assert!(matches!(outcome, StopOutcome::Gone { .. }), "{outcome:?}");
    assert!(wait_group_gone(pid).await, "process group {pid} survived");
    assert_eq!(probe.owner_of(port).await.unwrap(), None);
}

#[tokio::test]
async fn test_startup_failure_read_from_stderr_log() {
    let dir = tempfile::tempdir().unwrap();
    let failing = write_script(
        dir.path(),
        "logged-socat",
        "#!/bin/sh\necho 'E bind: Permission denied' >&2\nexit 1\n",
    );
    let log = dir.path().join("forwarders.log");
    std::fs::write(&log, "earlier output\n").unwrap();

    let (runtime, _) = supervisor_with_log(&failing, Some(log.clone()));
    let err = runtime
        .start(&RelaySpec::new(LISTEN_PORT + 30, "10.0.0.5", 80))
        .await
        .unwrap_err();
    match err {
        ForwarderError::SpawnFailed(msg) => {
            assert!(msg.contains("Permission denied"), "{msg}");
            assert!(!msg.contains("earlier output"), "{msg}");
        }
        other => panic!("expected SpawnFailed, got {other:?}"),
    }

    let contents = std::fs::read_to_string(&log).unwrap();
    assert!(contents.starts_with("earlier output"));
    assert!(contents.contains("Permission denied"));
}
