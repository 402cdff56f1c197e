//! Forwarder process supervision.
//!
//! Each forwarder is spawned as the leader of its own process group, so the
//! per-connection children socat forks are signalled together with it.
//! Stopping sends SIGTERM to the group, waits for the grace period, then
//! escalates to SIGKILL.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::{getpgid, Pid};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use super::probe::ProcessProbe;
use super::ForwarderError;
use crate::model::{RelaySpec, RelayStatus};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const STDERR_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Handle to a running forwarder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayHandle {
    pub listening_port: u16,
    pub pid: u32,
}

/// Live status of a listening port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    Running(u32),
    Stopped,
}

impl ProbeStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running(_))
    }

    pub fn pid(&self) -> Option<u32> {
        match self {
            Self::Running(pid) => Some(*pid),
            Self::Stopped => None,
        }
    }
}

impl From<ProbeStatus> for RelayStatus {
    fn from(status: ProbeStatus) -> Self {
        match status {
            ProbeStatus::Running(_) => Self::Running,
            ProbeStatus::Stopped => Self::Stopped,
        }
    }
}

/// How a stop request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// A child spawned by this supervisor exited and was reaped.
    Exited { status: ExitStatus, forced: bool },
    /// A forwarder found through the probe is gone.
    Gone { forced: bool },
    /// Nothing was running.
    AlreadyExited,
}

/// Forwarder lifecycle operations.
#[async_trait]
pub trait RelayRuntime: Send + Sync {
    /// Spawn a forwarder for `spec`.
    async fn start(&self, spec: &RelaySpec) -> Result<RelayHandle, ForwarderError>;

    /// Terminate the forwarder behind `handle`.
    async fn stop(&self, handle: &RelayHandle, grace: Duration)
        -> Result<StopOutcome, ForwarderError>;

    /// Live status of the forwarder bound to `listening_port`.
    async fn probe_status(&self, listening_port: u16) -> Result<ProbeStatus, ForwarderError>;

    /// Fails with [`ForwarderError::PortInUse`] when another process holds the port.
    async fn ensure_port_available(&self, port: u16) -> Result<(), ForwarderError> {
        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AddrInUse => Err(ForwarderError::PortInUse(port)),
            Err(e) => {
                // Anything else (e.g. privileged port) shows up again at spawn.
                debug!(port, error = %e, "Bind check inconclusive");
                Ok(())
            }
        }
    }
}

/// Supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Forwarder executable, a path or a name looked up in `PATH`.
    pub forwarder_bin: PathBuf,
    /// How long a fresh child must stay up before the start counts.
    pub spawn_settle: Duration,
    /// How long to wait for a process to disappear after SIGKILL.
    pub reap_window: Duration,
    /// Append forwarder stderr to this file instead of piping it into the
    /// log. Needed when the caller exits before its forwarders do.
    pub stderr_log: Option<PathBuf>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            forwarder_bin: PathBuf::from("socat"),
            spawn_settle: Duration::from_millis(150),
            reap_window: Duration::from_secs(2),
            stderr_log: None,
        }
    }
}

/// Arguments for the forwarder command line.
///
/// `[-T <timeout>] tcp-listen:<port>,fork,reuseaddr tcp:<host>:<port>`
///
/// The inactivity timeout is socat's `-T` option and has to precede the
/// addresses; a trailing `timeout <n>` would be parsed as a third address.
pub fn forwarder_args(spec: &RelaySpec) -> Vec<String> {
    let mut args = Vec::with_capacity(4);
    if let Some(secs) = spec.timeout_secs {
        args.push("-T".to_string());
        args.push(secs.to_string());
    }
    args.push(format!("tcp-listen:{},fork,reuseaddr", spec.listening_port));

    let host = if spec.target_host.contains(':') && !spec.target_host.starts_with('[') {
        format!("[{}]", spec.target_host)
    } else {
        spec.target_host.clone()
    };
    args.push(format!("tcp:{host}:{}", spec.target_port));
    args
}

/// Supervises socat forwarders.
pub struct SocatSupervisor {
    config: SupervisorConfig,
    probe: Arc<dyn ProcessProbe>,
    /// Children spawned by this instance, keyed by listening port.
    children: Mutex<HashMap<u16, Child>>,
}

impl SocatSupervisor {
    pub fn new(config: SupervisorConfig, probe: Arc<dyn ProcessProbe>) -> Self {
        Self {
            config,
            probe,
            children: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    async fn stop_child(
        &self,
        mut child: Child,
        handle: &RelayHandle,
        grace: Duration,
    ) -> Result<StopOutcome, ForwarderError> {
        let pid = handle.pid;
        let pgid = Pid::from_raw(pid as i32);

        match killpg(pgid, Signal::SIGTERM) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return Ok(StopOutcome::AlreadyExited),
            Err(errno) => return Err(ForwarderError::Signal { pid, errno }),
        }

        match timeout(grace, child.wait()).await {
            Ok(Ok(status)) => return Ok(StopOutcome::Exited { status, forced: false }),
            Ok(Err(e)) => {
                return Err(ForwarderError::Probe(format!(
                    "failed to wait for forwarder {pid}: {e}"
                )))
            }
            Err(_) => {}
        }

        warn!(
            listening_port = handle.listening_port,
            pid,
            grace_ms = grace.as_millis() as u64,
            "Forwarder ignored SIGTERM, sending SIGKILL"
        );
        match killpg(pgid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(errno) => return Err(ForwarderError::Signal { pid, errno }),
        }

        match timeout(self.config.reap_window, child.wait()).await {
            Ok(Ok(status)) => Ok(StopOutcome::Exited { status, forced: true }),
            Ok(Err(e)) => Err(ForwarderError::Probe(format!(
                "failed to wait for forwarder {pid}: {e}"
            ))),
            Err(_) => Err(ForwarderError::TerminationTimeout { pid, grace }),
        }
    }

    /// Stop a forwarder this instance did not spawn (e.g. before a restart).
    async fn stop_foreign(
        &self,
        handle: &RelayHandle,
        grace: Duration,
    ) -> Result<StopOutcome, ForwarderError> {
        let pid = handle.pid;
        let target = Pid::from_raw(pid as i32);

        // Only signal the whole group when the process leads it; a forwarder
        // started by hand may share a group with its shell.
        let group = match getpgid(Some(target)) {
            Ok(pgid) => pgid == target,
            Err(Errno::ESRCH) => return Ok(StopOutcome::AlreadyExited),
            Err(errno) => return Err(ForwarderError::Signal { pid, errno }),
        };

        match send_signal(target, group, Signal::SIGTERM) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return Ok(StopOutcome::AlreadyExited),
            Err(errno) => return Err(ForwarderError::Signal { pid, errno }),
        }
        if wait_gone(target, grace).await {
            return Ok(StopOutcome::Gone { forced: false });
        }

        warn!(
            listening_port = handle.listening_port,
            pid,
            grace_ms = grace.as_millis() as u64,
            "Forwarder ignored SIGTERM, sending SIGKILL"
        );
        match send_signal(target, group, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(errno) => return Err(ForwarderError::Signal { pid, errno }),
        }
        if wait_gone(target, self.config.reap_window).await {
            Ok(StopOutcome::Gone { forced: true })
        } else {
            Err(ForwarderError::TerminationTimeout { pid, grace })
        }
    }
}

#[async_trait]
impl RelayRuntime for SocatSupervisor {
    async fn start(&self, spec: &RelaySpec) -> Result<RelayHandle, ForwarderError> {
        let port = spec.listening_port;
        let bin = &self.config.forwarder_bin;
        let args = forwarder_args(spec);

        info!(
            listening_port = port,
            target = %format!("{}:{}", spec.target_host, spec.target_port),
            "Starting forwarder"
        );

        let (stderr, log_offset) = match &self.config.stderr_log {
            Some(path) => {
                let file = open_stderr_log(path).await?;
                let offset = file.metadata().map(|m| m.len()).unwrap_or(0);
                (Stdio::from(file), Some(offset))
            }
            None => (Stdio::piped(), None),
        };

        let mut child = Command::new(bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(stderr)
            .process_group(0)
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => ForwarderError::BinaryMissing(bin.display().to_string()),
                _ => ForwarderError::SpawnFailed(format!("{}: {e}", bin.display())),
            })?;

        let pid = child.id().ok_or_else(|| {
            ForwarderError::SpawnFailed(format!("{} exited before reporting a pid", bin.display()))
        })?;

        sleep(self.config.spawn_settle).await;
        match child.try_wait() {
            Ok(None) => {}
            Ok(Some(status)) => {
                let stderr = match (&self.config.stderr_log, log_offset) {
                    (Some(path), Some(offset)) => read_log_tail(path, offset).await,
                    _ => read_stderr(&mut child).await,
                };
                return Err(ForwarderError::SpawnFailed(format!(
                    "{} exited with {status} during startup: {stderr}",
                    bin.display()
                )));
            }
            Err(e) => {
                return Err(ForwarderError::SpawnFailed(format!(
                    "failed to check forwarder {pid}: {e}"
                )))
            }
        }

        if let Some(stderr) = child.stderr.take() {
            forward_stderr(port, pid, stderr);
        }

        let mut children = self.children.lock().await;
        if let Some(mut previous) = children.insert(port, child) {
            // Reap a crashed predecessor if it has not been collected yet.
            let _ = previous.try_wait();
        }

        info!(listening_port = port, pid, "Forwarder started");
        Ok(RelayHandle {
            listening_port: port,
            pid,
        })
    }

    async fn stop(
        &self,
        handle: &RelayHandle,
        grace: Duration,
    ) -> Result<StopOutcome, ForwarderError> {
        info!(
            listening_port = handle.listening_port,
            pid = handle.pid,
            "Stopping forwarder"
        );

        let cached = self.children.lock().await.remove(&handle.listening_port);
        let outcome = match cached {
            Some(child) if child.id() == Some(handle.pid) => {
                self.stop_child(child, handle, grace).await?
            }
            other => {
                if let Some(mut stale) = other {
                    let _ = stale.try_wait();
                }
                self.stop_foreign(handle, grace).await?
            }
        };

        info!(
            listening_port = handle.listening_port,
            pid = handle.pid,
            outcome = ?outcome,
            "Forwarder stopped"
        );
        Ok(outcome)
    }

    async fn probe_status(&self, listening_port: u16) -> Result<ProbeStatus, ForwarderError> {
        {
            let mut children = self.children.lock().await;
            if let Some(child) = children.get_mut(&listening_port) {
                if let Ok(Some(status)) = child.try_wait() {
                    debug!(listening_port, status = %status, "Cached forwarder has exited");
                    children.remove(&listening_port);
                }
            }
        }

        let status = match self.probe.owner_of(listening_port).await? {
            Some(pid) => ProbeStatus::Running(pid),
            None => ProbeStatus::Stopped,
        };
        debug!(listening_port, status = ?status, "Probed forwarder");
        Ok(status)
    }
}

fn send_signal(pid: Pid, group: bool, signal: Signal) -> nix::Result<()> {
    if group {
        killpg(pid, signal)
    } else {
        kill(pid, signal)
    }
}

/// Poll until `pid` no longer exists (or is a zombie), up to `within`.
async fn wait_gone(pid: Pid, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    loop {
        // Collects it if it happens to be our child; ECHILD otherwise.
        let _ = waitpid(pid, Some(WaitPidFlag::WNOHANG));
        if matches!(kill(pid, None), Err(Errno::ESRCH)) || is_zombie(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(POLL_INTERVAL).await;
    }
}

fn is_zombie(pid: Pid) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            // state follows the parenthesised comm, which may contain spaces
            let after = stat.rsplit_once(')')?.1;
            after.split_whitespace().next().map(|state| state == "Z")
        })
        .unwrap_or(false)
}

async fn open_stderr_log(path: &Path) -> Result<std::fs::File, ForwarderError> {
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| {
            ForwarderError::SpawnFailed(format!("cannot open {}: {e}", path.display()))
        })?;
    Ok(file.into_std().await)
}

/// What a failed forwarder appended to the shared log since `offset`.
async fn read_log_tail(path: &Path, offset: u64) -> String {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let start = usize::try_from(offset).unwrap_or(usize::MAX).min(bytes.len());
            String::from_utf8_lossy(&bytes[start..]).trim().to_string()
        }
        Err(e) => format!("(stderr log unreadable: {e})"),
    }
}

async fn read_stderr(child: &mut Child) -> String {
    let Some(mut stderr) = child.stderr.take() else {
        return String::new();
    };
    let mut buf = String::new();
    let _ = timeout(STDERR_READ_TIMEOUT, stderr.read_to_string(&mut buf)).await;
    buf.trim().to_string()
}

fn forward_stderr(listening_port: u16, pid: u32, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            warn!(listening_port, pid, line = %line, "Forwarder stderr");
        }
    });
}
