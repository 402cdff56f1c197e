//! In-memory forwarder runtime and probe.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::probe::ProcessProbe;
use super::supervisor::{ProbeStatus, RelayHandle, RelayRuntime, StopOutcome};
use super::ForwarderError;
use crate::model::RelaySpec;

/// Mock forwarder: a shared port -> pid table serving as both the runtime
/// and the process probe.
pub struct MockForwarder {
    running: Mutex<BTreeMap<u16, u32>>,
    bound_elsewhere: Mutex<BTreeSet<u16>>,
    next_pid: AtomicU32,
    starts: AtomicUsize,
    stops: AtomicUsize,
    fail_starts: AtomicBool,
}

impl MockForwarder {
    pub fn new() -> Self {
        Self {
            running: Mutex::new(BTreeMap::new()),
            bound_elsewhere: Mutex::new(BTreeSet::new()),
            next_pid: AtomicU32::new(10_000),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            fail_starts: AtomicBool::new(false),
        }
    }

    /// Create a mock forwarder that fails all starts.
    pub fn failing() -> Self {
        let mock = Self::new();
        mock.fail_starts.store(true, Ordering::SeqCst);
        mock
    }

    /// Kill the forwarder on `port` behind the supervisor's back.
    pub fn crash(&self, port: u16) -> Option<u32> {
        self.table().remove(&port)
    }

    /// Register a forwarder on `port` that was started by someone else.
    pub fn adopt(&self, port: u16, pid: u32) {
        self.table().insert(port, pid);
    }

    /// Pretend an unrelated process holds `port`.
    pub fn bind_elsewhere(&self, port: u16) {
        self.bound_elsewhere
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(port);
    }

    pub fn is_running(&self, port: u16) -> bool {
        self.table().contains_key(&port)
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    fn table(&self) -> MutexGuard<'_, BTreeMap<u16, u32>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MockForwarder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelayRuntime for MockForwarder {
    async fn start(&self, spec: &RelaySpec) -> Result<RelayHandle, ForwarderError> {
        if self.fail_starts.load(Ordering::SeqCst) {
            return Err(ForwarderError::SpawnFailed(
                "mock forwarder configured to fail".to_string(),
            ));
        }

        // Yield so concurrent callers get a chance to interleave.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.table().insert(spec.listening_port, pid);
        self.starts.fetch_add(1, Ordering::SeqCst);
        info!(listening_port = spec.listening_port, pid, "[MOCK] Forwarder started");

        Ok(RelayHandle {
            listening_port: spec.listening_port,
            pid,
        })
    }

    async fn stop(
        &self,
        handle: &RelayHandle,
        _grace: Duration,
    ) -> Result<StopOutcome, ForwarderError> {
        let removed = {
            let mut table = self.table();
            match table.get(&handle.listening_port) {
                Some(pid) if *pid == handle.pid => table.remove(&handle.listening_port),
                _ => None,
            }
        };
        debug!(listening_port = handle.listening_port, pid = handle.pid, "[MOCK] Forwarder stop");

        match removed {
            Some(_) => {
                self.stops.fetch_add(1, Ordering::SeqCst);
                Ok(StopOutcome::Gone { forced: false })
            }
            None => Ok(StopOutcome::AlreadyExited),
        }
    }

    async fn probe_status(&self, listening_port: u16) -> Result<ProbeStatus, ForwarderError> {
        Ok(match self.table().get(&listening_port) {
            Some(pid) => ProbeStatus::Running(*pid),
            None => ProbeStatus::Stopped,
        })
    }

    async fn ensure_port_available(&self, port: u16) -> Result<(), ForwarderError> {
        let taken = self
            .bound_elsewhere
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&port);
        if taken {
            return Err(ForwarderError::PortInUse(port));
        }
        Ok(())
    }
}

#[async_trait]
impl ProcessProbe for MockForwarder {
    async fn find_owners(&self) -> Result<BTreeMap<u16, u32>, ForwarderError> {
        Ok(self.table().clone())
    }
}
