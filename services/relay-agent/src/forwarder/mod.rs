//! TCP forwarders run as supervised socat processes.
//!
//! - `probe`: process-table scan mapping listening ports to PIDs
//! - `supervisor`: spawn / stop / probe behind the `RelayRuntime` seam
//! - `mock`: in-memory runtime and probe for tests and dry runs

mod mock;
mod probe;
mod supervisor;

use std::time::Duration;

use nix::errno::Errno;
use thiserror::Error;

pub use mock::MockForwarder;
pub use probe::{parse_pgrep_output, PgrepProbe, ProcessProbe};
pub use supervisor::{
    forwarder_args, ProbeStatus, RelayHandle, RelayRuntime, SocatSupervisor, StopOutcome,
    SupervisorConfig,
};

/// Errors from forwarder supervision.
#[derive(Debug, Error)]
pub enum ForwarderError {
    #[error("forwarder binary not found: {0}")]
    BinaryMissing(String),

    #[error("failed to spawn forwarder: {0}")]
    SpawnFailed(String),

    #[error("process {pid} still alive after {grace:?} grace period and SIGKILL")]
    TerminationTimeout { pid: u32, grace: Duration },

    #[error("port {0} is already in use")]
    PortInUse(u16),

    #[error("process probe failed: {0}")]
    Probe(String),

    #[error("failed to signal process {pid}: {errno}")]
    Signal { pid: u32, errno: Errno },
}
