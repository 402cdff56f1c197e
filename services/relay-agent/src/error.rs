//! Error taxonomy surfaced by the reconciler.
//!
//! Each collaborator has its own error enum (`AdminError`, `CodecError`,
//! `ForwarderError`, `StateStoreError`); they fold into [`RelayError`] at the
//! reconciler boundary so callers match on one set of kinds.

use std::time::Duration;

use thiserror::Error;

use crate::caddy::{AdminError, CodecError};
use crate::forwarder::ForwarderError;
use crate::model::ValidationError;
use crate::state::StateStoreError;

/// Errors returned by reconciler operations.
#[derive(Debug, Error)]
pub enum RelayError {
    /// A required field is missing or malformed. Never reaches external systems.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Duplicate identity or port.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Unknown id or name.
    #[error("not found: {0}")]
    NotFound(String),

    /// The reverse proxy admin API could not be reached.
    #[error("reverse proxy admin API unreachable at {url}: {reason}")]
    UpstreamUnreachable { url: String, reason: String },

    /// The reverse proxy admin API answered with a non-2xx status.
    #[error("reverse proxy admin API rejected request ({status}): {body}")]
    UpstreamRejected { status: u16, body: String },

    /// The reverse proxy admin API answered with something that is not JSON.
    #[error("invalid response from reverse proxy admin API: {0}")]
    InvalidResponse(String),

    /// The forwarder executable could not be located.
    #[error("forwarder binary not found: {0}")]
    BinaryMissing(String),

    /// The forwarder could not be launched or exited right after launch.
    #[error("failed to spawn forwarder: {0}")]
    SpawnFailed(String),

    /// Live config exists but could not be decoded into a route.
    #[error("incomplete config for server '{name}': {detail}")]
    IncompleteConfig { name: String, detail: String },

    /// The forwarder survived both the graceful and the forced termination.
    #[error("process {pid} still alive after {grace:?} grace period and SIGKILL")]
    TerminationTimeout { pid: u32, grace: Duration },

    /// The process table could not be read.
    #[error("process probe failed: {0}")]
    Probe(String),

    /// The persisted store failed.
    #[error("state store error: {0}")]
    Store(#[source] StateStoreError),
}

impl RelayError {
    /// Short machine-readable kind, used by the CLI and in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Conflict(_) => "conflict",
            Self::NotFound(_) => "not_found",
            Self::UpstreamUnreachable { .. } => "upstream_unreachable",
            Self::UpstreamRejected { .. } => "upstream_rejected",
            Self::InvalidResponse(_) => "invalid_response",
            Self::BinaryMissing(_) => "binary_missing",
            Self::SpawnFailed(_) => "spawn_failed",
            Self::IncompleteConfig { .. } => "incomplete_config",
            Self::TerminationTimeout { .. } => "termination_timeout",
            Self::Probe(_) => "probe",
            Self::Store(_) => "store",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<AdminError> for RelayError {
    fn from(err: AdminError) -> Self {
        match err {
            AdminError::Unreachable { url, reason } => Self::UpstreamUnreachable { url, reason },
            AdminError::Rejected { status, body } => Self::UpstreamRejected { status, body },
            AdminError::NotFound(name) => {
                Self::NotFound(format!("server '{name}' is not present in live config"))
            }
            AdminError::InvalidResponse(msg) => Self::InvalidResponse(msg),
            AdminError::Client(msg) => Self::UpstreamUnreachable {
                url: String::new(),
                reason: msg,
            },
        }
    }
}

impl From<CodecError> for RelayError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Incomplete { name, missing } => Self::IncompleteConfig {
                name,
                detail: format!("could not recover {missing}"),
            },
            CodecError::Malformed { name, source } => Self::IncompleteConfig {
                name,
                detail: source.to_string(),
            },
        }
    }
}

impl From<ForwarderError> for RelayError {
    fn from(err: ForwarderError) -> Self {
        match err {
            ForwarderError::BinaryMissing(bin) => Self::BinaryMissing(bin),
            ForwarderError::SpawnFailed(msg) => Self::SpawnFailed(msg),
            ForwarderError::TerminationTimeout { pid, grace } => {
                Self::TerminationTimeout { pid, grace }
            }
            ForwarderError::PortInUse(port) => {
                Self::Conflict(format!("port {port} is already bound by another process"))
            }
            ForwarderError::Probe(msg) => Self::Probe(msg),
            ForwarderError::Signal { pid, errno } => {
                Self::Probe(format!("failed to signal process {pid}: {errno}"))
            }
        }
    }
}

impl From<StateStoreError> for RelayError {
    fn from(err: StateStoreError) -> Self {
        match err {
            StateStoreError::Conflict(msg) => Self::Conflict(msg),
            StateStoreError::NotFound(msg) => Self::NotFound(msg),
            other => Self::Store(other),
        }
    }
}
