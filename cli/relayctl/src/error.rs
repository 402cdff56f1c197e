//! Error handling and display for the CLI.

use colored::Colorize;
use tailrelay_agent::RelayError;
use thiserror::Error;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("Invalid route name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Nothing to update. Pass at least one field to change.")]
    EmptyUpdate,
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {}", "Error:".red().bold(), err);

    if let Some(hint) = hint_for(err) {
        eprintln!("\n{}", format!("Hint: {hint}").yellow());
    }
}

fn hint_for(err: &anyhow::Error) -> Option<&'static str> {
    if let Some(relay_err) = err.downcast_ref::<RelayError>() {
        return match relay_err {
            RelayError::UpstreamUnreachable { .. } => Some(
                "Check that Caddy is running and TAILRELAY_ADMIN_URL points at its admin endpoint.",
            ),
            RelayError::UpstreamRejected { .. } => {
                Some("Caddy refused the config. Run `relayctl config` to inspect what is loaded.")
            }
            RelayError::BinaryMissing(_) => {
                Some("Install socat or set TAILRELAY_FORWARDER_BIN to its path.")
            }
            RelayError::Conflict(_) => {
                Some("Run `relayctl route list` or `relayctl relay list` to see what exists.")
            }
            RelayError::NotFound(_) => {
                Some("Live blocks without a record can be adopted with `relayctl route recover`.")
            }
            RelayError::IncompleteConfig { .. } => {
                Some("The live server block was not created by relayctl. Fix or remove it in Caddy.")
            }
            RelayError::TerminationTimeout { .. } => {
                Some("The forwarder survived SIGKILL. Check for it with `pgrep -a socat`.")
            }
            _ => None,
        };
    }

    match err.downcast_ref::<CliError>() {
        Some(CliError::InvalidName { .. }) => {
            Some("Route names look like `srv1a2b3c4d`; see `relayctl route list`.")
        }
        _ => None,
    }
}
