//! Process-table probe for running forwarders.
//!
//! The supervisor's child cache is lost on restart, so liveness always comes
//! from the OS. `pgrep -a` lists `<pid> <cmdline>` for every process whose
//! name matches the forwarder binary; the listening port is read back from the
//! `tcp-listen:<port>` address on the command line.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::ForwarderError;

/// Linux truncates process names to 15 bytes; pgrep matches against that.
const COMM_MAX: usize = 15;

/// Maps listening port to the lowest PID of a forwarder bound to it.
#[async_trait]
pub trait ProcessProbe: Send + Sync {
    async fn find_owners(&self) -> Result<BTreeMap<u16, u32>, ForwarderError>;

    /// PID owning `port`, if any.
    async fn owner_of(&self, port: u16) -> Result<Option<u32>, ForwarderError> {
        Ok(self.find_owners().await?.get(&port).copied())
    }
}

/// [`ProcessProbe`] backed by `pgrep`.
#[derive(Debug, Clone)]
pub struct PgrepProbe {
    process_name: String,
}

impl PgrepProbe {
    /// Probe for processes started from `forwarder_bin` (a path or a bare name).
    pub fn new(forwarder_bin: &Path) -> Self {
        let name = forwarder_bin
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| forwarder_bin.to_string_lossy().to_string());
        let process_name = truncate_comm(&name).to_string();
        Self { process_name }
    }

    pub fn process_name(&self) -> &str {
        &self.process_name
    }
}

#[async_trait]
impl ProcessProbe for PgrepProbe {
    async fn find_owners(&self) -> Result<BTreeMap<u16, u32>, ForwarderError> {
        let output = Command::new("pgrep")
            .args(["-a", "-x", &self.process_name])
            .output()
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => ForwarderError::Probe("pgrep not found in PATH".to_string()),
                _ => ForwarderError::Probe(format!("failed to run pgrep: {e}")),
            })?;

        // 0: matches, 1: no matches, anything else is a pgrep failure.
        match output.status.code() {
            Some(0) => {}
            Some(1) => return Ok(BTreeMap::new()),
            _ => {
                return Err(ForwarderError::Probe(format!(
                    "pgrep exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                )))
            }
        }

        let owners = parse_pgrep_output(&String::from_utf8_lossy(&output.stdout));
        debug!(process = %self.process_name, count = owners.len(), "Probed forwarders");
        Ok(owners)
    }
}

/// Parse `pgrep -a` output into port -> lowest PID.
pub fn parse_pgrep_output(raw: &str) -> BTreeMap<u16, u32> {
    let mut owners = BTreeMap::new();
    for line in raw.lines() {
        let Some((pid, cmdline)) = line.trim().split_once(char::is_whitespace) else {
            continue;
        };
        let Ok(pid) = pid.parse::<u32>() else {
            continue;
        };
        let Some(port) = listen_port(cmdline) else {
            continue;
        };
        owners
            .entry(port)
            .and_modify(|owner: &mut u32| *owner = (*owner).min(pid))
            .or_insert(pid);
    }
    owners
}

/// Port of the first `tcp-listen:`, `tcp4-listen:` or `tcp6-listen:` address.
fn listen_port(cmdline: &str) -> Option<u16> {
    let lower = cmdline.to_ascii_lowercase();
    for marker in ["tcp-listen:", "tcp4-listen:", "tcp6-listen:"] {
        if let Some(start) = lower.find(marker) {
            let rest = &lower[start + marker.len()..];
            let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
            if let Ok(port) = digits.parse::<u16>() {
                return Some(port);
            }
        }
    }
    None
}

fn truncate_comm(name: &str) -> &str {
    if name.len() <= COMM_MAX {
        return name;
    }
    let mut end = COMM_MAX;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_parse_keeps_lowest_pid() {
        let raw = "\
4121 socat tcp-listen:9000,fork,reuseaddr tcp:10.0.0.5:80
4099 socat tcp-listen:9000,fork,reuseaddr tcp:10.0.0.5:80
5000 socat -T 30 TCP4-LISTEN:9001,fork,reuseaddr tcp:db:5432
";
        let owners = parse_pgrep_output(raw);
        assert_eq!(owners.len(), 2);
        assert_eq!(owners[&9000], 4099);
        assert_eq!(owners[&9001], 5000);
    }

    #[test]
    fn test_parse_skips_unrelated_lines() {
        let raw = "\
1 socat -V
abc socat tcp-listen:9000
2 socat udp-listen:53 udp:1.1.1.1:53
";
        assert!(parse_pgrep_output(raw).is_empty());
    }

    #[rstest]
    #[case("socat tcp-listen:80,fork tcp:a:1", Some(80))]
    #[case("socat TCP6-LISTEN:443,fork tcp:a:1", Some(443))]
    #[case("socat tcp-listen:99999 tcp:a:1", None)]
    #[case("socat stdio tcp:a:1", None)]
    fn test_listen_port(#[case] cmdline: &str, #[case] expected: Option<u16>) {
        assert_eq!(listen_port(cmdline), expected);
    }

    #[test]
    fn test_probe_name_from_path() {
        let probe = PgrepProbe::new(Path::new("/usr/bin/socat"));
        assert_eq!(probe.process_name(), "socat");

        let probe = PgrepProbe::new(Path::new("/tmp/a-very-long-forwarder-name"));
        assert_eq!(probe.process_name(), "a-very-long-for");
    }
}
