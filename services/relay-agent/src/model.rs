//! Relay records and the specs they are created from.
//!
//! Specs are plain data. The native Caddy block is produced by an explicit
//! [`crate::caddy::encode`] call, never as a side effect of editing a field.

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tailrelay_reconcile::RouteName;
use thiserror::Error;

/// A spec field is missing or malformed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid {field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Advisory status cached on a record. Live probes are authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayStatus {
    Running,
    Stopped,
}

impl RelayStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for RelayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What `create_*` does after persisting the record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OnCreate {
    /// Persist as `stopped` and return.
    #[default]
    Persist,
    /// Persist, then start immediately.
    Start,
}

/// Desired configuration of a reverse-proxy route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSpec {
    pub hostname: String,
    pub port: u16,
    pub upstream_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_trust_pool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trusted_proxies: Option<Vec<String>>,
}

impl RouteSpec {
    pub fn new(hostname: impl Into<String>, port: u16, upstream_address: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            upstream_address: upstream_address.into(),
            tls_trust_pool: None,
            trusted_proxies: None,
        }
    }

    pub fn with_tls_trust_pool(mut self, path: impl Into<String>) -> Self {
        self.tls_trust_pool = Some(path.into());
        self
    }

    pub fn with_trusted_proxies<I, S>(mut self, proxies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.trusted_proxies = Some(proxies.into_iter().map(Into::into).collect());
        self
    }

    /// Canonical form: trimmed, lowercase hostname; empty optionals become `None`.
    pub fn normalized(self) -> Self {
        let tls_trust_pool = self
            .tls_trust_pool
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());
        let trusted_proxies = self
            .trusted_proxies
            .map(|list| {
                list.into_iter()
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|list| !list.is_empty());

        Self {
            hostname: self.hostname.trim().to_ascii_lowercase(),
            port: self.port,
            upstream_address: self.upstream_address.trim().to_string(),
            tls_trust_pool,
            trusted_proxies,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.hostname.is_empty() {
            return Err(ValidationError::new("hostname", "must not be empty"));
        }
        if self.hostname.contains(|c: char| c.is_whitespace() || c == '/') {
            return Err(ValidationError::new(
                "hostname",
                format!("'{}' is not a host name", self.hostname),
            ));
        }
        if self.port == 0 {
            return Err(ValidationError::new("port", "must be between 1 and 65535"));
        }
        if self.upstream_address.is_empty() {
            return Err(ValidationError::new("upstream_address", "must not be empty"));
        }
        if self.upstream_address.contains(char::is_whitespace) {
            return Err(ValidationError::new(
                "upstream_address",
                "must not contain whitespace",
            ));
        }
        if let Some(proxies) = &self.trusted_proxies {
            for entry in proxies {
                validate_ip_or_cidr(entry)?;
            }
        }
        Ok(())
    }

    /// Identity of the Caddy server block this spec produces.
    pub fn name(&self) -> RouteName {
        RouteName::derive(&self.hostname, self.port)
    }
}

fn validate_ip_or_cidr(entry: &str) -> Result<(), ValidationError> {
    let invalid = || {
        ValidationError::new(
            "trusted_proxies",
            format!("'{entry}' is not an IP address or CIDR range"),
        )
    };

    let (addr, prefix) = match entry.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (entry, None),
    };
    let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
    if let Some(prefix) = prefix {
        let bits: u8 = prefix.parse().map_err(|_| invalid())?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if bits > max {
            return Err(invalid());
        }
    }
    Ok(())
}

/// A persisted reverse-proxy route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRoute {
    pub id: i64,
    pub name: RouteName,
    #[serde(flatten)]
    pub spec: RouteSpec,
    pub last_known_status: RelayStatus,
    pub created_at: DateTime<Utc>,
}

/// Desired configuration of a TCP forwarder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelaySpec {
    pub listening_port: u16,
    pub target_host: String,
    pub target_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u32>,
}

impl RelaySpec {
    pub fn new(listening_port: u16, target_host: impl Into<String>, target_port: u16) -> Self {
        Self {
            listening_port,
            target_host: target_host.into(),
            target_port,
            timeout_secs: None,
        }
    }

    pub fn with_timeout(mut self, secs: u32) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn normalized(self) -> Self {
        Self {
            target_host: self.target_host.trim().to_string(),
            ..self
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.listening_port == 0 {
            return Err(ValidationError::new(
                "listening_port",
                "must be between 1 and 65535",
            ));
        }
        if self.target_host.is_empty() {
            return Err(ValidationError::new("target_host", "must not be empty"));
        }
        // socat splits address options on ',' and whitespace would split argv
        if self
            .target_host
            .contains(|c: char| c.is_whitespace() || c == ',')
        {
            return Err(ValidationError::new(
                "target_host",
                format!("'{}' is not a host name or address", self.target_host),
            ));
        }
        if self.target_port == 0 {
            return Err(ValidationError::new(
                "target_port",
                "must be between 1 and 65535",
            ));
        }
        if self.timeout_secs == Some(0) {
            return Err(ValidationError::new("timeout_secs", "must be greater than 0"));
        }
        Ok(())
    }
}

/// A persisted TCP forwarder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpRelay {
    pub id: i64,
    #[serde(flatten)]
    pub spec: RelaySpec,
    pub last_known_status: RelayStatus,
    pub created_at: DateTime<Utc>,
}

impl TcpRelay {
    pub fn listening_port(&self) -> u16 {
        self.spec.listening_port
    }
}
