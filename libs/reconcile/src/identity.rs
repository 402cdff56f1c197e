//! Deterministic route identity.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::IdentityError;

/// Prefix of every derived route name.
pub const NAME_PREFIX: &str = "srv";

/// Number of hex characters of the digest kept in a derived name.
pub const NAME_HASH_WIDTH: usize = 8;

/// Reserved selector that addresses the whole server collection.
pub const ALL_SERVERS: &str = "ALL";

/// External name of a proxy route.
///
/// Derived names are `srv` followed by the first eight hex characters of the
/// SHA-256 of [`identity_input`]. Names recovered from
/// live config are accepted verbatim through [`RouteName::parse`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RouteName(String);

impl RouteName {
    /// Derive the name for a `(hostname, port)` pair.
    pub fn derive(hostname: &str, port: u16) -> Self {
        let digest = Sha256::digest(identity_input(hostname, port).as_bytes());
        let hex = hex::encode(digest);
        Self(format!("{NAME_PREFIX}{}", &hex[..NAME_HASH_WIDTH]))
    }

    /// Accept a name that already exists in live config.
    pub fn parse(s: &str) -> Result<Self, IdentityError> {
        if s.is_empty() {
            return Err(IdentityError::Empty);
        }
        if s == ALL_SERVERS {
            return Err(IdentityError::Reserved(s.to_string()));
        }
        if let Some(ch) = s
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(IdentityError::InvalidChar {
                name: s.to_string(),
                ch,
            });
        }
        Ok(Self(s.to_string()))
    }

    /// Returns true if this is the name [`RouteName::derive`] yields for the pair.
    pub fn matches(&self, hostname: &str, port: u16) -> bool {
        *self == Self::derive(hostname, port)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RouteName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RouteName {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RouteName {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RouteName> for String {
    fn from(name: RouteName) -> Self {
        name.0
    }
}

impl AsRef<str> for RouteName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Canonical JSON of the identity pair: sorted keys, no whitespace.
pub fn identity_input(hostname: &str, port: u16) -> String {
    // Value's Display is compact JSON and takes care of string escaping.
    format!(
        r#"{{"hostname":{},"port":{port}}}"#,
        serde_json::Value::from(hostname)
    )
}
