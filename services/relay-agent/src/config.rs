//! Configuration for the relay agent.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use directories::BaseDirs;

/// Relay agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Caddy admin API URL.
    pub admin_url: String,

    /// SQLite database holding relay records.
    pub db_path: PathBuf,

    /// Forwarder executable.
    pub forwarder_bin: PathBuf,

    /// File forwarder stderr is appended to. Unset, it goes to the log.
    pub forwarder_log: Option<PathBuf>,

    /// Grace period between SIGTERM and SIGKILL.
    pub stop_grace: Duration,

    /// Timeout for each admin API request.
    pub admin_timeout: Duration,

    /// How long a new forwarder must stay up before its start counts.
    pub spawn_settle: Duration,

    /// Interval between status sweeps.
    pub sweep_interval: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |primary: &str, legacy: Option<&str>| {
            lookup(primary)
                .or_else(|| legacy.and_then(|key| lookup(key)))
                .filter(|v| !v.trim().is_empty())
        };

        let admin_url = var("TAILRELAY_ADMIN_URL", Some("CADDY_ADMIN_URL"))
            .unwrap_or_else(|| "http://localhost:2019".to_string());

        let db_path = var("TAILRELAY_DB_PATH", Some("DB_PATH"))
            .map(PathBuf::from)
            .unwrap_or_else(default_db_path);

        let forwarder_bin = var("TAILRELAY_FORWARDER_BIN", None)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("socat"));

        let forwarder_log = var("TAILRELAY_FORWARDER_LOG", None).map(PathBuf::from);

        let stop_grace = Duration::from_secs(parse_or(
            "TAILRELAY_STOP_GRACE_SECS",
            var("TAILRELAY_STOP_GRACE_SECS", None),
            10,
        )?);
        let admin_timeout = Duration::from_secs(parse_or(
            "TAILRELAY_ADMIN_TIMEOUT_SECS",
            var("TAILRELAY_ADMIN_TIMEOUT_SECS", None),
            30,
        )?);
        let spawn_settle = Duration::from_millis(parse_or(
            "TAILRELAY_SPAWN_SETTLE_MS",
            var("TAILRELAY_SPAWN_SETTLE_MS", None),
            150,
        )?);
        let sweep_interval = Duration::from_secs(parse_or(
            "TAILRELAY_SWEEP_INTERVAL_SECS",
            var("TAILRELAY_SWEEP_INTERVAL_SECS", None),
            15,
        )?);
        if sweep_interval.is_zero() {
            anyhow::bail!("TAILRELAY_SWEEP_INTERVAL_SECS must be greater than 0");
        }

        let log_level =
            var("TAILRELAY_LOG_LEVEL", None).unwrap_or_else(|| "info".to_string());

        Ok(Self {
            admin_url,
            db_path,
            forwarder_bin,
            forwarder_log,
            stop_grace,
            admin_timeout,
            spawn_settle,
            sweep_interval,
            log_level,
        })
    }
}

fn parse_or<T>(key: &str, raw: Option<String>, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match raw {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        None => Ok(default),
    }
}

fn default_db_path() -> PathBuf {
    BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(".tailrelay.db"))
        .unwrap_or_else(|| PathBuf::from(".tailrelay.db"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.admin_url, "http://localhost:2019");
        assert_eq!(config.forwarder_bin, PathBuf::from("socat"));
        assert_eq!(config.forwarder_log, None);
        assert_eq!(config.stop_grace, Duration::from_secs(10));
        assert_eq!(config.admin_timeout, Duration::from_secs(30));
        assert_eq!(config.spawn_settle, Duration::from_millis(150));
        assert_eq!(config.sweep_interval, Duration::from_secs(15));
        assert_eq!(config.log_level, "info");
        assert!(config.db_path.ends_with(".tailrelay.db"));
    }

    #[test]
    fn test_legacy_names_are_fallbacks() {
        let config = load(&[
            ("CADDY_ADMIN_URL", "http://caddy:2019"),
            ("DB_PATH", "/data/legacy.db"),
        ])
        .unwrap();
        assert_eq!(config.admin_url, "http://caddy:2019");
        assert_eq!(config.db_path, PathBuf::from("/data/legacy.db"));

        let config = load(&[
            ("CADDY_ADMIN_URL", "http://caddy:2019"),
            ("TAILRELAY_ADMIN_URL", "http://primary:2019"),
        ])
        .unwrap();
        assert_eq!(config.admin_url, "http://primary:2019");
    }

    #[test]
    fn test_forwarder_log_path() {
        let config = load(&[("TAILRELAY_FORWARDER_LOG", "/var/log/tailrelay/socat.log")]).unwrap();
        assert_eq!(
            config.forwarder_log,
            Some(PathBuf::from("/var/log/tailrelay/socat.log"))
        );
    }

    #[test]
    fn test_malformed_number_is_error() {
        let err = load(&[("TAILRELAY_STOP_GRACE_SECS", "ten")]).unwrap_err();
        assert!(err.to_string().contains("TAILRELAY_STOP_GRACE_SECS"));
    }

    #[test]
    fn test_zero_sweep_interval_rejected() {
        assert!(load(&[("TAILRELAY_SWEEP_INTERVAL_SECS", "0")]).is_err());
    }
}
