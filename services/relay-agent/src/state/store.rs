//! SQLite-based state store for relay records.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use tailrelay_reconcile::RouteName;
use thiserror::Error;
use tracing::debug;

use crate::model::{ProxyRoute, RelaySpec, RelayStatus, RouteSpec, TcpRelay};

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    Invalid(String),
}

/// Persisted relay records.
pub trait RelayStore: Send + Sync {
    fn insert_route(
        &self,
        name: &RouteName,
        spec: &RouteSpec,
        status: RelayStatus,
    ) -> Result<ProxyRoute, StateStoreError>;
    fn get_route(&self, id: i64) -> Result<Option<ProxyRoute>, StateStoreError>;
    fn get_route_by_name(&self, name: &RouteName) -> Result<Option<ProxyRoute>, StateStoreError>;
    fn list_routes(&self) -> Result<Vec<ProxyRoute>, StateStoreError>;
    /// Overwrite name, spec and status of an existing route.
    fn update_route(&self, route: &ProxyRoute) -> Result<(), StateStoreError>;
    fn set_route_status(&self, id: i64, status: RelayStatus) -> Result<(), StateStoreError>;
    fn delete_route(&self, id: i64) -> Result<(), StateStoreError>;

    fn insert_relay(
        &self,
        spec: &RelaySpec,
        status: RelayStatus,
    ) -> Result<TcpRelay, StateStoreError>;
    fn get_relay(&self, id: i64) -> Result<Option<TcpRelay>, StateStoreError>;
    fn get_relay_by_port(&self, port: u16) -> Result<Option<TcpRelay>, StateStoreError>;
    fn list_relays(&self) -> Result<Vec<TcpRelay>, StateStoreError>;
    /// Overwrite spec and status of an existing relay.
    fn update_relay(&self, relay: &TcpRelay) -> Result<(), StateStoreError>;
    fn set_relay_status(&self, id: i64, status: RelayStatus) -> Result<(), StateStoreError>;
    fn delete_relay(&self, id: i64) -> Result<(), StateStoreError>;
}

const ROUTE_COLUMNS: &str = "id, name, hostname, port, upstream_address, tls_trust_pool, \
                             trusted_proxies, status, created_at";
const RELAY_COLUMNS: &str =
    "id, listening_port, target_host, target_port, timeout_secs, status, created_at";

/// SQLite state store.
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    /// Open or create a state store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StateStoreError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StateStoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<(), StateStoreError> {
        self.conn().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS proxy_routes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                hostname TEXT NOT NULL,
                port INTEGER NOT NULL,
                upstream_address TEXT NOT NULL,
                tls_trust_pool TEXT,
                trusted_proxies TEXT,
                status TEXT NOT NULL DEFAULT 'stopped',
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tcp_relays (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                listening_port INTEGER NOT NULL UNIQUE,
                target_host TEXT NOT NULL,
                target_port INTEGER NOT NULL,
                timeout_secs INTEGER,
                status TEXT NOT NULL DEFAULT 'stopped',
                created_at INTEGER NOT NULL
            );
            "#,
        )?;

        debug!("State store schema initialized");
        Ok(())
    }
}

impl RelayStore for StateStore {
    fn insert_route(
        &self,
        name: &RouteName,
        spec: &RouteSpec,
        status: RelayStatus,
    ) -> Result<ProxyRoute, StateStoreError> {
        let created_at = now();
        let proxies = encode_proxies(&spec.trusted_proxies)?;
        let conn = self.conn();
        conn.execute(
            r#"
            INSERT INTO proxy_routes (name, hostname, port, upstream_address, tls_trust_pool, trusted_proxies, status, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                name.as_str(),
                spec.hostname,
                spec.port,
                spec.upstream_address,
                spec.tls_trust_pool,
                proxies,
                status.as_str(),
                created_at.timestamp(),
            ],
        )
        .map_err(|e| on_unique(e, format!("route '{name}' already exists")))?;

        Ok(ProxyRoute {
            id: conn.last_insert_rowid(),
            name: name.clone(),
            spec: spec.clone(),
            last_known_status: status,
            created_at,
        })
    }

    fn get_route(&self, id: i64) -> Result<Option<ProxyRoute>, StateStoreError> {
        let sql = format!("SELECT {ROUTE_COLUMNS} FROM proxy_routes WHERE id = ?1");
        self.conn()
            .query_row(&sql, params![id], route_from_row)
            .optional()
            .map_err(Into::into)
    }

    fn get_route_by_name(&self, name: &RouteName) -> Result<Option<ProxyRoute>, StateStoreError> {
        let sql = format!("SELECT {ROUTE_COLUMNS} FROM proxy_routes WHERE name = ?1");
        self.conn()
            .query_row(&sql, params![name.as_str()], route_from_row)
            .optional()
            .map_err(Into::into)
    }

    fn list_routes(&self) -> Result<Vec<ProxyRoute>, StateStoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ROUTE_COLUMNS} FROM proxy_routes ORDER BY created_at DESC, id DESC"
        ))?;
        let routes = stmt
            .query_map([], route_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(routes)
    }

    fn update_route(&self, route: &ProxyRoute) -> Result<(), StateStoreError> {
        let proxies = encode_proxies(&route.spec.trusted_proxies)?;
        let changed = self
            .conn()
            .execute(
                r#"
                UPDATE proxy_routes
                SET name = ?1, hostname = ?2, port = ?3, upstream_address = ?4,
                    tls_trust_pool = ?5, trusted_proxies = ?6, status = ?7
                WHERE id = ?8
                "#,
                params![
                    route.name.as_str(),
                    route.spec.hostname,
                    route.spec.port,
                    route.spec.upstream_address,
                    route.spec.tls_trust_pool,
                    proxies,
                    route.last_known_status.as_str(),
                    route.id,
                ],
            )
            .map_err(|e| on_unique(e, format!("route '{}' already exists", route.name)))?;
        require_changed(changed, || format!("route {}", route.id))
    }

    fn set_route_status(&self, id: i64, status: RelayStatus) -> Result<(), StateStoreError> {
        let changed = self.conn().execute(
            "UPDATE proxy_routes SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        require_changed(changed, || format!("route {id}"))
    }

    fn delete_route(&self, id: i64) -> Result<(), StateStoreError> {
        let changed = self
            .conn()
            .execute("DELETE FROM proxy_routes WHERE id = ?1", params![id])?;
        require_changed(changed, || format!("route {id}"))
    }

    fn insert_relay(
        &self,
        spec: &RelaySpec,
        status: RelayStatus,
    ) -> Result<TcpRelay, StateStoreError> {
        let created_at = now();
        let conn = self.conn();
        conn.execute(
            r#"
            INSERT INTO tcp_relays (listening_port, target_host, target_port, timeout_secs, status, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                spec.listening_port,
                spec.target_host,
                spec.target_port,
                spec.timeout_secs,
                status.as_str(),
                created_at.timestamp(),
            ],
        )
        .map_err(|e| {
            on_unique(
                e,
                format!("a relay already listens on port {}", spec.listening_port),
            )
        })?;

        Ok(TcpRelay {
            id: conn.last_insert_rowid(),
            spec: spec.clone(),
            last_known_status: status,
            created_at,
        })
    }

    fn get_relay(&self, id: i64) -> Result<Option<TcpRelay>, StateStoreError> {
        let sql = format!("SELECT {RELAY_COLUMNS} FROM tcp_relays WHERE id = ?1");
        self.conn()
            .query_row(&sql, params![id], relay_from_row)
            .optional()
            .map_err(Into::into)
    }

    fn get_relay_by_port(&self, port: u16) -> Result<Option<TcpRelay>, StateStoreError> {
        let sql = format!("SELECT {RELAY_COLUMNS} FROM tcp_relays WHERE listening_port = ?1");
        self.conn()
            .query_row(&sql, params![port], relay_from_row)
            .optional()
            .map_err(Into::into)
    }

    fn list_relays(&self) -> Result<Vec<TcpRelay>, StateStoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RELAY_COLUMNS} FROM tcp_relays ORDER BY id"
        ))?;
        let relays = stmt
            .query_map([], relay_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(relays)
    }

    fn update_relay(&self, relay: &TcpRelay) -> Result<(), StateStoreError> {
        let changed = self
            .conn()
            .execute(
                r#"
                UPDATE tcp_relays
                SET listening_port = ?1, target_host = ?2, target_port = ?3,
                    timeout_secs = ?4, status = ?5
                WHERE id = ?6
                "#,
                params![
                    relay.spec.listening_port,
                    relay.spec.target_host,
                    relay.spec.target_port,
                    relay.spec.timeout_secs,
                    relay.last_known_status.as_str(),
                    relay.id,
                ],
            )
            .map_err(|e| {
                on_unique(
                    e,
                    format!("a relay already listens on port {}", relay.spec.listening_port),
                )
            })?;
        require_changed(changed, || format!("relay {}", relay.id))
    }

    fn set_relay_status(&self, id: i64, status: RelayStatus) -> Result<(), StateStoreError> {
        let changed = self.conn().execute(
            "UPDATE tcp_relays SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        require_changed(changed, || format!("relay {id}"))
    }

    fn delete_relay(&self, id: i64) -> Result<(), StateStoreError> {
        let changed = self
            .conn()
            .execute("DELETE FROM tcp_relays WHERE id = ?1", params![id])?;
        require_changed(changed, || format!("relay {id}"))
    }
}

fn now() -> DateTime<Utc> {
    // Stored at second precision; drop the fraction so returned records match reads.
    DateTime::from_timestamp(Utc::now().timestamp(), 0).unwrap_or_default()
}

fn on_unique(err: rusqlite::Error, message: String) -> StateStoreError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
            StateStoreError::Conflict(message)
        }
        _ => err.into(),
    }
}

fn require_changed(
    changed: usize,
    what: impl FnOnce() -> String,
) -> Result<(), StateStoreError> {
    if changed == 0 {
        return Err(StateStoreError::NotFound(what()));
    }
    Ok(())
}

fn encode_proxies(proxies: &Option<Vec<String>>) -> Result<Option<String>, StateStoreError> {
    proxies
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| StateStoreError::Invalid(format!("trusted_proxies: {e}")))
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn route_from_row(row: &Row<'_>) -> rusqlite::Result<ProxyRoute> {
    let name: String = row.get(1)?;
    let name = RouteName::parse(&name).map_err(|e| conversion_error(1, e))?;

    let proxies: Option<String> = row.get(6)?;
    let trusted_proxies = proxies
        .map(|raw| serde_json::from_str::<Vec<String>>(&raw))
        .transpose()
        .map_err(|e| conversion_error(6, e))?;

    let status: String = row.get(7)?;
    let created_at: i64 = row.get(8)?;

    Ok(ProxyRoute {
        id: row.get(0)?,
        name,
        spec: RouteSpec {
            hostname: row.get(2)?,
            port: row.get(3)?,
            upstream_address: row.get(4)?,
            tls_trust_pool: row.get(5)?,
            trusted_proxies,
        },
        last_known_status: RelayStatus::from_str(&status).unwrap_or(RelayStatus::Stopped),
        created_at: DateTime::from_timestamp(created_at, 0).unwrap_or_default(),
    })
}

fn relay_from_row(row: &Row<'_>) -> rusqlite::Result<TcpRelay> {
    let status: String = row.get(5)?;
    let created_at: i64 = row.get(6)?;

    Ok(TcpRelay {
        id: row.get(0)?,
        spec: RelaySpec {
            listening_port: row.get(1)?,
            target_host: row.get(2)?,
            target_port: row.get(3)?,
            timeout_secs: row.get(4)?,
        },
        last_known_status: RelayStatus::from_str(&status).unwrap_or(RelayStatus::Stopped),
        created_at: DateTime::from_timestamp(created_at, 0).unwrap_or_default(),
    })
}
