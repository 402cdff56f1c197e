//! Relay lifecycle reconciliation.
//!
//! The reconciler keeps persisted relay records in step with what is actually
//! live:
//! - Routes are live when Caddy has a server block under the route's name
//! - Relays are live when a forwarder process owns the listening port
//!
//! Every operation takes the per-identity lock for its whole
//! read-live -> decide -> act -> persist sequence, so two callers can never
//! interleave their view of the same route name or port. Persisted statuses are
//! an advisory cache; they are corrected from the live probe whenever a record
//! is read and only set to `running` after the external action succeeded.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tailrelay_reconcile::{KeyedGuard, KeyedLocks, LockKey, RouteName};
use tracing::{debug, info, warn};

use crate::caddy::{self, AdminClient, AdminError, ProxyAdmin};
use crate::config::Config;
use crate::error::RelayError;
use crate::forwarder::{
    PgrepProbe, ProbeStatus, ProcessProbe, RelayHandle, RelayRuntime, SocatSupervisor,
    SupervisorConfig,
};
use crate::model::{OnCreate, ProxyRoute, RelaySpec, RelayStatus, RouteSpec, TcpRelay};
use crate::state::{RelayStore, StateStore};

type Result<T> = std::result::Result<T, RelayError>;

/// Reconciler configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// How long a forwarder gets between SIGTERM and SIGKILL.
    pub stop_grace: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(10),
        }
    }
}

/// Result of one pass over every record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub routes_checked: usize,
    pub relays_checked: usize,
    /// Records whose persisted status disagreed with the live probe.
    pub corrected: usize,
    pub errors: Vec<String>,
}

/// Relay lifecycle reconciler.
pub struct Reconciler {
    store: Arc<dyn RelayStore>,
    admin: Arc<dyn ProxyAdmin>,
    runtime: Arc<dyn RelayRuntime>,
    probe: Arc<dyn ProcessProbe>,
    locks: KeyedLocks,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn RelayStore>,
        admin: Arc<dyn ProxyAdmin>,
        runtime: Arc<dyn RelayRuntime>,
        probe: Arc<dyn ProcessProbe>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            admin,
            runtime,
            probe,
            locks: KeyedLocks::new(),
            config,
        }
    }

    /// Wire the production collaborators from agent configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let store = Arc::new(StateStore::open(&config.db_path)?);
        let admin = Arc::new(AdminClient::new(
            config.admin_url.clone(),
            config.admin_timeout,
        )?);
        let probe: Arc<dyn ProcessProbe> = Arc::new(PgrepProbe::new(&config.forwarder_bin));
        let runtime = Arc::new(SocatSupervisor::new(
            SupervisorConfig {
                forwarder_bin: config.forwarder_bin.clone(),
                spawn_settle: config.spawn_settle,
                stderr_log: config.forwarder_log.clone(),
                ..SupervisorConfig::default()
            },
            probe.clone(),
        ));

        Ok(Self::new(
            store,
            admin,
            runtime,
            probe,
            ReconcilerConfig {
                stop_grace: config.stop_grace,
            },
        ))
    }

    // ---------------------------------------------------------------------
    // Routes
    // ---------------------------------------------------------------------

    /// Validate and persist a new route, optionally starting it.
    pub async fn create_route(&self, spec: RouteSpec, on_create: OnCreate) -> Result<ProxyRoute> {
        let spec = spec.normalized();
        spec.validate()?;
        let name = spec.name();

        let _guard = self.locks.lock(LockKey::Route(name.clone())).await;
        if self.store.get_route_by_name(&name)?.is_some() {
            return Err(RelayError::Conflict(format!(
                "route '{name}' for {}:{} already exists",
                spec.hostname, spec.port
            )));
        }

        let route = self.store.insert_route(&name, &spec, RelayStatus::Stopped)?;
        info!(
            id = route.id,
            name = %name,
            hostname = %spec.hostname,
            port = spec.port,
            "Route created"
        );

        match on_create {
            OnCreate::Persist => Ok(route),
            OnCreate::Start => self.start_route_locked(route).await,
        }
    }

    /// Push the route's server block. No-op when it is already live.
    pub async fn start_route(&self, id: i64) -> Result<ProxyRoute> {
        let (_guard, route) = self.lock_route(id).await?;
        self.start_route_locked(route).await
    }

    /// Remove the route's server block. No-op when it is not live.
    pub async fn stop_route(&self, id: i64) -> Result<ProxyRoute> {
        let (_guard, route) = self.lock_route(id).await?;
        self.stop_route_locked(route).await
    }

    /// Read a route with its status corrected from Caddy.
    pub async fn get_route(&self, id: i64) -> Result<ProxyRoute> {
        let (_guard, route) = self.lock_route(id).await?;
        self.reconcile_route_locked(route).await
    }

    /// Read a route by name with its status corrected from Caddy.
    pub async fn get_route_by_name(&self, name: &RouteName) -> Result<ProxyRoute> {
        let _guard = self.locks.lock(LockKey::Route(name.clone())).await;
        let route = self
            .store
            .get_route_by_name(name)?
            .ok_or_else(|| RelayError::NotFound(format!("route '{name}'")))?;
        self.reconcile_route_locked(route).await
    }

    /// Every route, newest first, with statuses corrected from one config read.
    pub async fn list_routes(&self) -> Result<Vec<ProxyRoute>> {
        Ok(self.reconcile_routes().await?.0)
    }

    /// Persisted record for `name`, or one synthesized from the live block.
    pub async fn recover_route(&self, name: &RouteName) -> Result<ProxyRoute> {
        let _guard = self.locks.lock(LockKey::Route(name.clone())).await;
        self.recover_route_locked(name).await
    }

    /// Stop a route by name, recovering a record for unknown live blocks first.
    pub async fn stop_route_by_name(&self, name: &RouteName) -> Result<ProxyRoute> {
        let _guard = self.locks.lock(LockKey::Route(name.clone())).await;
        let route = self.recover_route_locked(name).await?;
        self.stop_route_locked(route).await
    }

    /// Replace a route's configuration, moving a live route along with it.
    pub async fn update_route(&self, id: i64, spec: RouteSpec) -> Result<ProxyRoute> {
        let spec = spec.normalized();
        spec.validate()?;
        let new_name = spec.name();

        let (_guard, current) = loop {
            let seen = self.require_route(id)?;
            let guard = self
                .locks
                .lock_many([
                    LockKey::Route(seen.name.clone()),
                    LockKey::Route(new_name.clone()),
                ])
                .await;
            let current = self.require_route(id)?;
            if current.name == seen.name {
                break (guard, current);
            }
            debug!(id, "Route renamed while waiting for lock, retrying");
        };

        let renamed = current.name != new_name;
        if renamed {
            if let Some(other) = self.store.get_route_by_name(&new_name)? {
                return Err(RelayError::Conflict(format!(
                    "route '{new_name}' already exists (id {})",
                    other.id
                )));
            }
        }

        let observed = self.probe_route(&current.name).await?;
        if observed.is_running() {
            let block = caddy::encode(&new_name, &spec);
            if renamed {
                // Old and new blocks usually share a listen address, so they
                // can never be live at the same time.
                self.admin.swap_server(&current.name, &block).await?;
            } else {
                self.admin.replace_server(&block).await?;
            }
        }

        let updated = ProxyRoute {
            name: new_name,
            spec,
            last_known_status: observed,
            ..current
        };
        self.store.update_route(&updated)?;
        info!(
            id,
            old_name = %current.name,
            name = %updated.name,
            status = %updated.last_known_status,
            "Route updated"
        );
        Ok(updated)
    }

    /// Stop a route, then remove its record.
    pub async fn delete_route(&self, id: i64) -> Result<ProxyRoute> {
        let (_guard, route) = self.lock_route(id).await?;
        let route = self.stop_route_locked(route).await?;
        self.store.delete_route(route.id)?;
        info!(id, name = %route.name, "Route deleted");
        Ok(route)
    }

    /// Live status from Caddy. Nothing is persisted.
    pub async fn current_route_status(&self, id: i64) -> Result<RelayStatus> {
        let route = self.require_route(id)?;
        self.probe_route(&route.name).await
    }

    /// Caddy's whole running config.
    pub async fn live_config(&self) -> Result<Value> {
        Ok(self.admin.fetch_config().await?)
    }

    async fn lock_route(&self, id: i64) -> Result<(KeyedGuard, ProxyRoute)> {
        loop {
            let seen = self.require_route(id)?;
            let guard = self.locks.lock(LockKey::Route(seen.name.clone())).await;
            let current = self.require_route(id)?;
            if current.name == seen.name {
                return Ok((guard, current));
            }
            debug!(id, "Route renamed while waiting for lock, retrying");
        }
    }

    fn require_route(&self, id: i64) -> Result<ProxyRoute> {
        self.store
            .get_route(id)?
            .ok_or_else(|| RelayError::NotFound(format!("route {id}")))
    }

    async fn probe_route(&self, name: &RouteName) -> Result<RelayStatus> {
        let status = match self.admin.fetch_server(name.as_str()).await {
            Ok(_) => RelayStatus::Running,
            Err(AdminError::NotFound(_)) => RelayStatus::Stopped,
            Err(e) => return Err(e.into()),
        };
        debug!(name = %name, status = %status, "Probed route");
        Ok(status)
    }

    async fn start_route_locked(&self, route: ProxyRoute) -> Result<ProxyRoute> {
        let observed = self.probe_route(&route.name).await?;
        let route = self.resync_route(route, observed)?;
        if observed.is_running() {
            info!(id = route.id, name = %route.name, "Route already running");
            return Ok(route);
        }

        let block = caddy::encode(&route.name, &route.spec);
        self.admin.push_server(&block).await?;

        let route = self.mark_route(route, RelayStatus::Running)?;
        info!(
            id = route.id,
            name = %route.name,
            hostname = %route.spec.hostname,
            port = route.spec.port,
            upstream = %route.spec.upstream_address,
            "Route started"
        );
        Ok(route)
    }

    async fn stop_route_locked(&self, route: ProxyRoute) -> Result<ProxyRoute> {
        let observed = self.probe_route(&route.name).await?;
        let route = self.resync_route(route, observed)?;
        if !observed.is_running() {
            info!(id = route.id, name = %route.name, "Route already stopped");
            return Ok(route);
        }

        match self.admin.delete_server(&route.name).await {
            Ok(()) | Err(AdminError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let route = self.mark_route(route, RelayStatus::Stopped)?;
        info!(id = route.id, name = %route.name, "Route stopped");
        Ok(route)
    }

    async fn reconcile_route_locked(&self, route: ProxyRoute) -> Result<ProxyRoute> {
        let observed = self.probe_route(&route.name).await?;
        self.resync_route(route, observed)
    }

    async fn recover_route_locked(&self, name: &RouteName) -> Result<ProxyRoute> {
        if let Some(route) = self.store.get_route_by_name(name)? {
            return self.reconcile_route_locked(route).await;
        }

        let live = match self.admin.fetch_server(name.as_str()).await {
            Ok(live) => live,
            Err(AdminError::NotFound(_)) => {
                return Err(RelayError::NotFound(format!(
                    "route '{name}' has no record and no live server block"
                )))
            }
            Err(e) => return Err(e.into()),
        };

        let spec = caddy::decode(&live, name)?;
        let route = self.store.insert_route(name, &spec, RelayStatus::Running)?;
        info!(
            id = route.id,
            name = %name,
            hostname = %spec.hostname,
            port = spec.port,
            "Route recovered from live config"
        );
        Ok(route)
    }

    async fn reconcile_routes(&self) -> Result<(Vec<ProxyRoute>, usize)> {
        let live = self.admin.fetch_servers().await?;
        let routes = self.store.list_routes()?;

        let mut reconciled = Vec::with_capacity(routes.len());
        let mut corrected = 0;
        for route in routes {
            let observed = if live.contains_key(route.name.as_str()) {
                RelayStatus::Running
            } else {
                RelayStatus::Stopped
            };
            if observed == route.last_known_status {
                reconciled.push(route);
                continue;
            }

            // Drift in the snapshot; confirm under the lock before persisting.
            let _guard = self.locks.lock(LockKey::Route(route.name.clone())).await;
            let Some(current) = self.store.get_route(route.id)? else {
                continue;
            };
            if current.name != route.name {
                reconciled.push(current);
                continue;
            }
            let before = current.last_known_status;
            let current = self.reconcile_route_locked(current).await?;
            if current.last_known_status != before {
                corrected += 1;
            }
            reconciled.push(current);
        }

        Ok((reconciled, corrected))
    }

    fn resync_route(&self, mut route: ProxyRoute, observed: RelayStatus) -> Result<ProxyRoute> {
        if route.last_known_status != observed {
            warn!(
                id = route.id,
                name = %route.name,
                persisted = %route.last_known_status,
                observed = %observed,
                "Correcting drifted route status"
            );
            self.store.set_route_status(route.id, observed)?;
            route.last_known_status = observed;
        }
        Ok(route)
    }

    fn mark_route(&self, mut route: ProxyRoute, status: RelayStatus) -> Result<ProxyRoute> {
        self.store.set_route_status(route.id, status)?;
        route.last_known_status = status;
        Ok(route)
    }

    // ---------------------------------------------------------------------
    // TCP relays
    // ---------------------------------------------------------------------

    /// Validate and persist a new relay, optionally starting it.
    pub async fn create_relay(&self, spec: RelaySpec, on_create: OnCreate) -> Result<TcpRelay> {
        let spec = spec.normalized();
        spec.validate()?;
        let port = spec.listening_port;

        let _guard = self.locks.lock(LockKey::Port(port)).await;
        if let Some(existing) = self.store.get_relay_by_port(port)? {
            return Err(RelayError::Conflict(format!(
                "relay {} already listens on port {port}",
                existing.id
            )));
        }

        let relay = self.store.insert_relay(&spec, RelayStatus::Stopped)?;
        info!(
            id = relay.id,
            listening_port = port,
            target = %format!("{}:{}", spec.target_host, spec.target_port),
            "Relay created"
        );

        match on_create {
            OnCreate::Persist => Ok(relay),
            OnCreate::Start => self.start_relay_locked(relay).await,
        }
    }

    /// Spawn the relay's forwarder. No-op when one already owns the port.
    pub async fn start_relay(&self, id: i64) -> Result<TcpRelay> {
        let (_guard, relay) = self.lock_relay(id).await?;
        self.start_relay_locked(relay).await
    }

    /// Terminate the relay's forwarder. No-op when none is running.
    pub async fn stop_relay(&self, id: i64) -> Result<TcpRelay> {
        let (_guard, relay) = self.lock_relay(id).await?;
        self.stop_relay_locked(relay).await
    }

    /// Read a relay with its status corrected from the process table.
    pub async fn get_relay(&self, id: i64) -> Result<TcpRelay> {
        let (_guard, relay) = self.lock_relay(id).await?;
        self.reconcile_relay_locked(relay).await
    }

    /// Every relay with statuses corrected from one process-table scan.
    pub async fn list_relays(&self) -> Result<Vec<TcpRelay>> {
        Ok(self.reconcile_relays().await?.0)
    }

    /// Replace a relay's configuration, restarting it if it was running.
    pub async fn update_relay(&self, id: i64, spec: RelaySpec) -> Result<TcpRelay> {
        let spec = spec.normalized();
        spec.validate()?;
        let new_port = spec.listening_port;

        let (_guard, current) = loop {
            let seen = self.require_relay(id)?;
            let guard = self
                .locks
                .lock_many([
                    LockKey::Port(seen.listening_port()),
                    LockKey::Port(new_port),
                ])
                .await;
            let current = self.require_relay(id)?;
            if current.listening_port() == seen.listening_port() {
                break (guard, current);
            }
            debug!(id, "Relay moved while waiting for lock, retrying");
        };

        if current.listening_port() != new_port {
            if let Some(other) = self.store.get_relay_by_port(new_port)? {
                return Err(RelayError::Conflict(format!(
                    "relay {} already listens on port {new_port}",
                    other.id
                )));
            }
        }

        let observed = self.runtime.probe_status(current.listening_port()).await?;
        if let ProbeStatus::Running(pid) = observed {
            let handle = RelayHandle {
                listening_port: current.listening_port(),
                pid,
            };
            self.runtime.stop(&handle, self.config.stop_grace).await?;
        }

        let old_port = current.listening_port();
        let updated = TcpRelay {
            spec,
            last_known_status: RelayStatus::Stopped,
            ..current
        };
        self.store.update_relay(&updated)?;
        info!(
            id,
            old_port,
            listening_port = new_port,
            restart = observed.is_running(),
            "Relay updated"
        );

        if observed.is_running() {
            return self.start_relay_locked(updated).await;
        }
        Ok(updated)
    }

    /// Stop a relay, then remove its record.
    pub async fn delete_relay(&self, id: i64) -> Result<TcpRelay> {
        let (_guard, relay) = self.lock_relay(id).await?;
        let relay = self.stop_relay_locked(relay).await?;
        self.store.delete_relay(relay.id)?;
        info!(id, listening_port = relay.listening_port(), "Relay deleted");
        Ok(relay)
    }

    /// Live status from the process table. Nothing is persisted.
    pub async fn current_relay_status(&self, id: i64) -> Result<ProbeStatus> {
        let relay = self.require_relay(id)?;
        Ok(self.runtime.probe_status(relay.listening_port()).await?)
    }

    async fn lock_relay(&self, id: i64) -> Result<(KeyedGuard, TcpRelay)> {
        loop {
            let seen = self.require_relay(id)?;
            let guard = self.locks.lock(LockKey::Port(seen.listening_port())).await;
            let current = self.require_relay(id)?;
            if current.listening_port() == seen.listening_port() {
                return Ok((guard, current));
            }
            debug!(id, "Relay moved while waiting for lock, retrying");
        }
    }

    fn require_relay(&self, id: i64) -> Result<TcpRelay> {
        self.store
            .get_relay(id)?
            .ok_or_else(|| RelayError::NotFound(format!("relay {id}")))
    }

    async fn start_relay_locked(&self, relay: TcpRelay) -> Result<TcpRelay> {
        let port = relay.listening_port();
        let observed = self.runtime.probe_status(port).await?;
        let relay = self.resync_relay(relay, observed.into())?;
        if let ProbeStatus::Running(pid) = observed {
            info!(id = relay.id, listening_port = port, pid, "Relay already running");
            return Ok(relay);
        }

        self.runtime.ensure_port_available(port).await?;
        let handle = self.runtime.start(&relay.spec).await?;

        let relay = self.mark_relay(relay, RelayStatus::Running)?;
        info!(
            id = relay.id,
            listening_port = port,
            pid = handle.pid,
            target = %format!("{}:{}", relay.spec.target_host, relay.spec.target_port),
            "Relay started"
        );
        Ok(relay)
    }

    async fn stop_relay_locked(&self, relay: TcpRelay) -> Result<TcpRelay> {
        let port = relay.listening_port();
        let observed = self.runtime.probe_status(port).await?;
        let relay = self.resync_relay(relay, observed.into())?;
        let ProbeStatus::Running(pid) = observed else {
            info!(id = relay.id, listening_port = port, "Relay already stopped");
            return Ok(relay);
        };

        let handle = RelayHandle {
            listening_port: port,
            pid,
        };
        let outcome = self.runtime.stop(&handle, self.config.stop_grace).await?;

        let relay = self.mark_relay(relay, RelayStatus::Stopped)?;
        info!(
            id = relay.id,
            listening_port = port,
            pid,
            outcome = ?outcome,
            "Relay stopped"
        );
        Ok(relay)
    }

    async fn reconcile_relay_locked(&self, relay: TcpRelay) -> Result<TcpRelay> {
        let observed = self.runtime.probe_status(relay.listening_port()).await?;
        self.resync_relay(relay, observed.into())
    }

    async fn reconcile_relays(&self) -> Result<(Vec<TcpRelay>, usize)> {
        let owners = self.probe.find_owners().await?;
        let relays = self.store.list_relays()?;

        let mut reconciled = Vec::with_capacity(relays.len());
        let mut corrected = 0;
        for relay in relays {
            let port = relay.listening_port();
            let observed = if owners.contains_key(&port) {
                RelayStatus::Running
            } else {
                RelayStatus::Stopped
            };
            if observed == relay.last_known_status {
                reconciled.push(relay);
                continue;
            }

            let _guard = self.locks.lock(LockKey::Port(port)).await;
            let Some(current) = self.store.get_relay(relay.id)? else {
                continue;
            };
            if current.listening_port() != port {
                reconciled.push(current);
                continue;
            }
            let before = current.last_known_status;
            let current = self.reconcile_relay_locked(current).await?;
            if current.last_known_status != before {
                corrected += 1;
            }
            reconciled.push(current);
        }

        Ok((reconciled, corrected))
    }

    fn resync_relay(&self, mut relay: TcpRelay, observed: RelayStatus) -> Result<TcpRelay> {
        if relay.last_known_status != observed {
            warn!(
                id = relay.id,
                listening_port = relay.listening_port(),
                persisted = %relay.last_known_status,
                observed = %observed,
                "Correcting drifted relay status"
            );
            self.store.set_relay_status(relay.id, observed)?;
            relay.last_known_status = observed;
        }
        Ok(relay)
    }

    fn mark_relay(&self, mut relay: TcpRelay, status: RelayStatus) -> Result<TcpRelay> {
        self.store.set_relay_status(relay.id, status)?;
        relay.last_known_status = status;
        Ok(relay)
    }

    // ---------------------------------------------------------------------
    // Sweep
    // ---------------------------------------------------------------------

    /// Reconcile-read every record. Failures are collected, not returned.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        match self.reconcile_routes().await {
            Ok((routes, corrected)) => {
                report.routes_checked = routes.len();
                report.corrected += corrected;
            }
            Err(e) => report.errors.push(format!("routes: {e}")),
        }

        match self.reconcile_relays().await {
            Ok((relays, corrected)) => {
                report.relays_checked = relays.len();
                report.corrected += corrected;
            }
            Err(e) => report.errors.push(format!("relays: {e}")),
        }

        report
    }
}
