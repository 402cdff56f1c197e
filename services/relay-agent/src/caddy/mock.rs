//! In-memory stand-in for the Caddy admin API.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tailrelay_reconcile::{RouteName, ALL_SERVERS};
use tracing::debug;

use super::admin::{AdminError, ProxyAdmin};
use super::codec::NativeBlock;

/// Mock admin API holding live server blocks in memory.
pub struct MockAdmin {
    servers: Mutex<BTreeMap<String, Value>>,
    pushes: AtomicUsize,
    swaps: AtomicUsize,
    replaces: AtomicUsize,
    deletes: AtomicUsize,
    unreachable: AtomicBool,
}

impl MockAdmin {
    pub fn new() -> Self {
        Self {
            servers: Mutex::new(BTreeMap::new()),
            pushes: AtomicUsize::new(0),
            swaps: AtomicUsize::new(0),
            replaces: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            unreachable: AtomicBool::new(false),
        }
    }

    /// Put a server block live as if another tool had loaded it.
    pub fn insert_live(&self, name: &str, server: Value) {
        self.servers().insert(name.to_string(), server);
    }

    /// Drop a server block as if Caddy had been reloaded without it.
    pub fn remove_live(&self, name: &str) -> Option<Value> {
        self.servers().remove(name)
    }

    pub fn is_live(&self, name: &str) -> bool {
        self.servers().contains_key(name)
    }

    pub fn live_names(&self) -> Vec<String> {
        self.servers().keys().cloned().collect()
    }

    pub fn live_server(&self, name: &str) -> Option<Value> {
        self.servers().get(name).cloned()
    }

    pub fn push_count(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }

    pub fn swap_count(&self) -> usize {
        self.swaps.load(Ordering::SeqCst)
    }

    pub fn replace_count(&self) -> usize {
        self.replaces.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Make every call fail as if the admin endpoint were down.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    fn servers(&self) -> MutexGuard<'_, BTreeMap<String, Value>> {
        self.servers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_reachable(&self) -> Result<(), AdminError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(AdminError::Unreachable {
                url: "mock://caddy".to_string(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for MockAdmin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProxyAdmin for MockAdmin {
    async fn fetch_config(&self) -> Result<Value, AdminError> {
        self.check_reachable()?;
        let servers = self.servers();
        if servers.is_empty() {
            return Ok(Value::Null);
        }
        let servers: Map<String, Value> = servers.clone().into_iter().collect();
        Ok(json!({ "apps": { "http": { "servers": servers } } }))
    }

    async fn fetch_server(&self, name: &str) -> Result<Value, AdminError> {
        self.check_reachable()?;
        let servers = self.servers();
        if name == ALL_SERVERS {
            return Ok(Value::Object(servers.clone().into_iter().collect()));
        }
        servers
            .get(name)
            .cloned()
            .ok_or_else(|| AdminError::NotFound(name.to_string()))
    }

    async fn push_server(&self, block: &NativeBlock) -> Result<(), AdminError> {
        self.check_reachable()?;
        debug!(name = %block.name, "[MOCK] Loading server block");
        let mut servers = self.servers();
        let server = block.server_value();
        check_listeners(&servers, block.name.as_str(), &server)?;
        servers.insert(block.name.to_string(), server);
        self.pushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn swap_server(&self, old: &RouteName, block: &NativeBlock) -> Result<(), AdminError> {
        self.check_reachable()?;
        debug!(old = %old, name = %block.name, "[MOCK] Swapping server block");
        let mut servers = self.servers();
        let mut next = servers.clone();
        next.remove(old.as_str());
        let server = block.server_value();
        check_listeners(&next, block.name.as_str(), &server)?;
        next.insert(block.name.to_string(), server);
        *servers = next;
        self.swaps.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn replace_server(&self, block: &NativeBlock) -> Result<(), AdminError> {
        self.check_reachable()?;
        let mut servers = self.servers();
        let server = block.server_value();
        check_listeners(&servers, block.name.as_str(), &server)?;
        let slot = servers
            .get_mut(block.name.as_str())
            .ok_or_else(|| AdminError::NotFound(block.name.to_string()))?;
        *slot = server;
        self.replaces.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_server(&self, name: &RouteName) -> Result<(), AdminError> {
        self.check_reachable()?;
        debug!(name = %name, "[MOCK] Deleting server block");
        self.servers()
            .remove(name.as_str())
            .ok_or_else(|| AdminError::NotFound(name.to_string()))?;
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn listen_addresses(server: &Value) -> Vec<String> {
    server
        .get("listen")
        .and_then(Value::as_array)
        .map(|addrs| {
            addrs
                .iter()
                .filter_map(|a| a.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Caddy refuses a config in which two servers share a listen address.
fn check_listeners(
    servers: &BTreeMap<String, Value>,
    name: &str,
    server: &Value,
) -> Result<(), AdminError> {
    let wanted = listen_addresses(server);
    for (other, value) in servers.iter().filter(|(other, _)| other.as_str() != name) {
        if let Some(addr) = listen_addresses(value).into_iter().find(|a| wanted.contains(a)) {
            return Err(AdminError::Rejected {
                status: 400,
                body: format!(
                    "loading config: server {name}: listener address repeated: tcp/{addr} (already claimed by server '{other}')"
                ),
            });
        }
    }
    Ok(())
}
