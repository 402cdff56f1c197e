//! Integration tests for relay reconciliation.
//!
//! Uses MockAdmin and MockForwarder in place of Caddy and socat, with an
//! in-memory state store, so every live change can be made out-of-band.

use std::sync::Arc;

use serde_json::json;
use tailrelay_agent::caddy::{encode, MockAdmin};
use tailrelay_agent::forwarder::{MockForwarder, ProbeStatus};
use tailrelay_agent::state::{RelayStore, StateStore};
use tailrelay_agent::{
    OnCreate, Reconciler, ReconcilerConfig, RelayError, RelaySpec, RelayStatus, RouteName,
    RouteSpec,
};

struct Harness {
    reconciler: Arc<Reconciler>,
    store: Arc<StateStore>,
    admin: Arc<MockAdmin>,
    forwarder: Arc<MockForwarder>,
}

fn harness() -> Harness {
    let store = Arc::new(StateStore::open_in_memory().unwrap());
    let admin = Arc::new(MockAdmin::new());
    let forwarder = Arc::new(MockForwarder::new());
    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        admin.clone(),
        forwarder.clone(),
        forwarder.clone(),
        ReconcilerConfig::default(),
    ));
    Harness {
        reconciler,
        store,
        admin,
        forwarder,
    }
}

fn route_spec() -> RouteSpec {
    RouteSpec::new("example.com", 443, "10.0.0.1:8080")
}

fn relay_spec() -> RelaySpec {
    RelaySpec::new(9000, "10.0.0.5", 80)
}

// -------------------------------------------------------------------------
// Identity and creation
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_duplicate_route_is_conflict() {
    let h = harness();
    let first = h
        .reconciler
        .create_route(route_spec(), OnCreate::Persist)
        .await
        .unwrap();
    assert_eq!(first.name, RouteName::derive("example.com", 443));
    assert_eq!(first.last_known_status, RelayStatus::Stopped);

    // Case and whitespace variants share the identity.
    let err = h
        .reconciler
        .create_route(
            RouteSpec::new(" EXAMPLE.com", 443, "10.0.0.9:9"),
            OnCreate::Persist,
        )
        .await
        .unwrap_err();
    assert!(err.is_conflict(), "{err:?}");
    assert_eq!(h.admin.push_count(), 0);
}

#[tokio::test]
async fn test_duplicate_listening_port_is_conflict() {
    let h = harness();
    h.reconciler
        .create_relay(relay_spec(), OnCreate::Persist)
        .await
        .unwrap();

    let err = h
        .reconciler
        .create_relay(RelaySpec::new(9000, "10.0.0.6", 443), OnCreate::Persist)
        .await
        .unwrap_err();
    assert!(err.is_conflict());
}

#[tokio::test]
async fn test_concurrent_creates_yield_one_conflict() {
    let h = harness();
    let (a, b) = tokio::join!(
        h.reconciler.create_route(route_spec(), OnCreate::Start),
        h.reconciler.create_route(route_spec(), OnCreate::Start),
    );

    let results = [a, b];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(RelayError::Conflict(_))))
            .count(),
        1
    );
    assert_eq!(h.admin.push_count(), 1);
}

// -------------------------------------------------------------------------
// Start / stop
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_route_start_and_stop_are_idempotent() {
    let h = harness();
    let route = h
        .reconciler
        .create_route(route_spec(), OnCreate::Persist)
        .await
        .unwrap();

    let started = h.reconciler.start_route(route.id).await.unwrap();
    assert_eq!(started.last_known_status, RelayStatus::Running);
    let again = h.reconciler.start_route(route.id).await.unwrap();
    assert_eq!(again.last_known_status, RelayStatus::Running);
    assert_eq!(h.admin.push_count(), 1);
    assert!(h.admin.is_live(route.name.as_str()));

    let stopped = h.reconciler.stop_route(route.id).await.unwrap();
    assert_eq!(stopped.last_known_status, RelayStatus::Stopped);
    let again = h.reconciler.stop_route(route.id).await.unwrap();
    assert_eq!(again.last_known_status, RelayStatus::Stopped);
    assert_eq!(h.admin.delete_count(), 1);
    assert!(!h.admin.is_live(route.name.as_str()));
}

#[tokio::test]
async fn test_relay_start_and_stop_are_idempotent() {
    let h = harness();
    let relay = h
        .reconciler
        .create_relay(relay_spec(), OnCreate::Persist)
        .await
        .unwrap();

    h.reconciler.start_relay(relay.id).await.unwrap();
    let again = h.reconciler.start_relay(relay.id).await.unwrap();
    assert_eq!(again.last_known_status, RelayStatus::Running);
    assert_eq!(h.forwarder.start_count(), 1);

    h.reconciler.stop_relay(relay.id).await.unwrap();
    let again = h.reconciler.stop_relay(relay.id).await.unwrap();
    assert_eq!(again.last_known_status, RelayStatus::Stopped);
    assert_eq!(h.forwarder.stop_count(), 1);
}

#[tokio::test]
async fn test_concurrent_starts_spawn_once() {
    let h = harness();
    let relay = h
        .reconciler
        .create_relay(relay_spec(), OnCreate::Persist)
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        h.reconciler.start_relay(relay.id),
        h.reconciler.start_relay(relay.id),
    );
    assert_eq!(a.unwrap().last_known_status, RelayStatus::Running);
    assert_eq!(b.unwrap().last_known_status, RelayStatus::Running);
    assert_eq!(h.forwarder.start_count(), 1);
}

#[tokio::test]
async fn test_start_with_stale_running_status_still_pushes() {
    let h = harness();
    let route = h
        .reconciler
        .create_route(route_spec(), OnCreate::Persist)
        .await
        .unwrap();
    // Persisted cache claims running, but nothing is live.
    h.store
        .set_route_status(route.id, RelayStatus::Running)
        .unwrap();

    let started = h.reconciler.start_route(route.id).await.unwrap();
    assert_eq!(started.last_known_status, RelayStatus::Running);
    assert_eq!(h.admin.push_count(), 1);
}

#[tokio::test]
async fn test_port_bound_elsewhere_is_conflict_at_start() {
    let h = harness();
    let relay = h
        .reconciler
        .create_relay(relay_spec(), OnCreate::Persist)
        .await
        .unwrap();
    h.forwarder.bind_elsewhere(9000);

    let err = h.reconciler.start_relay(relay.id).await.unwrap_err();
    assert!(err.is_conflict(), "{err:?}");
    assert_eq!(h.forwarder.start_count(), 0);

    let persisted = h.store.get_relay(relay.id).unwrap().unwrap();
    assert_eq!(persisted.last_known_status, RelayStatus::Stopped);
}

#[tokio::test]
async fn test_unreachable_admin_leaves_route_stopped() {
    let h = harness();
    let route = h
        .reconciler
        .create_route(route_spec(), OnCreate::Persist)
        .await
        .unwrap();
    h.admin.set_unreachable(true);

    let err = h.reconciler.start_route(route.id).await.unwrap_err();
    assert!(matches!(err, RelayError::UpstreamUnreachable { .. }));

    let persisted = h.store.get_route(route.id).unwrap().unwrap();
    assert_eq!(persisted.last_known_status, RelayStatus::Stopped);
}

#[tokio::test]
async fn test_unknown_ids_are_not_found() {
    let h = harness();
    assert!(h.reconciler.start_route(42).await.unwrap_err().is_not_found());
    assert!(h.reconciler.stop_relay(42).await.unwrap_err().is_not_found());
    assert!(h.reconciler.get_relay(42).await.unwrap_err().is_not_found());
}

// -------------------------------------------------------------------------
// Passive crash detection
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_crashed_forwarder_is_reported_stopped() {
    let h = harness();
    let relay = h
        .reconciler
        .create_relay(relay_spec(), OnCreate::Start)
        .await
        .unwrap();
    assert_eq!(relay.last_known_status, RelayStatus::Running);

    h.forwarder.crash(9000);

    // Live-only query does not touch the record.
    let live = h.reconciler.current_relay_status(relay.id).await.unwrap();
    assert_eq!(live, ProbeStatus::Stopped);
    let persisted = h.store.get_relay(relay.id).unwrap().unwrap();
    assert_eq!(persisted.last_known_status, RelayStatus::Running);

    let read = h.reconciler.get_relay(relay.id).await.unwrap();
    assert_eq!(read.last_known_status, RelayStatus::Stopped);
    let persisted = h.store.get_relay(relay.id).unwrap().unwrap();
    assert_eq!(persisted.last_known_status, RelayStatus::Stopped);
}

#[tokio::test]
async fn test_list_corrects_drift_both_ways() {
    let h = harness();
    let running = h
        .reconciler
        .create_route(route_spec(), OnCreate::Start)
        .await
        .unwrap();
    let idle = h
        .reconciler
        .create_route(
            RouteSpec::new("api.example.com", 8443, "10.0.0.2:80"),
            OnCreate::Persist,
        )
        .await
        .unwrap();

    // Caddy reloaded without the first block; someone loaded the second.
    h.admin.remove_live(running.name.as_str());
    let idle_block = encode(&idle.name, &idle.spec);
    h.admin.insert_live(idle.name.as_str(), idle_block.server_value());

    let routes = h.reconciler.list_routes().await.unwrap();
    assert_eq!(routes.len(), 2);
    let status_of = |id: i64| {
        routes
            .iter()
            .find(|r| r.id == id)
            .map(|r| r.last_known_status)
            .unwrap()
    };
    assert_eq!(status_of(running.id), RelayStatus::Stopped);
    assert_eq!(status_of(idle.id), RelayStatus::Running);

    assert_eq!(
        h.store.get_route(running.id).unwrap().unwrap().last_known_status,
        RelayStatus::Stopped
    );
}

#[tokio::test]
async fn test_list_relays_uses_process_table() {
    let h = harness();
    let a = h
        .reconciler
        .create_relay(relay_spec(), OnCreate::Start)
        .await
        .unwrap();
    let b = h
        .reconciler
        .create_relay(RelaySpec::new(9001, "10.0.0.6", 22), OnCreate::Persist)
        .await
        .unwrap();

    h.forwarder.crash(9000);
    h.forwarder.adopt(9001, 4242);

    let relays = h.reconciler.list_relays().await.unwrap();
    let status_of = |id: i64| {
        relays
            .iter()
            .find(|r| r.id == id)
            .map(|r| r.last_known_status)
            .unwrap()
    };
    assert_eq!(status_of(a.id), RelayStatus::Stopped);
    assert_eq!(status_of(b.id), RelayStatus::Running);
}

#[tokio::test]
async fn test_sweep_corrects_every_record() {
    let h = harness();
    let route = h
        .reconciler
        .create_route(route_spec(), OnCreate::Start)
        .await
        .unwrap();
    let relay = h
        .reconciler
        .create_relay(relay_spec(), OnCreate::Start)
        .await
        .unwrap();

    h.admin.remove_live(route.name.as_str());
    h.forwarder.crash(9000);

    let report = h.reconciler.sweep().await;
    assert_eq!(report.routes_checked, 1);
    assert_eq!(report.relays_checked, 1);
    assert_eq!(report.corrected, 2);
    assert!(report.errors.is_empty());

    assert_eq!(
        h.store.get_route(route.id).unwrap().unwrap().last_known_status,
        RelayStatus::Stopped
    );
    assert_eq!(
        h.store.get_relay(relay.id).unwrap().unwrap().last_known_status,
        RelayStatus::Stopped
    );

    let report = h.reconciler.sweep().await;
    assert_eq!(report.corrected, 0);
}

// -------------------------------------------------------------------------
// Recovery from live config
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_recover_synthesizes_record_from_live_block() {
    let h = harness();
    let spec = RouteSpec::new("legacy.example.com", 8080, "127.0.0.1:3000")
        .with_tls_trust_pool("/etc/ssl/internal.pem");
    let name = RouteName::parse("srvlegacy").unwrap();
    h.admin
        .insert_live(name.as_str(), encode(&name, &spec).server_value());

    let route = h.reconciler.recover_route(&name).await.unwrap();
    assert_eq!(route.name, name);
    assert_eq!(route.spec, spec);
    assert_eq!(route.last_known_status, RelayStatus::Running);

    // Second call returns the persisted record.
    let again = h.reconciler.recover_route(&name).await.unwrap();
    assert_eq!(again.id, route.id);
    assert_eq!(h.store.list_routes().unwrap().len(), 1);
}

#[tokio::test]
async fn test_recover_existing_record_resyncs_status() {
    let h = harness();
    let route = h
        .reconciler
        .create_route(route_spec(), OnCreate::Persist)
        .await
        .unwrap();
    assert_eq!(route.last_known_status, RelayStatus::Stopped);
    h.admin.insert_live(
        route.name.as_str(),
        encode(&route.name, &route.spec).server_value(),
    );

    let recovered = h.reconciler.recover_route(&route.name).await.unwrap();
    assert_eq!(recovered.id, route.id);
    assert_eq!(recovered.last_known_status, RelayStatus::Running);
    assert_eq!(
        h.store.get_route(route.id).unwrap().unwrap().last_known_status,
        RelayStatus::Running
    );

    h.admin.remove_live(route.name.as_str());
    let recovered = h.reconciler.recover_route(&route.name).await.unwrap();
    assert_eq!(recovered.last_known_status, RelayStatus::Stopped);
}

#[tokio::test]
async fn test_recover_incomplete_block_persists_nothing() {
    let h = harness();
    let name = RouteName::parse("srvhandmade").unwrap();
    h.admin.insert_live(
        name.as_str(),
        json!({
            "listen": [":443"],
            "routes": [{"handle": [{"handler": "static_response", "body": "ok"}]}]
        }),
    );

    let err = h.reconciler.recover_route(&name).await.unwrap_err();
    assert!(matches!(err, RelayError::IncompleteConfig { .. }), "{err:?}");
    assert!(h.store.list_routes().unwrap().is_empty());
}

#[tokio::test]
async fn test_recover_unknown_name_is_not_found() {
    let h = harness();
    let err = h
        .reconciler
        .recover_route(&RouteName::parse("srvmissing").unwrap())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_stop_by_name_recovers_then_stops() {
    let h = harness();
    let spec = route_spec();
    let name = spec.name();
    h.admin
        .insert_live(name.as_str(), encode(&name, &spec).server_value());

    let route = h.reconciler.stop_route_by_name(&name).await.unwrap();
    assert_eq!(route.last_known_status, RelayStatus::Stopped);
    assert!(!h.admin.is_live(name.as_str()));

    let persisted = h.reconciler.get_route_by_name(&name).await.unwrap();
    assert_eq!(persisted.id, route.id);
    assert_eq!(persisted.last_known_status, RelayStatus::Stopped);
}

// -------------------------------------------------------------------------
// Update and delete
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_update_running_route_moves_block() {
    let h = harness();
    let route = h
        .reconciler
        .create_route(route_spec(), OnCreate::Start)
        .await
        .unwrap();

    let updated = h
        .reconciler
        .update_route(route.id, RouteSpec::new("www.example.com", 443, "10.0.0.1:8080"))
        .await
        .unwrap();

    assert_ne!(updated.name, route.name);
    assert_eq!(updated.last_known_status, RelayStatus::Running);
    assert_eq!(h.admin.live_names(), vec![updated.name.to_string()]);
    assert_eq!(h.admin.swap_count(), 1);
    assert_eq!(h.admin.push_count(), 1);
    assert_eq!(h.admin.delete_count(), 0);
}

#[tokio::test]
async fn test_rejected_rename_leaves_old_block_and_record() {
    let h = harness();
    let route = h
        .reconciler
        .create_route(route_spec(), OnCreate::Start)
        .await
        .unwrap();
    // Another server already listens on the target port.
    h.admin.insert_live("manual", json!({"listen": [":8443"]}));

    let err = h
        .reconciler
        .update_route(route.id, RouteSpec::new("example.com", 8443, "10.0.0.1:8080"))
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::UpstreamRejected { .. }), "{err:?}");

    assert!(h.admin.is_live(route.name.as_str()));
    let persisted = h.store.get_route(route.id).unwrap().unwrap();
    assert_eq!(persisted.name, route.name);
    assert_eq!(persisted.spec, route.spec);
}

#[tokio::test]
async fn test_update_same_identity_replaces_in_place() {
    let h = harness();
    let route = h
        .reconciler
        .create_route(route_spec(), OnCreate::Start)
        .await
        .unwrap();

    let updated = h
        .reconciler
        .update_route(
            route.id,
            RouteSpec::new("example.com", 443, "10.0.0.99:8080").with_trusted_proxies(["10.0.0.0/8"]),
        )
        .await
        .unwrap();

    assert_eq!(updated.name, route.name);
    assert_eq!(h.admin.replace_count(), 1);
    let live = h.admin.live_server(route.name.as_str()).unwrap();
    let proxy = &live["routes"][0]["handle"][0]["routes"][0]["handle"][0];
    assert_eq!(proxy["upstreams"][0]["dial"], "10.0.0.99:8080");
}

#[tokio::test]
async fn test_update_into_existing_identity_is_conflict() {
    let h = harness();
    let a = h
        .reconciler
        .create_route(route_spec(), OnCreate::Persist)
        .await
        .unwrap();
    h.reconciler
        .create_route(RouteSpec::new("other.example.com", 443, "b:1"), OnCreate::Persist)
        .await
        .unwrap();

    let err = h
        .reconciler
        .update_route(a.id, RouteSpec::new("other.example.com", 443, "c:1"))
        .await
        .unwrap_err();
    assert!(err.is_conflict());
}

#[tokio::test]
async fn test_update_running_relay_restarts_on_new_port() {
    let h = harness();
    let relay = h
        .reconciler
        .create_relay(relay_spec(), OnCreate::Start)
        .await
        .unwrap();

    let updated = h
        .reconciler
        .update_relay(relay.id, RelaySpec::new(9100, "10.0.0.5", 80).with_timeout(30))
        .await
        .unwrap();

    assert_eq!(updated.last_known_status, RelayStatus::Running);
    assert_eq!(updated.spec.timeout_secs, Some(30));
    assert!(!h.forwarder.is_running(9000));
    assert!(h.forwarder.is_running(9100));
    assert_eq!(h.forwarder.start_count(), 2);
}

#[tokio::test]
async fn test_update_stopped_relay_stays_stopped() {
    let h = harness();
    let relay = h
        .reconciler
        .create_relay(relay_spec(), OnCreate::Persist)
        .await
        .unwrap();

    let updated = h
        .reconciler
        .update_relay(relay.id, RelaySpec::new(9000, "10.0.0.7", 8080))
        .await
        .unwrap();
    assert_eq!(updated.last_known_status, RelayStatus::Stopped);
    assert_eq!(updated.spec.target_host, "10.0.0.7");
    assert_eq!(h.forwarder.start_count(), 0);
}

#[tokio::test]
async fn test_delete_stops_before_removing() {
    let h = harness();
    let route = h
        .reconciler
        .create_route(route_spec(), OnCreate::Start)
        .await
        .unwrap();
    let relay = h
        .reconciler
        .create_relay(relay_spec(), OnCreate::Start)
        .await
        .unwrap();

    h.reconciler.delete_route(route.id).await.unwrap();
    h.reconciler.delete_relay(relay.id).await.unwrap();

    assert!(h.admin.live_names().is_empty());
    assert!(!h.forwarder.is_running(9000));
    assert!(h.reconciler.get_route(route.id).await.unwrap_err().is_not_found());
    assert!(h.reconciler.get_relay(relay.id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_delete_keeps_record_when_stop_fails() {
    let h = harness();
    let route = h
        .reconciler
        .create_route(route_spec(), OnCreate::Start)
        .await
        .unwrap();
    h.admin.set_unreachable(true);

    assert!(h.reconciler.delete_route(route.id).await.is_err());
    assert!(h.store.get_route(route.id).unwrap().is_some());
}

#[tokio::test]
async fn test_live_config_passthrough() {
    let h = harness();
    assert!(h.reconciler.live_config().await.unwrap().is_null());

    let route = h
        .reconciler
        .create_route(route_spec(), OnCreate::Start)
        .await
        .unwrap();
    let config = h.reconciler.live_config().await.unwrap();
    assert!(config["apps"]["http"]["servers"][route.name.as_str()].is_object());
}
