//! Local state persistence for relay records.
//!
//! SQLite-backed storage for:
//! - Proxy routes (name, hostname, port, upstream, TLS/proxy options)
//! - TCP relays (listening port, target, timeout)
//!
//! The status column is an advisory cache; the reconciler corrects it from
//! live probes on every read.

mod store;

pub use store::{RelayStore, StateStore, StateStoreError};
