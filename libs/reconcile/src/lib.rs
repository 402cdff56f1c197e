//! # tailrelay-reconcile
//!
//! Primitives shared by the relay reconciler.
//!
//! - **Identity**: a relay's external name is derived from its defining
//!   attributes with SHA-256 over canonical JSON, so the same `(hostname, port)`
//!   pair maps to the same name on every machine and after every restart.
//! - **Keyed locks**: async mutual exclusion per identity, held across the
//!   read-live → decide → act → persist sequence of a single operation.
//!
//! # Invariants
//!
//! - Identity derivation has no random or machine-local input
//! - Two holders of the same key never overlap; distinct keys never block each other

mod error;
mod identity;
mod locks;

pub use error::IdentityError;
pub use identity::{identity_input, RouteName, ALL_SERVERS, NAME_HASH_WIDTH, NAME_PREFIX};
pub use locks::{KeyedGuard, KeyedLocks, LockKey};
