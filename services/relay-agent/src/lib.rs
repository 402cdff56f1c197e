//! tailrelay agent library
//!
//! Keeps persisted relay records in step with what is actually live. Two kinds
//! of relay are managed:
//!
//! - **Routes**: HTTP(S) reverse-proxy routes, delegated to Caddy through its
//!   admin API
//! - **TCP relays**: raw port forwarders, run as supervised socat processes
//!
//! ## Architecture
//!
//! ```text
//! Reconciler
//! ├── RelayStore    (SQLite records, advisory status)
//! ├── ProxyAdmin    (Caddy admin API)
//! ├── RelayRuntime  (forwarder supervisor)
//! └── ProcessProbe  (process table scan)
//! ```
//!
//! ## Modules
//!
//! - `caddy`: native server blocks and the admin API client
//! - `forwarder`: socat supervision and process probing
//! - `state`: local SQLite state persistence
//! - `reconciler`: the relay lifecycle state machine
//! - `sweep`: periodic status sweep

pub mod caddy;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod model;
pub mod reconciler;
pub mod state;
pub mod sweep;

// Re-export commonly used types
pub use caddy::MockAdmin;
pub use config::Config;
pub use error::RelayError;
pub use forwarder::{MockForwarder, ProbeStatus};
pub use model::{OnCreate, ProxyRoute, RelaySpec, RelayStatus, RouteSpec, TcpRelay};
pub use reconciler::{Reconciler, ReconcilerConfig, SweepReport};
pub use state::StateStore;
pub use sweep::Sweeper;
pub use tailrelay_reconcile::RouteName;
