//! Reverse-proxy routes through Caddy's admin API.
//!
//! - `codec`: route spec <-> native server block
//! - `admin`: the admin API client and the `ProxyAdmin` seam
//! - `mock`: in-memory `ProxyAdmin` for tests and dry runs

mod admin;
mod codec;
mod mock;

pub use admin::{merge_server, remove_server, AdminClient, AdminError, ProxyAdmin};
pub use codec::{
    decode, encode, listen_port, CodecError, Handler, NativeBlock, ReverseProxy, RouteConfig,
    ServerConfig, UPSTREAM_HOSTPORT,
};
pub use mock::MockAdmin;
