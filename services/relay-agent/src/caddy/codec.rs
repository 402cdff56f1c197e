//! Mapping between a [`RouteSpec`] and Caddy's native server block.
//!
//! The structures mirror the subset of Caddy's JSON config this agent writes.
//! Decoding is lenient: unknown handlers and fields are ignored, so blocks
//! edited by hand or by other tools can still be recovered when the parts we
//! need are present.
//!
//! Reference: https://caddyserver.com/docs/json/apps/http/servers/

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tailrelay_reconcile::RouteName;
use thiserror::Error;

use crate::model::RouteSpec;

/// Placeholder Caddy expands to the selected upstream's `host:port`.
pub const UPSTREAM_HOSTPORT: &str = "{http.reverse_proxy.upstream.hostport}";

/// Errors decoding a live server block.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("server '{name}' has no recoverable {missing}")]
    Incomplete { name: String, missing: &'static str },

    #[error("server '{name}' is not a valid server block: {source}")]
    Malformed {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

/// One server block, ready to be written under `apps.http.servers.<name>`.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeBlock {
    pub name: RouteName,
    pub server: ServerConfig,
}

impl NativeBlock {
    /// The server block as JSON.
    pub fn server_value(&self) -> Value {
        // ServerConfig only holds strings, bools, maps and sequences.
        serde_json::to_value(&self.server).unwrap_or(Value::Null)
    }

    /// `{ "<name>": <server> }`
    pub fn to_value(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert(self.name.to_string(), self.server_value());
        Value::Object(map)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub listen: Vec<String>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteConfig {
    #[serde(rename = "match", default, skip_serializing_if = "Vec::is_empty")]
    pub matchers: Vec<MatcherSet>,
    #[serde(default)]
    pub handle: Vec<Handler>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub terminal: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatcherSet {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub host: Vec<String>,
}

/// HTTP handler module, tagged by Caddy's `handler` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "handler", rename_all = "snake_case")]
pub enum Handler {
    Subroute {
        #[serde(default)]
        routes: Vec<RouteConfig>,
    },
    ReverseProxy(ReverseProxy),
    /// Any handler this agent does not manage.
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReverseProxy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HeaderOps>,
    #[serde(default)]
    pub upstreams: Vec<Upstream>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<Transport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trusted_proxies: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeaderOps {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<HeaderRewrite>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeaderRewrite {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub set: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Upstream {
    #[serde(default)]
    pub dial: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transport {
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TransportTls>,
}

fn default_protocol() -> String {
    "http".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransportTls {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<CaPool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaPool {
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub pem_files: Vec<String>,
}

/// Build the server block for a route. Deterministic for a given input.
pub fn encode(name: &RouteName, spec: &RouteSpec) -> NativeBlock {
    let transport = spec.tls_trust_pool.as_ref().map(|pem| Transport {
        protocol: default_protocol(),
        tls: Some(TransportTls {
            ca: Some(CaPool {
                provider: "file".to_string(),
                pem_files: vec![pem.clone()],
            }),
        }),
    });

    let proxy = ReverseProxy {
        headers: Some(HeaderOps {
            request: Some(HeaderRewrite {
                set: BTreeMap::from([(
                    "Host".to_string(),
                    vec![UPSTREAM_HOSTPORT.to_string()],
                )]),
            }),
        }),
        upstreams: vec![Upstream {
            dial: spec.upstream_address.clone(),
        }],
        transport,
        trusted_proxies: spec.trusted_proxies.clone(),
    };

    let route = RouteConfig {
        matchers: vec![MatcherSet {
            host: vec![spec.hostname.clone()],
        }],
        handle: vec![Handler::Subroute {
            routes: vec![RouteConfig {
                matchers: Vec::new(),
                handle: vec![Handler::ReverseProxy(proxy)],
                terminal: false,
            }],
        }],
        terminal: true,
    };

    NativeBlock {
        name: name.clone(),
        server: ServerConfig {
            listen: vec![format!(":{}", spec.port)],
            routes: vec![route],
        },
    }
}

/// Recover a route spec from a live server block.
///
/// Fails rather than guessing when hostname, port or upstream is missing.
pub fn decode(server: &Value, name: &RouteName) -> Result<RouteSpec, CodecError> {
    let incomplete = |missing| CodecError::Incomplete {
        name: name.to_string(),
        missing,
    };

    if !server.is_object() {
        return Err(incomplete("server block"));
    }
    let server: ServerConfig =
        serde_json::from_value(server.clone()).map_err(|source| CodecError::Malformed {
            name: name.to_string(),
            source,
        })?;

    let port = server
        .listen
        .first()
        .and_then(|addr| listen_port(addr))
        .ok_or_else(|| incomplete("port"))?;

    let hostname = server
        .routes
        .iter()
        .flat_map(|route| route.matchers.iter())
        .flat_map(|set| set.host.iter())
        .find(|host| !host.is_empty())
        .cloned()
        .ok_or_else(|| incomplete("hostname"))?;

    let proxy = find_reverse_proxy(&server.routes).ok_or_else(|| incomplete("upstream"))?;
    let upstream_address = proxy
        .upstreams
        .first()
        .map(|u| u.dial.clone())
        .filter(|dial| !dial.is_empty())
        .ok_or_else(|| incomplete("upstream"))?;

    let tls_trust_pool = proxy
        .transport
        .as_ref()
        .and_then(|t| t.tls.as_ref())
        .and_then(|tls| tls.ca.as_ref())
        .and_then(|ca| ca.pem_files.first())
        .cloned();

    let trusted_proxies = proxy
        .trusted_proxies
        .clone()
        .filter(|list| !list.is_empty());

    Ok(RouteSpec {
        hostname,
        port,
        upstream_address,
        tls_trust_pool,
        trusted_proxies,
    })
}

/// Port of a Caddy listen address such as `:443`, `0.0.0.0:8080` or `[::1]:80`.
pub fn listen_port(addr: &str) -> Option<u16> {
    let (_, tail) = addr.rsplit_once(':')?;
    let digits: String = tail.chars().take_while(char::is_ascii_digit).collect();
    digits.parse::<u16>().ok().filter(|port| *port != 0)
}

// Depth-first: subroutes are searched in place, so the first proxy in
// document order wins.
fn find_reverse_proxy(routes: &[RouteConfig]) -> Option<&ReverseProxy> {
    routes.iter().flat_map(|r| r.handle.iter()).find_map(|h| match h {
        Handler::ReverseProxy(proxy) => Some(proxy),
        Handler::Subroute { routes } => find_reverse_proxy(routes),
        Handler::Other => None,
    })
}
