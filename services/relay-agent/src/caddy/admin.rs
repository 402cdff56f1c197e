//! Caddy admin API client.
//!
//! Every route change goes through the admin endpoint; the agent never edits
//! Caddy's config on disk.
//!
//! Reference: https://caddyserver.com/docs/api

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde_json::{Map, Value};
use tailrelay_reconcile::{RouteName, ALL_SERVERS};
use thiserror::Error;
use tracing::{debug, error};

use super::codec::NativeBlock;

/// Errors from the Caddy admin API.
#[derive(Debug, Error)]
pub enum AdminError {
    #[error("admin API unreachable at {url}: {reason}")]
    Unreachable { url: String, reason: String },

    #[error("admin API error {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("server not found: {0}")]
    NotFound(String),

    #[error("invalid admin API response: {0}")]
    InvalidResponse(String),

    #[error("HTTP client error: {0}")]
    Client(String),
}

/// Operations the reconciler needs from the reverse proxy.
#[async_trait]
pub trait ProxyAdmin: Send + Sync {
    /// The whole running config. `Value::Null` when Caddy has none.
    async fn fetch_config(&self) -> Result<Value, AdminError>;

    /// One server block, or the whole server collection for [`ALL_SERVERS`].
    async fn fetch_server(&self, name: &str) -> Result<Value, AdminError>;

    /// Insert or overwrite a server block without touching anything else.
    async fn push_server(&self, block: &NativeBlock) -> Result<(), AdminError>;

    /// Remove `old` and insert `block` in a single config load.
    async fn swap_server(&self, old: &RouteName, block: &NativeBlock) -> Result<(), AdminError>;

    /// Replace an existing server block in place.
    async fn replace_server(&self, block: &NativeBlock) -> Result<(), AdminError>;

    /// Remove a server block.
    async fn delete_server(&self, name: &RouteName) -> Result<(), AdminError>;

    /// All live server blocks keyed by name; empty when there are none.
    async fn fetch_servers(&self) -> Result<Map<String, Value>, AdminError> {
        match self.fetch_server(ALL_SERVERS).await {
            Ok(Value::Object(servers)) => Ok(servers),
            Ok(_) | Err(AdminError::NotFound(_)) => Ok(Map::new()),
            Err(e) => Err(e),
        }
    }
}

/// reqwest-backed [`ProxyAdmin`].
pub struct AdminClient {
    base_url: String,
    client: Client,
}

impl AdminClient {
    /// Create a client for the admin endpoint at `base_url`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, AdminError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AdminError::Client(e.to_string()))?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn server_url(&self, name: &str) -> String {
        if name == ALL_SERVERS {
            format!("{}/config/apps/http/servers/", self.base_url)
        } else {
            format!("{}/config/apps/http/servers/{name}", self.base_url)
        }
    }

    /// Send a request and return the status with the body text.
    async fn execute(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<(StatusCode, String), AdminError> {
        debug!(method = %method, url = url, "Request to Caddy admin API");

        let mut request: RequestBuilder = self
            .client
            .request(method, url)
            .header("Accept", "application/json");
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| AdminError::Unreachable {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let status = response.status();
        let text = response.text().await.map_err(|e| AdminError::Unreachable {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        Ok((status, text))
    }

    /// Replace the whole running config.
    async fn load(&self, config: &Value) -> Result<(), AdminError> {
        let url = format!("{}/load", self.base_url);
        let (status, body) = self.execute(Method::POST, &url, Some(config)).await?;
        if !status.is_success() {
            return Err(Self::rejected(status, body));
        }
        Ok(())
    }

    fn rejected(status: StatusCode, body: String) -> AdminError {
        error!(status = %status, body = %body, "Caddy admin API error");
        AdminError::Rejected {
            status: status.as_u16(),
            body,
        }
    }
}

/// Caddy reports a missing config path as 404, or as 400 with an
/// "invalid traversal path" message when a parent key is absent.
fn is_missing_path(status: StatusCode, body: &str) -> bool {
    status == StatusCode::NOT_FOUND
        || (status == StatusCode::BAD_REQUEST && body.contains("invalid traversal path"))
}

fn parse_body(body: &str) -> Result<Value, AdminError> {
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(body).map_err(|e| AdminError::InvalidResponse(e.to_string()))
}

#[async_trait]
impl ProxyAdmin for AdminClient {
    async fn fetch_config(&self) -> Result<Value, AdminError> {
        let url = format!("{}/config/", self.base_url);
        let (status, body) = self.execute(Method::GET, &url, None).await?;
        if !status.is_success() {
            return Err(Self::rejected(status, body));
        }
        parse_body(&body)
    }

    async fn fetch_server(&self, name: &str) -> Result<Value, AdminError> {
        let url = self.server_url(name);
        let (status, body) = self.execute(Method::GET, &url, None).await?;
        if is_missing_path(status, &body) {
            return Err(AdminError::NotFound(name.to_string()));
        }
        if !status.is_success() {
            return Err(Self::rejected(status, body));
        }
        match parse_body(&body)? {
            Value::Null => Err(AdminError::NotFound(name.to_string())),
            value => Ok(value),
        }
    }

    async fn push_server(&self, block: &NativeBlock) -> Result<(), AdminError> {
        let config = merge_server(self.fetch_config().await?, block);
        self.load(&config).await?;
        debug!(name = %block.name, "Server block loaded");
        Ok(())
    }

    async fn swap_server(&self, old: &RouteName, block: &NativeBlock) -> Result<(), AdminError> {
        let config = merge_server(remove_server(self.fetch_config().await?, old), block);
        self.load(&config).await?;
        debug!(old = %old, name = %block.name, "Server block swapped");
        Ok(())
    }

    async fn replace_server(&self, block: &NativeBlock) -> Result<(), AdminError> {
        let url = format!("{}/", self.server_url(block.name.as_str()));
        let server = block.server_value();
        let (status, body) = self.execute(Method::POST, &url, Some(&server)).await?;
        if is_missing_path(status, &body) {
            return Err(AdminError::NotFound(block.name.to_string()));
        }
        if !status.is_success() {
            return Err(Self::rejected(status, body));
        }
        Ok(())
    }

    async fn delete_server(&self, name: &RouteName) -> Result<(), AdminError> {
        let url = self.server_url(name.as_str());
        let (status, body) = self.execute(Method::DELETE, &url, None).await?;
        if is_missing_path(status, &body) {
            return Err(AdminError::NotFound(name.to_string()));
        }
        if !status.is_success() {
            return Err(Self::rejected(status, body));
        }
        Ok(())
    }
}

/// Insert `block` under `apps.http.servers.<name>` of a full config tree.
///
/// Missing or non-object levels are created; sibling servers and other apps
/// are left as they are.
pub fn merge_server(config: Value, block: &NativeBlock) -> Value {
    let mut root = into_object(Some(config));
    let mut apps = into_object(root.remove("apps"));
    let mut http = into_object(apps.remove("http"));
    let mut servers = into_object(http.remove("servers"));

    servers.insert(block.name.to_string(), block.server_value());
    http.insert("servers".to_string(), Value::Object(servers));
    apps.insert("http".to_string(), Value::Object(http));
    root.insert("apps".to_string(), Value::Object(apps));
    Value::Object(root)
}

/// Drop `apps.http.servers.<name>` from a full config tree, if present.
pub fn remove_server(mut config: Value, name: &RouteName) -> Value {
    if let Some(servers) = config
        .pointer_mut("/apps/http/servers")
        .and_then(Value::as_object_mut)
    {
        servers.remove(name.as_str());
    }
    config
}

fn into_object(value: Option<Value>) -> Map<String, Value> {
    match value {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caddy::codec::encode;
    use crate::model::RouteSpec;
    use serde_json::json;

    fn block() -> NativeBlock {
        let spec = RouteSpec::new("example.com", 443, "10.0.0.1:8080");
        encode(&spec.name(), &spec)
    }

    #[test]
    fn test_merge_into_empty_config() {
        let block = block();
        let merged = merge_server(Value::Null, &block);
        assert_eq!(
            merged["apps"]["http"]["servers"][block.name.as_str()],
            block.server_value()
        );
    }

    #[test]
    fn test_merge_keeps_siblings_and_other_apps() {
        let block = block();
        let config = json!({
            "admin": {"listen": "localhost:2019"},
            "apps": {
                "tls": {"automation": {}},
                "http": {"servers": {"other": {"listen": [":80"]}}}
            }
        });
        let merged = merge_server(config, &block);

        assert_eq!(merged["admin"], json!({"listen": "localhost:2019"}));
        assert_eq!(merged["apps"]["tls"], json!({"automation": {}}));
        assert_eq!(merged["apps"]["http"]["servers"]["other"], json!({"listen": [":80"]}));
        assert!(merged["apps"]["http"]["servers"][block.name.as_str()].is_object());
    }

    #[test]
    fn test_merge_replaces_non_object_levels() {
        let block = block();
        let merged = merge_server(json!({"apps": {"http": null}}), &block);
        assert!(merged["apps"]["http"]["servers"][block.name.as_str()].is_object());
    }

    #[test]
    fn test_remove_then_merge_swaps_block() {
        let old = RouteName::parse("srvold").unwrap();
        let config = json!({
            "apps": {"http": {"servers": {
                "srvold": {"listen": [":443"]},
                "other": {"listen": [":80"]}
            }}}
        });
        let block = block();
        let swapped = merge_server(remove_server(config, &old), &block);

        let servers = swapped["apps"]["http"]["servers"].as_object().unwrap();
        assert!(!servers.contains_key("srvold"));
        assert!(servers.contains_key("other"));
        assert!(servers.contains_key(block.name.as_str()));
    }

    #[test]
    fn test_remove_from_empty_config_is_noop() {
        let old = RouteName::parse("srvold").unwrap();
        assert_eq!(remove_server(Value::Null, &old), Value::Null);
    }

    #[test]
    fn test_server_url_for_all() {
        let client = AdminClient::new("http://localhost:2019/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.base_url(), "http://localhost:2019");
        assert_eq!(
            client.server_url(ALL_SERVERS),
            "http://localhost:2019/config/apps/http/servers/"
        );
        assert_eq!(
            client.server_url("srv1234abcd"),
            "http://localhost:2019/config/apps/http/servers/srv1234abcd"
        );
    }

    #[test]
    fn test_missing_path_detection() {
        assert!(is_missing_path(StatusCode::NOT_FOUND, ""));
        assert!(is_missing_path(
            StatusCode::BAD_REQUEST,
            r#"{"error":"invalid traversal path at: config/apps/http"}"#
        ));
        assert!(!is_missing_path(StatusCode::BAD_REQUEST, "loading config: bad"));
    }
}
