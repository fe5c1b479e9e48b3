//! 3x-ui API Client
//!
//! Implements [`OutboundRegistry`] against a 3x-ui style panel. The panel's
//! API surface differs across versions, so every operation walks an ordered
//! list of endpoint templates until one answers at the HTTP level; auth is
//! lazy and re-established once on a 401.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use super::OutboundRegistry;
use crate::config::XuiConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const RETRY_PAUSE: Duration = Duration::from_secs(1);

/// Ordered URL templates per operation; `{id}` expands to the outbound id.
#[derive(Debug, Clone)]
pub struct XuiEndpoints {
    pub add: Vec<String>,
    pub remove: Vec<String>,
    pub reload: Vec<String>,
    pub list: Vec<String>,
}

impl From<&XuiConfig> for XuiEndpoints {
    fn from(config: &XuiConfig) -> Self {
        Self {
            add: config.add_endpoints.clone(),
            remove: config.remove_endpoints.clone(),
            reload: config.reload_endpoints.clone(),
            list: config.list_endpoints.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct AuthState {
    authenticated: bool,
    token: Option<String>,
}

/// Client for a 3x-ui outbound registry
///
/// Interior auth state only; the supervisor serializes all mutating use.
pub struct XuiClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    endpoints: XuiEndpoints,
    retry_count: u32,
    auth: Mutex<AuthState>,
}

impl XuiClient {
    /// Build a client from the registry section of the configuration.
    pub fn new(config: &XuiConfig, retry_count: u32) -> Result<Self, reqwest::Error> {
        // Session-cookie auth is the common 3x-ui mode; token auth rides on
        // top when the panel returns one.
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            endpoints: XuiEndpoints::from(config),
            retry_count: retry_count.max(1),
            auth: Mutex::new(AuthState::default()),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }

    fn bearer(&self) -> Option<String> {
        self.auth.lock().token.clone()
    }

    async fn login(&self) -> bool {
        let payload = json!({
            "username": self.username,
            "password": self.password,
        });
        match self
            .http
            .post(self.url("/login"))
            .json(&payload)
            .send()
            .await
        {
            Ok(response) if response.status() == StatusCode::OK => {
                let has_session_cookie = response.cookies().next().is_some();
                let body: Value = response.json().await.unwrap_or(Value::Null);
                let success = body
                    .get("success")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let token = body
                    .get("token")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                if success || token.is_some() || has_session_cookie {
                    let mut auth = self.auth.lock();
                    auth.token = token;
                    auth.authenticated = true;
                    info!("Authenticated with outbound registry at {}", self.base_url);
                    true
                } else {
                    error!("Registry authentication rejected: {}", body);
                    false
                }
            }
            Ok(response) => {
                error!("Registry login failed with status {}", response.status());
                false
            }
            Err(e) => {
                error!("Registry login error: {}", e);
                false
            }
        }
    }

    async fn ensure_authenticated(&self) -> bool {
        if self.auth.lock().authenticated {
            return true;
        }
        self.login().await
    }

    fn drop_credentials(&self) {
        let mut auth = self.auth.lock();
        auth.authenticated = false;
        auth.token = None;
    }

    /// Walk the endpoint templates in order until one produces an HTTP-level
    /// answer; transport errors fall through to the next shape. A 401 drops
    /// the credentials and retries the same endpoint once re-authenticated.
    async fn try_endpoints(
        &self,
        method: Method,
        templates: &[String],
        id: Option<&str>,
        body: Option<&Value>,
    ) -> Option<(StatusCode, Value)> {
        let mut reauthenticated = false;
        for template in templates {
            let path = match id {
                Some(id) => template.replace("{id}", id),
                None => template.clone(),
            };
            loop {
                let mut request = self.http.request(method.clone(), self.url(&path));
                if let Some(token) = self.bearer() {
                    request = request.bearer_auth(token);
                }
                if let Some(body) = body {
                    request = request.json(body);
                }
                match request.send().await {
                    Ok(response) if response.status() == StatusCode::UNAUTHORIZED => {
                        if reauthenticated {
                            return Some((StatusCode::UNAUTHORIZED, Value::Null));
                        }
                        debug!("Registry returned 401 on {}, re-authenticating", path);
                        self.drop_credentials();
                        if !self.login().await {
                            return Some((StatusCode::UNAUTHORIZED, Value::Null));
                        }
                        reauthenticated = true;
                        continue;
                    }
                    Ok(response) => {
                        let status = response.status();
                        let body = response.json::<Value>().await.unwrap_or(Value::Null);
                        return Some((status, body));
                    }
                    Err(e) => {
                        debug!("Registry endpoint {} transport error: {}", path, e);
                        break;
                    }
                }
            }
        }
        None
    }
}

/// Pull the outbound id out of an add response: `id`, then `obj.id`, then
/// the port as a last resort (older panels key outbounds by port).
fn extract_outbound_id(body: &Value, port: u16) -> String {
    id_as_string(body.get("id"))
        .or_else(|| id_as_string(body.get("obj").and_then(|obj| obj.get("id"))))
        .unwrap_or_else(|| port.to_string())
}

fn id_as_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn unwrap_outbound_list(body: &Value) -> Vec<Value> {
    for key in ["obj", "data", "outbounds"] {
        if let Some(Value::Array(items)) = body.get(key) {
            return items.clone();
        }
    }
    Vec::new()
}

#[async_trait]
impl OutboundRegistry for XuiClient {
    async fn add_socks5(&self, host: &str, port: u16, remark: &str) -> Option<String> {
        if !self.ensure_authenticated().await {
            error!("Cannot add outbound: not authenticated");
            return None;
        }
        let remark = format!("{}-{}:{}", remark, host, port);
        let payload = json!({
            "outbound": {
                "protocol": "socks",
                "settings": {
                    "servers": [{ "address": host, "port": port }]
                },
                "streamSettings": { "network": "tcp" },
                "remark": remark.as_str(),
            },
            "remark": remark.as_str(),
        });

        for attempt in 1..=self.retry_count {
            match self
                .try_endpoints(Method::POST, &self.endpoints.add, None, Some(&payload))
                .await
            {
                Some((status, body))
                    if status == StatusCode::OK || status == StatusCode::CREATED =>
                {
                    let outbound_id = extract_outbound_id(&body, port);
                    info!(
                        "Added SOCKS5 outbound {}:{} with id {}",
                        host, port, outbound_id
                    );
                    return Some(outbound_id);
                }
                Some((status, _)) => warn!(
                    "Registry add for {}:{} returned {} (attempt {}/{})",
                    host, port, status, attempt, self.retry_count
                ),
                None => warn!(
                    "Registry add for {}:{} failed on every endpoint (attempt {}/{})",
                    host, port, attempt, self.retry_count
                ),
            }
            if attempt < self.retry_count {
                tokio::time::sleep(RETRY_PAUSE).await;
            }
        }
        error!(
            "Failed to add SOCKS5 outbound {}:{} after {} attempts",
            host, port, self.retry_count
        );
        None
    }

    async fn remove(&self, outbound_id: &str) -> bool {
        if !self.ensure_authenticated().await {
            error!("Cannot remove outbound: not authenticated");
            return false;
        }
        for attempt in 1..=self.retry_count {
            match self
                .try_endpoints(
                    Method::DELETE,
                    &self.endpoints.remove,
                    Some(outbound_id),
                    None,
                )
                .await
            {
                Some((status, _))
                    if status == StatusCode::OK || status == StatusCode::NO_CONTENT =>
                {
                    info!("Removed outbound {}", outbound_id);
                    return true;
                }
                Some((status, _)) if status == StatusCode::NOT_FOUND => {
                    // Already gone is still gone.
                    warn!("Outbound {} not found (already removed)", outbound_id);
                    return true;
                }
                Some((status, _)) => warn!(
                    "Registry remove for {} returned {} (attempt {}/{})",
                    outbound_id, status, attempt, self.retry_count
                ),
                None => warn!(
                    "Registry remove for {} failed on every endpoint (attempt {}/{})",
                    outbound_id, attempt, self.retry_count
                ),
            }
            if attempt < self.retry_count {
                tokio::time::sleep(RETRY_PAUSE).await;
            }
        }
        error!(
            "Failed to remove outbound {} after {} attempts",
            outbound_id, self.retry_count
        );
        false
    }

    async fn reload(&self) -> bool {
        if !self.ensure_authenticated().await {
            error!("Cannot reload registry: not authenticated");
            return false;
        }
        for attempt in 1..=self.retry_count {
            match self
                .try_endpoints(Method::POST, &self.endpoints.reload, None, None)
                .await
            {
                Some((status, _))
                    if status == StatusCode::OK || status == StatusCode::NO_CONTENT =>
                {
                    info!("Registry configuration reloaded");
                    return true;
                }
                Some((status, _)) => warn!(
                    "Registry reload returned {} (attempt {}/{})",
                    status, attempt, self.retry_count
                ),
                None => warn!(
                    "Registry reload failed on every endpoint (attempt {}/{})",
                    attempt, self.retry_count
                ),
            }
            if attempt < self.retry_count {
                tokio::time::sleep(RETRY_PAUSE).await;
            }
        }
        error!("Failed to reload registry after {} attempts", self.retry_count);
        false
    }

    async fn list(&self) -> Option<Vec<Value>> {
        if !self.ensure_authenticated().await {
            error!("Cannot list outbounds: not authenticated");
            return None;
        }
        match self
            .try_endpoints(Method::GET, &self.endpoints.list, None, None)
            .await
        {
            Some((status, body)) if status == StatusCode::OK => {
                Some(unwrap_outbound_list(&body))
            }
            Some((status, _)) => {
                warn!("Registry list returned {}", status);
                None
            }
            None => {
                warn!("Registry list failed on every endpoint");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_outbound_id_top_level() {
        let body = json!({"id": "ob-42"});
        assert_eq!(extract_outbound_id(&body, 9090), "ob-42");
    }

    #[test]
    fn test_extract_outbound_id_nested() {
        let body = json!({"success": true, "obj": {"id": 17}});
        assert_eq!(extract_outbound_id(&body, 9090), "17");
    }

    #[test]
    fn test_extract_outbound_id_falls_back_to_port() {
        let body = json!({"success": true});
        assert_eq!(extract_outbound_id(&body, 9191), "9191");
    }

    #[test]
    fn test_unwrap_outbound_list_variants() {
        let body = json!({"obj": [{"id": 1}, {"id": 2}]});
        assert_eq!(unwrap_outbound_list(&body).len(), 2);
        let body = json!({"data": [{"id": 1}]});
        assert_eq!(unwrap_outbound_list(&body).len(), 1);
        let body = json!({"outbounds": []});
        assert!(unwrap_outbound_list(&body).is_empty());
        let body = json!({"obj": "not-a-list"});
        assert!(unwrap_outbound_list(&body).is_empty());
    }

    #[test]
    fn test_endpoint_defaults_and_id_template() {
        let config = XuiConfig::default();
        let endpoints = XuiEndpoints::from(&config);
        assert_eq!(endpoints.add[0], "/xui/API/outbounds/add");
        let rendered = endpoints.remove[0].replace("{id}", "ob-3");
        assert_eq!(rendered, "/xui/API/outbounds/ob-3");
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let mut config = XuiConfig::default();
        config.api_url = "http://127.0.0.1:2053/".into();
        let client = XuiClient::new(&config, 3).unwrap();
        assert_eq!(client.url("/login"), "http://127.0.0.1:2053/login");
    }
}
