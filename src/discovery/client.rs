use crate::config::{validate_node, DiscoveryConfig, NodeConfig};
use crate::error::BalancerError;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// One entry of the panel's `GET /api/nodes` response.
#[derive(Debug, Clone, Deserialize)]
pub struct PanelNode {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub name: Option<String>,
    pub address: String,
    #[serde(default)]
    pub status: Option<String>,
}

impl PanelNode {
    pub fn is_disabled(&self) -> bool {
        self.status
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case("disabled"))
    }

    fn label(&self) -> String {
        match (&self.name, self.id) {
            (Some(name), _) => name.clone(),
            (None, Some(id)) => format!("node {}", id),
            (None, None) => self.address.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    token: Option<String>,
}

struct CachedToken {
    value: String,
    fetched_at: Instant,
}

/// Marzban panel HTTP client. The admin token is cached for `token_ttl`.
pub struct PanelClient {
    base_url: String,
    client: reqwest::Client,
    username: String,
    password: String,
    token_ttl: Duration,
    token: Mutex<Option<CachedToken>>,
}

impl PanelClient {
    pub fn new(cfg: &DiscoveryConfig) -> Result<Self, BalancerError> {
        let panel_url = cfg
            .panel_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| BalancerError::Config("panel url is not set".to_string()))?;

        let base_url = if panel_url.starts_with("http://") || panel_url.starts_with("https://") {
            panel_url.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", panel_url.trim_end_matches('/'))
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(BalancerError::Http)?;

        Ok(Self {
            base_url,
            client,
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            token_ttl: Duration::from_secs(cfg.token_ttl_secs),
            token: Mutex::new(None),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Return the cached admin token, fetching a new one once it expires.
    async fn token(&self) -> Result<String, BalancerError> {
        let mut cached = self.token.lock().await;
        if let Some(ref t) = *cached {
            if t.fetched_at.elapsed() < self.token_ttl {
                return Ok(t.value.clone());
            }
        }

        let url = format!("{}/api/admin/token", self.base_url);
        let resp = self
            .client
            .post(&url)
            .form(&[("username", self.username.as_str()), ("password", self.password.as_str())])
            .send()
            .await
            .map_err(BalancerError::Http)?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(BalancerError::Panel(format!(
                "token request failed: {} - {}",
                status, body
            )));
        }

        let body: TokenResponse = resp.json().await.map_err(BalancerError::Http)?;
        let value = body
            .access_token
            .or(body.token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| BalancerError::Panel("token response has no token".to_string()))?;

        tracing::debug!("discovery: panel: admin token refreshed, url={}", self.base_url);
        *cached = Some(CachedToken {
            value: value.clone(),
            fetched_at: Instant::now(),
        });
        Ok(value)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    /// List nodes known to the panel. A rejected token is refreshed once.
    pub async fn list_nodes(&self) -> Result<Vec<PanelNode>, BalancerError> {
        let url = format!("{}/api/nodes", self.base_url);

        for attempt in 0..2 {
            let token = self.token().await?;
            let resp = self
                .client
                .get(&url)
                .bearer_auth(&token)
                .send()
                .await
                .map_err(BalancerError::Http)?;

            let status = resp.status();
            if status == reqwest::StatusCode::UNAUTHORIZED && attempt == 0 {
                tracing::info!("discovery: panel: token rejected, refreshing");
                self.invalidate_token().await;
                continue;
            }
            if !status.is_success() {
                return Err(BalancerError::Panel(format!(
                    "list nodes failed: status={}",
                    status
                )));
            }
            return resp.json().await.map_err(BalancerError::Http);
        }

        Err(BalancerError::Panel("list nodes failed: unauthorized".to_string()))
    }
}

/// Reduce a panel address to a bare host: scheme, path, userinfo and port
/// are dropped. Bare IPv6 literals are kept as-is.
pub fn strip_address(address: &str) -> Option<String> {
    let mut rest = address.trim();
    if let Some((_, after)) = rest.split_once("://") {
        rest = after;
    }
    if let Some(idx) = rest.find(['/', '?', '#']) {
        rest = &rest[..idx];
    }
    if let Some((_, after)) = rest.rsplit_once('@') {
        rest = after;
    }

    let host = if let Some(inner) = rest.strip_prefix('[') {
        inner.split(']').next().unwrap_or_default()
    } else if rest.matches(':').count() == 1 {
        rest.split(':').next().unwrap_or_default()
    } else {
        rest
    };

    let host = host.trim();
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

/// Map panel nodes to backends on `service_port`, skipping disabled and
/// malformed entries.
pub fn to_node_configs(nodes: &[PanelNode], service_port: u16) -> Vec<NodeConfig> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(nodes.len());

    for node in nodes {
        if node.is_disabled() {
            tracing::debug!("discovery: panel: skipping disabled node, node={}", node.label());
            continue;
        }
        let Some(host) = strip_address(&node.address) else {
            tracing::warn!(
                "discovery: panel: skipping node with empty address, node={}",
                node.label()
            );
            continue;
        };
        let cfg = NodeConfig::new(host, service_port);
        if let Err(e) = validate_node(&cfg) {
            tracing::warn!(
                "discovery: panel: skipping malformed node, node={}, address={}, error={}",
                node.label(),
                node.address,
                e
            );
            continue;
        }
        if seen.insert(cfg.host.clone()) {
            out.push(cfg);
        }
    }
    out
}
