//! Environment overrides and the textual node-list format.
//!
//! `BALANCER_NODES` holds comma separated entries of the form
//! `host:port[;weight=N][;priority=N]`. IPv6 literals are bracketed:
//! `[2001:db8::1]:8443;weight=2`.

use super::types::{parse_duration, BalancerConfig, NodeConfig, ProbeMode};
use crate::error::BalancerError;

impl BalancerConfig {
    /// Apply overrides from an arbitrary key lookup. Empty values are ignored.
    pub fn apply_overrides_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), BalancerError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        // Listener
        if let Some(v) = get("APP_PORT") {
            let port: u16 = parse_number("APP_PORT", &v)?;
            self.listen = format!("0.0.0.0:{}", port);
        }
        if let Some(v) = get("BALANCER_LISTEN") {
            self.listen = v;
        }

        // Nodes
        if let Some(v) = get("BALANCER_NODES") {
            self.nodes = parse_node_list(&v)?;
        }

        // Probing
        if let Some(v) = get("PROBE_MODE") {
            self.probe.mode = v.parse::<ProbeMode>().map_err(BalancerError::Config)?;
        }
        if let Some(v) = get("POLL_INTERVAL") {
            self.probe.interval = parse_env_duration("POLL_INTERVAL", &v)?;
        }
        if let Some(v) = get("PROBE_TIMEOUT") {
            self.probe.timeout = parse_env_duration("PROBE_TIMEOUT", &v)?;
        }

        // Hysteresis
        if let Some(v) = get("DEGRADE_THRESHOLD") {
            self.health.degrade_threshold = parse_number("DEGRADE_THRESHOLD", &v)?;
        }
        if let Some(v) = get("DOWN_THRESHOLD") {
            self.health.down_threshold = parse_number("DOWN_THRESHOLD", &v)?;
        }
        if let Some(v) = get("RECOVER_THRESHOLD") {
            self.health.recover_threshold = parse_number("RECOVER_THRESHOLD", &v)?;
        }

        // Relay
        if let Some(v) = get("CONNECT_TIMEOUT") {
            self.relay.connect_timeout = parse_env_duration("CONNECT_TIMEOUT", &v)?;
        }
        if let Some(v) = get("IDLE_TIMEOUT") {
            self.relay.idle_timeout = parse_env_duration("IDLE_TIMEOUT", &v)?;
        }
        if let Some(v) = get("SESSION_TIMEOUT") {
            self.relay.session_timeout = parse_env_duration("SESSION_TIMEOUT", &v)?;
        }
        if let Some(v) = get("DRAIN_TIMEOUT") {
            self.relay.drain_timeout = parse_env_duration("DRAIN_TIMEOUT", &v)?;
        }

        // Metrics
        if let Some(v) = get("METRICS_LISTEN") {
            self.metrics.listen = Some(v);
        }

        // Marzban panel discovery
        if let Some(v) = get("MARZBAN_URL") {
            self.discovery.panel_url = Some(v.trim_end_matches('/').to_string());
        }
        if let Some(v) = get("MARZBAN_ADMIN_USER") {
            self.discovery.username = v;
        }
        if let Some(v) = get("MARZBAN_ADMIN_PASS") {
            self.discovery.password = v;
        }
        if let Some(v) = get("MARZBAN_TOKEN_TTL") {
            self.discovery.token_ttl_secs = parse_number("MARZBAN_TOKEN_TTL", &v)?;
        }
        if let Some(v) = get("MONITOR_PORT") {
            self.discovery.service_port = parse_number("MONITOR_PORT", &v)?;
        }
        if let Some(v) = get("DISCOVERY_INTERVAL") {
            self.discovery.interval = parse_env_duration("DISCOVERY_INTERVAL", &v)?;
        }

        // Telegram alerts
        if let Some(v) = get("TELEGRAM_ENABLED") {
            self.alerts.telegram_enabled = parse_flag(&v);
        }
        if let Some(v) = get("TELEGRAM_BOT_TOKEN") {
            self.alerts.bot_token = Some(v);
        }
        if let Some(v) = get("TELEGRAM_CHAT_ID") {
            self.alerts.chat_id = Some(v);
        }
        if let Some(v) = get("NODE_REMINDER_INTERVAL") {
            self.alerts.reminder_interval_hours = parse_number("NODE_REMINDER_INTERVAL", &v)?;
        }

        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, BalancerError>
where
    T::Err: std::fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|e| BalancerError::Config(format!("{}='{}': {}", key, value, e)))
}

fn parse_env_duration(key: &str, value: &str) -> Result<std::time::Duration, BalancerError> {
    parse_duration(value).map_err(|e| BalancerError::Config(format!("{}: {}", key, e)))
}

fn parse_flag(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

/// Split `host:port` (or `[v6]:port`) into its parts.
pub fn parse_host_port(value: &str) -> Result<(String, u16), BalancerError> {
    let value = value.trim();
    let (host, port) = if let Some(rest) = value.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| BalancerError::Config(format!("unterminated IPv6 literal in '{}'", value)))?;
        let port = tail
            .strip_prefix(':')
            .ok_or_else(|| BalancerError::Config(format!("missing port in '{}'", value)))?;
        (host, port)
    } else {
        let (host, port) = value
            .rsplit_once(':')
            .ok_or_else(|| BalancerError::Config(format!("missing port in '{}'", value)))?;
        if host.contains(':') {
            return Err(BalancerError::Config(format!(
                "IPv6 address must be bracketed in '{}'",
                value
            )));
        }
        (host, port)
    };

    if host.is_empty() {
        return Err(BalancerError::Config(format!("empty host in '{}'", value)));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| BalancerError::Config(format!("invalid port in '{}'", value)))?;
    if port == 0 {
        return Err(BalancerError::Config(format!("port 0 in '{}'", value)));
    }
    Ok((host.to_string(), port))
}

/// Parse the `BALANCER_NODES` format into node configs.
pub fn parse_node_list(value: &str) -> Result<Vec<NodeConfig>, BalancerError> {
    let mut nodes = Vec::new();
    for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let mut parts = entry.split(';').map(str::trim);
        let address = parts.next().unwrap_or_default();
        let (host, port) = parse_host_port(address)?;
        let mut node = NodeConfig::new(host, port);

        for option in parts.filter(|p| !p.is_empty()) {
            let (key, val) = option.split_once('=').ok_or_else(|| {
                BalancerError::Config(format!("malformed option '{}' in node '{}'", option, entry))
            })?;
            match key.trim() {
                "weight" | "w" => node.weight = parse_number("weight", val.trim())?,
                "priority" | "tier" => node.priority = parse_number("priority", val.trim())?,
                other => {
                    return Err(BalancerError::Config(format!(
                        "unknown option '{}' in node '{}'",
                        other, entry
                    )))
                }
            }
        }
        nodes.push(node);
    }
    Ok(nodes)
}
