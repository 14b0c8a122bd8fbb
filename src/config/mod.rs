pub mod env;
pub mod types;

#[cfg(test)]
mod tests;

pub use env::{parse_host_port, parse_node_list};
pub use types::*;

use crate::error::BalancerError;
use anyhow::Result;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;

impl BalancerConfig {
    /// Load configuration from a file (if it exists), then apply environment
    /// overrides. When the file does not exist, built-in defaults are used, so
    /// a pure environment-driven deployment needs no file at all.
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    /// Like [`BalancerConfig::load`], with overrides read through `lookup`.
    pub fn load_with(path: &Path, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config: BalancerConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            BalancerConfig::default()
        };

        config.apply_overrides_from(lookup)?;
        config.validate()?;

        tracing::info!(
            listen = %config.listen,
            nodes = config.nodes.len(),
            probe_mode = ?config.probe.mode,
            probe_interval_ms = config.probe.interval.as_millis() as u64,
            discovery = config.discovery.enabled(),
            alerts = config.alerts.enabled(),
            "loaded balancer configuration"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BalancerError> {
        self.listen_addr()?;

        if self.nodes.is_empty() && !self.discovery.enabled() {
            return Err(BalancerError::Config(
                "no backend nodes configured (set BALANCER_NODES or MARZBAN_URL)".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            validate_node(node)?;
            if !seen.insert((node.host.as_str(), node.port)) {
                return Err(BalancerError::Config(format!(
                    "duplicate node {}:{}",
                    node.host, node.port
                )));
            }
        }

        if self.probe.interval.is_zero() {
            return Err(BalancerError::Config("probe interval must be positive".to_string()));
        }
        if self.probe.timeout.is_zero() {
            return Err(BalancerError::Config("probe timeout must be positive".to_string()));
        }
        if self.probe.timeout > self.probe.interval {
            return Err(BalancerError::Config(format!(
                "probe timeout ({:?}) must not exceed probe interval ({:?})",
                self.probe.timeout, self.probe.interval
            )));
        }

        let h = &self.health;
        if h.degrade_threshold == 0 || h.down_threshold == 0 || h.recover_threshold == 0 {
            return Err(BalancerError::Config(
                "health thresholds must be at least 1".to_string(),
            ));
        }

        if self.relay.connect_timeout.is_zero() || self.relay.idle_timeout.is_zero() {
            return Err(BalancerError::Config(
                "connect and idle timeouts must be positive".to_string(),
            ));
        }

        if self.discovery.enabled() && self.discovery.service_port == 0 {
            return Err(BalancerError::Config(
                "discovery service port must be non-zero".to_string(),
            ));
        }

        if let Some(ref listen) = self.metrics.listen {
            listen.parse::<SocketAddr>().map_err(|e| {
                BalancerError::Config(format!("invalid metrics listen address '{}': {}", listen, e))
            })?;
        }

        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, BalancerError> {
        self.listen.parse().map_err(|e| {
            BalancerError::Config(format!("invalid listen address '{}': {}", self.listen, e))
        })
    }
}

/// Reject node entries that can never be probed or dialled.
pub fn validate_node(node: &NodeConfig) -> Result<(), BalancerError> {
    let host = node.host.trim();
    if host.is_empty() {
        return Err(BalancerError::Config("node with empty host".to_string()));
    }
    if host.chars().any(|c| c.is_whitespace() || c == '/' || c == '@') {
        return Err(BalancerError::Config(format!("malformed node host '{}'", node.host)));
    }
    if node.port == 0 {
        return Err(BalancerError::Config(format!("node {} has port 0", node.host)));
    }
    if node.weight == 0 {
        return Err(BalancerError::Config(format!(
            "node {}:{} has weight 0",
            node.host, node.port
        )));
    }
    Ok(())
}
