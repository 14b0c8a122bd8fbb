use serde::{Deserialize, Deserializer};
use std::str::FromStr;
use std::time::Duration;

/// Deserialize a `T` that implements `Default`; JSON `null` is treated as
/// a missing field (returns `T::default()`).
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Durations in config files are either a number of seconds (`5`, `0.5`) or a
/// humantime string (`"1500ms"`, `"2m"`).
#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Secs(f64),
    Text(String),
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    match RawDuration::deserialize(deserializer)? {
        RawDuration::Secs(secs) => {
            Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
        }
        RawDuration::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}

/// Parse `"5"`, `"0.25"` (seconds) or any humantime duration (`"250ms"`).
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<f64>() {
        return Duration::try_from_secs_f64(secs)
            .map_err(|e| format!("invalid duration '{}': {}", value, e));
    }
    humantime::parse_duration(value).map_err(|e| format!("invalid duration '{}': {}", value, e))
}

/// Top-level balancer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BalancerConfig {
    /// Address the forwarding listener binds to.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Statically configured backend nodes.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub nodes: Vec<NodeConfig>,

    #[serde(default)]
    pub probe: ProbeConfig,

    #[serde(default)]
    pub health: HealthThresholds,

    #[serde(default)]
    pub relay: RelayConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub alerts: AlertConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            nodes: Vec::new(),
            probe: ProbeConfig::default(),
            health: HealthThresholds::default(),
            relay: RelayConfig::default(),
            discovery: DiscoveryConfig::default(),
            alerts: AlertConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

pub const DEFAULT_PORT: u16 = 8023;

fn default_listen() -> String {
    format!("0.0.0.0:{}", DEFAULT_PORT)
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NodeConfig {
    pub host: String,
    pub port: u16,

    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Lower tier is preferred.
    #[serde(default)]
    pub priority: u32,
}

impl NodeConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            weight: default_weight(),
            priority: 0,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMode {
    /// ICMP echo when permitted, TCP connect otherwise.
    #[default]
    Auto,
    Icmp,
    Tcp,
}

impl FromStr for ProbeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "icmp" | "ping" => Ok(Self::Icmp),
            "tcp" | "connect" => Ok(Self::Tcp),
            other => Err(format!("unknown probe mode '{}', use auto, icmp or tcp", other)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    #[serde(default)]
    pub mode: ProbeMode,

    #[serde(default = "default_probe_interval", deserialize_with = "deserialize_duration")]
    pub interval: Duration,

    #[serde(default = "default_probe_timeout", deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            mode: ProbeMode::default(),
            interval: default_probe_interval(),
            timeout: default_probe_timeout(),
        }
    }
}

fn default_probe_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(2)
}

/// Hysteresis thresholds for the per-node health state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct HealthThresholds {
    /// Consecutive failures that move HEALTHY to DEGRADED.
    #[serde(default = "default_degrade_threshold")]
    pub degrade_threshold: u32,

    /// Consecutive failures, counted from entry into DEGRADED, that move it to DOWN.
    #[serde(default = "default_down_threshold")]
    pub down_threshold: u32,

    /// Consecutive successes that bring DEGRADED or DOWN back to HEALTHY.
    #[serde(default = "default_recover_threshold")]
    pub recover_threshold: u32,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            degrade_threshold: default_degrade_threshold(),
            down_threshold: default_down_threshold(),
            recover_threshold: default_recover_threshold(),
        }
    }
}

fn default_degrade_threshold() -> u32 {
    2
}

fn default_down_threshold() -> u32 {
    3
}

fn default_recover_threshold() -> u32 {
    2
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_connect_timeout", deserialize_with = "deserialize_duration")]
    pub connect_timeout: Duration,

    /// Close the session after this long without bytes in either direction.
    #[serde(default = "default_idle_timeout", deserialize_with = "deserialize_duration")]
    pub idle_timeout: Duration,

    /// Hard cap on session length. Zero disables it.
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub session_timeout: Duration,

    /// Grace period for in-flight sessions on shutdown.
    #[serde(default = "default_drain_timeout", deserialize_with = "deserialize_duration")]
    pub drain_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            idle_timeout: default_idle_timeout(),
            session_timeout: Duration::ZERO,
            drain_timeout: default_drain_timeout(),
        }
    }
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_drain_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Marzban panel discovery. Disabled while `panel_url` is unset.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub panel_url: Option<String>,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,

    /// Port traffic is forwarded to on discovered nodes.
    #[serde(default = "default_service_port")]
    pub service_port: u16,

    #[serde(default = "default_discovery_interval", deserialize_with = "deserialize_duration")]
    pub interval: Duration,
}

impl DiscoveryConfig {
    pub fn enabled(&self) -> bool {
        self.panel_url.as_deref().is_some_and(|u| !u.is_empty())
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            panel_url: None,
            username: String::new(),
            password: String::new(),
            token_ttl_secs: default_token_ttl(),
            service_port: default_service_port(),
            interval: default_discovery_interval(),
        }
    }
}

fn default_token_ttl() -> u64 {
    300
}

fn default_service_port() -> u16 {
    8443
}

fn default_discovery_interval() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertConfig {
    #[serde(default)]
    pub telegram_enabled: bool,

    #[serde(default)]
    pub bot_token: Option<String>,

    #[serde(default)]
    pub chat_id: Option<String>,

    /// Hours between reminders about a node that stays down.
    #[serde(default = "default_reminder_interval")]
    pub reminder_interval_hours: u64,
}

impl AlertConfig {
    pub fn enabled(&self) -> bool {
        self.telegram_enabled
            && self.bot_token.as_deref().is_some_and(|t| !t.is_empty())
            && self.chat_id.as_deref().is_some_and(|c| !c.is_empty())
    }

    pub fn reminder_interval(&self) -> Duration {
        Duration::from_secs(self.reminder_interval_hours.saturating_mul(3600))
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            telegram_enabled: false,
            bot_token: None,
            chat_id: None,
            reminder_interval_hours: default_reminder_interval(),
        }
    }
}

fn default_reminder_interval() -> u64 {
    6
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    /// Prometheus scrape address. Metrics are not exported when unset.
    #[serde(default)]
    pub listen: Option<String>,
}
