use crate::config::NodeConfig;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

/// Node identity. Ordered by host, then port; the last selection tie-break.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId {
    host: Arc<str>,
    port: u16,
}

impl NodeId {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: Arc::from(host),
            port,
        }
    }

    #[inline]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthState {
    Unknown,
    Healthy,
    Degraded,
    Down,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Down => "down",
        }
    }

    /// Gauge encoding: 0 = unknown, 1 = healthy, 2 = degraded, 3 = down.
    pub fn as_gauge(&self) -> f64 {
        match self {
            Self::Unknown => 0.0,
            Self::Healthy => 1.0,
            Self::Degraded => 2.0,
            Self::Down => 3.0,
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable health bookkeeping. Written only by [`super::tracker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthRecord {
    pub state: HealthState,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub last_probe_at: Option<SystemTime>,
    pub last_latency: Option<Duration>,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self {
            state: HealthState::Unknown,
            consecutive_successes: 0,
            consecutive_failures: 0,
            last_probe_at: None,
            last_latency: None,
        }
    }
}

/// A backend endpoint.
///
/// Static metadata is immutable. The health record and in-flight counter are
/// shared handles so that a node surviving a registry reload keeps both.
#[derive(Debug)]
pub struct Node {
    id: NodeId,
    weight: u32,
    priority: u32,
    health: Arc<Mutex<HealthRecord>>,
    in_flight: Arc<AtomicUsize>,
}

impl Node {
    pub fn new(config: &NodeConfig) -> Self {
        Self {
            id: NodeId::new(&config.host, config.port),
            weight: config.weight.max(1),
            priority: config.priority,
            health: Arc::new(Mutex::new(HealthRecord::default())),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Build a node from new static metadata, inheriting runtime state.
    pub(crate) fn carry_over(config: &NodeConfig, previous: &Node) -> Self {
        Self {
            id: previous.id.clone(),
            weight: config.weight.max(1),
            priority: config.priority,
            health: previous.health.clone(),
            in_flight: previous.in_flight.clone(),
        }
    }

    #[inline]
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    #[inline]
    pub fn weight(&self) -> u32 {
        self.weight
    }

    #[inline]
    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn health(&self) -> HealthRecord {
        self.lock_health().clone()
    }

    pub fn state(&self) -> HealthState {
        self.lock_health().state
    }

    pub(crate) fn lock_health(&self) -> MutexGuard<'_, HealthRecord> {
        self.health.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub(crate) fn acquire(self: &Arc<Self>) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        metrics::gauge!("balancer_node_in_flight", "node" => self.id.to_string()).increment(1.0);
        InFlightGuard { node: self.clone() }
    }
}

/// Decrements the node's in-flight counter on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    node: Arc<Node>,
}

impl InFlightGuard {
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.node.in_flight.fetch_sub(1, Ordering::AcqRel);
        metrics::gauge!("balancer_node_in_flight", "node" => self.node.id.to_string())
            .decrement(1.0);
    }
}
