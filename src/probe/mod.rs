//! Liveness probes.
//!
//! A [`Prober`] wraps one [`ProbeTransport`] and turns every attempt into a
//! [`ProbeResult`]. Transport errors, timeouts and resolution failures all
//! become `success = false`; nothing here touches the registry.

pub mod icmp;
pub mod tcp;

use crate::config::ProbeMode;
use crate::upstream::NodeId;
use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

pub use icmp::IcmpTransport;
pub use tcp::TcpTransport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub node: NodeId,
    pub success: bool,
    /// Time spent on the attempt.
    pub latency: Duration,
    pub at: SystemTime,
}

/// A mechanism that can tell whether a target answers.
#[async_trait]
pub trait ProbeTransport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Succeeds when the target answered within `deadline`.
    async fn check(&self, target: &NodeId, deadline: Duration) -> io::Result<()>;
}

pub struct Prober {
    transport: Arc<dyn ProbeTransport>,
    timeout: Duration,
}

impl Prober {
    pub fn new(transport: Arc<dyn ProbeTransport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    pub fn for_mode(mode: ProbeMode, timeout: Duration) -> Self {
        Self::new(transport_for(mode), timeout)
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    pub async fn probe(&self, node: &NodeId) -> ProbeResult {
        let at = SystemTime::now();
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, self.transport.check(node, self.timeout)).await;
        let latency = started.elapsed();

        let success = match outcome {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!(
                    "probe: {}: check failed, node={}, error={}",
                    self.transport.name(),
                    node,
                    e
                );
                false
            }
            Err(_) => {
                debug!(
                    "probe: {}: check timed out, node={}, timeout_ms={}",
                    self.transport.name(),
                    node,
                    self.timeout.as_millis()
                );
                false
            }
        };

        ProbeResult {
            node: node.clone(),
            success,
            latency,
            at,
        }
    }
}

pub fn transport_for(mode: ProbeMode) -> Arc<dyn ProbeTransport> {
    match mode {
        ProbeMode::Tcp => Arc::new(TcpTransport),
        ProbeMode::Icmp => Arc::new(IcmpTransport),
        ProbeMode::Auto => Arc::new(AutoTransport::new(
            Arc::new(IcmpTransport),
            Arc::new(TcpTransport),
        )),
    }
}

/// ICMP for IPv4 targets while raw sockets are permitted, TCP otherwise.
///
/// The first permission error switches the transport to TCP for the rest of
/// the process lifetime.
pub struct AutoTransport {
    icmp: Arc<dyn ProbeTransport>,
    tcp: Arc<dyn ProbeTransport>,
    icmp_disabled: AtomicBool,
}

impl AutoTransport {
    pub fn new(icmp: Arc<dyn ProbeTransport>, tcp: Arc<dyn ProbeTransport>) -> Self {
        Self {
            icmp,
            tcp,
            icmp_disabled: AtomicBool::new(false),
        }
    }

    pub fn icmp_disabled(&self) -> bool {
        self.icmp_disabled.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ProbeTransport for AutoTransport {
    fn name(&self) -> &'static str {
        if self.icmp_disabled() {
            "auto/tcp"
        } else {
            "auto"
        }
    }

    async fn check(&self, target: &NodeId, deadline: Duration) -> io::Result<()> {
        if self.icmp_disabled() || target.host().parse::<std::net::Ipv6Addr>().is_ok() {
            return self.tcp.check(target, deadline).await;
        }

        match self.icmp.check(target, deadline).await {
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                if !self.icmp_disabled.swap(true, Ordering::Relaxed) {
                    warn!(
                        "probe: auto: raw sockets not permitted, falling back to tcp, error={}",
                        e
                    );
                }
                self.tcp.check(target, deadline).await
            }
            Err(e) if e.kind() == io::ErrorKind::AddrNotAvailable => {
                // No IPv4 address behind the name.
                self.tcp.check(target, deadline).await
            }
            other => other,
        }
    }
}

/// Resolve a target to its first IPv4 address.
pub(crate) async fn resolve_ipv4(target: &NodeId) -> io::Result<Ipv4Addr> {
    if let Ok(ip) = target.host().parse::<IpAddr>() {
        return match ip {
            IpAddr::V4(v4) => Ok(v4),
            IpAddr::V6(_) => Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "ipv6 target has no ipv4 address",
            )),
        };
    }

    tokio::net::lookup_host((target.host(), target.port()))
        .await?
        .find_map(|addr| match addr.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no ipv4 address for {}", target.host()),
            )
        })
}
