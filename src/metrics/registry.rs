use anyhow::Result;
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;

/// Histogram bucket boundaries for probe latency (seconds).
const PROBE_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0];

/// Histogram bucket boundaries for relay session length (seconds).
const SESSION_BUCKETS: &[f64] = &[0.1, 1.0, 10.0, 60.0, 300.0, 900.0, 3600.0, 14400.0];

/// Handle for the process-wide metrics exporter.
///
/// Without an installed recorder the `metrics` macros are no-ops, so nothing
/// is collected unless a scrape address is configured.
pub struct Metrics;

impl Metrics {
    /// Install the Prometheus recorder with a scrape listener on `listen` and
    /// register metric descriptions. Call once, inside the runtime.
    pub fn install(listen: SocketAddr) -> Result<()> {
        PrometheusBuilder::new()
            .with_http_listener(listen)
            .set_buckets_for_metric(
                Matcher::Full("balancer_probe_duration_seconds".to_string()),
                PROBE_BUCKETS,
            )?
            .set_buckets_for_metric(
                Matcher::Full("balancer_session_duration_seconds".to_string()),
                SESSION_BUCKETS,
            )?
            .install()?;

        describe();
        tracing::info!("metrics: prometheus exporter listening, addr={}", listen);
        Ok(())
    }
}

fn describe() {
    // probing & health
    describe_counter!("balancer_probe_total", Unit::Count, "Probe attempts by node and result");
    describe_histogram!(
        "balancer_probe_duration_seconds",
        Unit::Seconds,
        "Latency of successful probes"
    );
    describe_counter!(
        "balancer_health_transitions_total",
        Unit::Count,
        "Health state transitions by node and target state"
    );
    describe_gauge!(
        "balancer_node_state",
        Unit::Count,
        "Node health: 0=unknown 1=healthy 2=degraded 3=down"
    );
    describe_gauge!("balancer_nodes", Unit::Count, "Registered nodes by health state");
    describe_gauge!("balancer_registry_nodes", Unit::Count, "Nodes in the active registry set");

    // forwarding
    describe_counter!("balancer_connections_total", Unit::Count, "Inbound connections accepted");
    describe_gauge!("balancer_connections_active", Unit::Count, "Inbound connections open");
    describe_counter!(
        "balancer_connections_rejected_total",
        Unit::Count,
        "Inbound connections closed without a node"
    );
    describe_counter!(
        "balancer_degraded_fallback_total",
        Unit::Count,
        "Connections routed to a degraded node"
    );
    describe_gauge!("balancer_node_in_flight", Unit::Count, "Open sessions per node");
    describe_counter!(
        "balancer_upstream_connect_errors_total",
        Unit::Count,
        "Failed upstream connects per node"
    );
    describe_counter!("balancer_sessions_total", Unit::Count, "Finished sessions by outcome");
    describe_counter!("balancer_relay_bytes_total", Unit::Bytes, "Bytes relayed by direction");
    describe_histogram!(
        "balancer_session_duration_seconds",
        Unit::Seconds,
        "Relay session length"
    );

    // discovery, alerts, config
    describe_gauge!("balancer_discovered_nodes", Unit::Count, "Nodes taken from the panel");
    describe_counter!("balancer_panel_poll_total", Unit::Count, "Panel poll attempts by result");
    describe_counter!("balancer_alerts_total", Unit::Count, "Alert deliveries by result");
    describe_counter!("balancer_config_reloads_total", Unit::Count, "Config reloads by result");
}
