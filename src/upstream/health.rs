use super::registry::NodeRegistry;
use super::tracker::Transition;
use crate::config::HealthThresholds;
use crate::probe::Prober;
use futures_util::stream::{self, StreamExt};
use tracing::debug;

/// Run a single round of probes across every registered node, concurrently.
///
/// Results are fed through the registry into each node's state machine; the
/// transitions they caused are returned. The caller owns the cadence.
pub async fn run_probe_round(
    registry: &NodeRegistry,
    prober: &Prober,
    thresholds: &HealthThresholds,
) -> Vec<Transition> {
    let nodes = registry.nodes();
    if nodes.is_empty() {
        return Vec::new();
    }
    let concurrency = nodes.len();

    let results: Vec<_> = stream::iter(nodes)
        .map(|node| async move { prober.probe(node.id()).await })
        .buffer_unordered(concurrency)
        .collect()
        .await;

    let mut transitions = Vec::new();
    for result in &results {
        let outcome = if result.success { "success" } else { "failure" };
        metrics::counter!(
            "balancer_probe_total",
            "node" => result.node.to_string(),
            "result" => outcome,
        )
        .increment(1);
        if result.success {
            metrics::histogram!(
                "balancer_probe_duration_seconds",
                "node" => result.node.to_string(),
            )
            .record(result.latency.as_secs_f64());
        }
        debug!(
            "health: probe finished, node={}, result={}, latency_ms={}",
            result.node,
            outcome,
            result.latency.as_millis()
        );

        if let Some(t) = registry.record(result, thresholds) {
            transitions.push(t);
        }
    }
    transitions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::probe::tests::ScriptedTransport;
    use crate::upstream::{HealthState, NodeId};
    use std::io;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_rounds_drive_state_machine() {
        let registry = NodeRegistry::new(&[
            NodeConfig::new("10.0.0.1", 8443),
            NodeConfig::new("10.0.0.2", 8443),
        ]);
        let transport = Arc::new(ScriptedTransport::default());
        let prober = Prober::new(transport.clone(), Duration::from_millis(100));
        let thresholds = HealthThresholds::default();
        let bad = NodeId::new("10.0.0.2", 8443);

        let first = run_probe_round(&registry, &prober, &thresholds).await;
        assert_eq!(first.len(), 2);
        assert_eq!(registry.snapshot().count(HealthState::Healthy), 2);

        transport.fail(&bad, io::ErrorKind::ConnectionRefused);
        for _ in 0..2 {
            run_probe_round(&registry, &prober, &thresholds).await;
        }
        let snap = registry.snapshot();
        let state_of = |id: &NodeId| {
            snap.entries
                .iter()
                .find(|e| e.node.id() == id)
                .map(|e| e.state)
        };
        assert_eq!(state_of(&bad), Some(HealthState::Degraded));

        let mut down = Vec::new();
        for _ in 0..3 {
            down.extend(run_probe_round(&registry, &prober, &thresholds).await);
        }
        assert_eq!(down.len(), 1);
        assert_eq!(down[0].node, bad);
        assert_eq!(down[0].to, HealthState::Down);

        transport.heal(&bad);
        run_probe_round(&registry, &prober, &thresholds).await;
        let recovered = run_probe_round(&registry, &prober, &thresholds).await;
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].from, HealthState::Down);
        assert_eq!(recovered[0].to, HealthState::Healthy);
    }

    #[tokio::test]
    async fn test_empty_registry_round() {
        let registry = NodeRegistry::new(&[]);
        let prober = Prober::new(Arc::new(ScriptedTransport::default()), Duration::from_millis(10));
        assert!(run_probe_round(&registry, &prober, &HealthThresholds::default())
            .await
            .is_empty());
    }
}
