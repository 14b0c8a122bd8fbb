use super::node::{HealthRecord, HealthState, Node, NodeId};
use crate::config::HealthThresholds;
use crate::probe::ProbeResult;
use std::time::SystemTime;
use tracing::{info, warn};

/// A health state change, published to logs, metrics and alerts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub node: NodeId,
    pub from: HealthState,
    pub to: HealthState,
    /// Consecutive outcomes that triggered the change.
    pub count: u32,
    pub at: SystemTime,
}

impl Transition {
    pub fn is_worsening(&self) -> bool {
        rank(self.to) > rank(self.from)
    }
}

fn rank(state: HealthState) -> u8 {
    match state {
        HealthState::Healthy => 0,
        HealthState::Unknown => 1,
        HealthState::Degraded => 2,
        HealthState::Down => 3,
    }
}

/// Advance one record by one probe outcome.
///
/// Returns `(from, to, count)` when the state changed. The failure counter
/// restarts when a node enters `Degraded`, so `down_threshold` is counted from
/// that point on.
pub fn step(
    record: &mut HealthRecord,
    success: bool,
    thresholds: &HealthThresholds,
) -> Option<(HealthState, HealthState, u32)> {
    let from = record.state;

    if success {
        record.consecutive_failures = 0;
        record.consecutive_successes = record.consecutive_successes.saturating_add(1);
        let count = record.consecutive_successes;

        let to = match from {
            HealthState::Unknown => HealthState::Healthy,
            HealthState::Degraded | HealthState::Down
                if count >= thresholds.recover_threshold =>
            {
                HealthState::Healthy
            }
            _ => return None,
        };
        record.state = to;
        return Some((from, to, count));
    }

    record.consecutive_successes = 0;
    record.consecutive_failures = record.consecutive_failures.saturating_add(1);
    let count = record.consecutive_failures;

    let to = match from {
        HealthState::Healthy if count >= thresholds.degrade_threshold => {
            record.consecutive_failures = 0;
            HealthState::Degraded
        }
        HealthState::Degraded | HealthState::Unknown if count >= thresholds.down_threshold => {
            HealthState::Down
        }
        _ => return None,
    };
    record.state = to;
    Some((from, to, count))
}

/// Feed a probe result into the node's state machine.
pub fn update(
    node: &Node,
    result: &ProbeResult,
    thresholds: &HealthThresholds,
) -> Option<Transition> {
    let changed = {
        let mut record = node.lock_health();
        record.last_probe_at = Some(result.at);
        if result.success {
            record.last_latency = Some(result.latency);
        }
        step(&mut record, result.success, thresholds)
    };

    let (from, to, count) = changed?;
    let transition = Transition {
        node: node.id().clone(),
        from,
        to,
        count,
        at: result.at,
    };

    if transition.is_worsening() {
        warn!(
            node = %transition.node,
            from = %from,
            to = %to,
            consecutive_failures = count,
            "health: node state worsened, node={}, {} -> {}",
            transition.node, from, to
        );
    } else {
        info!(
            node = %transition.node,
            from = %from,
            to = %to,
            consecutive_successes = count,
            "health: node state improved, node={}, {} -> {}",
            transition.node, from, to
        );
    }
    metrics::counter!(
        "balancer_health_transitions_total",
        "node" => transition.node.to_string(),
        "to" => to.as_str()
    )
    .increment(1);
    metrics::gauge!("balancer_node_state", "node" => transition.node.to_string())
        .set(to.as_gauge());

    Some(transition)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use std::time::Duration;

    fn thresholds() -> HealthThresholds {
        HealthThresholds::default()
    }

    fn feed(record: &mut HealthRecord, outcomes: &[bool]) -> Vec<(HealthState, HealthState)> {
        outcomes
            .iter()
            .filter_map(|&ok| step(record, ok, &thresholds()))
            .map(|(from, to, _)| (from, to))
            .collect()
    }

    #[test]
    fn test_first_success_makes_unknown_healthy() {
        let mut record = HealthRecord::default();
        let t = step(&mut record, true, &thresholds());
        assert_eq!(t, Some((HealthState::Unknown, HealthState::Healthy, 1)));
    }

    #[test]
    fn test_degrade_down_recover_scenario() {
        let mut record = HealthRecord::default();
        feed(&mut record, &[true]);
        assert_eq!(record.state, HealthState::Healthy);

        let changes = feed(&mut record, &[false, false]);
        assert_eq!(changes, vec![(HealthState::Healthy, HealthState::Degraded)]);
        assert_eq!(record.consecutive_failures, 0);

        assert!(feed(&mut record, &[false, false]).is_empty());
        assert_eq!(record.state, HealthState::Degraded);
        let changes = feed(&mut record, &[false]);
        assert_eq!(changes, vec![(HealthState::Degraded, HealthState::Down)]);

        assert!(feed(&mut record, &[true]).is_empty());
        let changes = feed(&mut record, &[true]);
        assert_eq!(changes, vec![(HealthState::Down, HealthState::Healthy)]);
    }

    #[test]
    fn test_single_failure_on_healthy_is_absorbed() {
        let mut record = HealthRecord::default();
        feed(&mut record, &[true, false, true, false, true]);
        assert_eq!(record.state, HealthState::Healthy);
        assert_eq!(record.consecutive_failures, 0);
        assert_eq!(record.consecutive_successes, 1);
    }

    #[test]
    fn test_opposite_outcome_resets_counter() {
        let mut record = HealthRecord::default();
        feed(&mut record, &[true, false, false]);
        assert_eq!(record.state, HealthState::Degraded);

        // Success interrupts the recovery run.
        feed(&mut record, &[true, false, true]);
        assert_eq!(record.state, HealthState::Degraded);
        assert_eq!(record.consecutive_successes, 1);

        // Failure run broken by a success never reaches down.
        feed(&mut record, &[false, false, true, false, false]);
        assert_eq!(record.state, HealthState::Degraded);
    }

    #[test]
    fn test_unknown_goes_down_after_down_threshold() {
        let mut record = HealthRecord::default();
        let changes = feed(&mut record, &[false, false, false]);
        assert_eq!(changes, vec![(HealthState::Unknown, HealthState::Down)]);
    }

    #[test]
    fn test_down_stays_down_on_failures() {
        let mut record = HealthRecord::default();
        feed(&mut record, &[false, false, false]);
        assert!(feed(&mut record, &[false; 10]).is_empty());
        assert_eq!(record.state, HealthState::Down);
    }

    #[test]
    fn test_custom_thresholds() {
        let t = HealthThresholds {
            degrade_threshold: 1,
            down_threshold: 1,
            recover_threshold: 3,
        };
        let mut record = HealthRecord::default();
        step(&mut record, true, &t);
        assert_eq!(step(&mut record, false, &t).map(|c| c.1), Some(HealthState::Degraded));
        assert_eq!(step(&mut record, false, &t).map(|c| c.1), Some(HealthState::Down));
        assert!(step(&mut record, true, &t).is_none());
        assert!(step(&mut record, true, &t).is_none());
        assert_eq!(step(&mut record, true, &t).map(|c| c.1), Some(HealthState::Healthy));
    }

    #[test]
    fn test_update_records_probe_metadata() {
        let node = Node::new(&NodeConfig::new("10.0.0.1", 8443));
        let at = SystemTime::now();
        let result = ProbeResult {
            node: node.id().clone(),
            success: true,
            latency: Duration::from_millis(12),
            at,
        };
        let t = update(&node, &result, &thresholds()).unwrap();
        assert_eq!(t.from, HealthState::Unknown);
        assert_eq!(t.to, HealthState::Healthy);
        assert!(!t.is_worsening());

        let record = node.health();
        assert_eq!(record.last_probe_at, Some(at));
        assert_eq!(record.last_latency, Some(Duration::from_millis(12)));
    }
}
