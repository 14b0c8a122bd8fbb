use super::node::{HealthState, InFlightGuard, Node, NodeId};
use super::registry::RegistrySnapshot;
use crate::error::BalancerError;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Why a node was picked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingReason {
    OnlyHealthy,
    WeightedHealthy { candidates: usize, tier: u32 },
    OnlyDegraded,
    WeightedDegraded { candidates: usize, tier: u32 },
}

impl RoutingReason {
    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::OnlyDegraded | Self::WeightedDegraded { .. })
    }
}

impl fmt::Display for RoutingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OnlyHealthy => f.write_str("only healthy node"),
            Self::WeightedHealthy { candidates, tier } => write!(
                f,
                "weighted round-robin among {} healthy nodes in tier {}",
                candidates, tier
            ),
            Self::OnlyDegraded => f.write_str("degraded fallback, only degraded node"),
            Self::WeightedDegraded { candidates, tier } => write!(
                f,
                "degraded fallback, weighted round-robin among {} degraded nodes in tier {}",
                candidates, tier
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub node: NodeId,
    pub state: HealthState,
    pub reason: RoutingReason,
    pub generation: u64,
}

/// A chosen node plus the guard holding its in-flight slot.
#[derive(Debug)]
pub struct Selection {
    pub guard: InFlightGuard,
    pub decision: RoutingDecision,
}

impl Selection {
    pub fn node(&self) -> &Arc<Node> {
        self.guard.node()
    }
}

/// Smooth weighted round-robin over the best eligible tier.
#[derive(Default)]
pub struct Selector {
    current: Mutex<HashMap<NodeId, i64>>,
}

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(&self, snapshot: &RegistrySnapshot) -> Result<Selection, BalancerError> {
        let (state, pool) = eligible(snapshot).ok_or(BalancerError::NoHealthyNode)?;

        let tier = pool.iter().map(|n| n.priority()).min().unwrap_or_default();
        let candidates: Vec<&Arc<Node>> = pool.into_iter().filter(|n| n.priority() == tier).collect();
        let total: i64 = candidates.iter().map(|n| n.weight() as i64).sum();

        let chosen = {
            let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
            // Nodes outside this pool start again from zero when they return.
            current.retain(|id, _| candidates.iter().any(|n| n.id() == id));

            let mut best: Option<(&Arc<Node>, i64)> = None;
            for &node in &candidates {
                let cw = current.entry(node.id().clone()).or_insert(0);
                *cw += node.weight() as i64;
                let cw = *cw;
                let better = match best {
                    None => true,
                    Some((b, bw)) => {
                        (cw, Reverse(node.in_flight()), Reverse(node.id()))
                            > (bw, Reverse(b.in_flight()), Reverse(b.id()))
                    }
                };
                if better {
                    best = Some((node, cw));
                }
            }

            // Non-empty candidates always yield a winner.
            let (node, _) = best.ok_or(BalancerError::NoHealthyNode)?;
            if let Some(cw) = current.get_mut(node.id()) {
                *cw -= total;
            }
            node.clone()
        };

        let reason = match (state, candidates.len()) {
            (HealthState::Healthy, 1) => RoutingReason::OnlyHealthy,
            (HealthState::Healthy, n) => RoutingReason::WeightedHealthy { candidates: n, tier },
            (_, 1) => RoutingReason::OnlyDegraded,
            (_, n) => RoutingReason::WeightedDegraded { candidates: n, tier },
        };

        Ok(Selection {
            decision: RoutingDecision {
                node: chosen.id().clone(),
                state,
                reason,
                generation: snapshot.generation,
            },
            guard: chosen.acquire(),
        })
    }
}

/// Healthy nodes, else degraded ones. Down and Unknown are never eligible.
fn eligible(snapshot: &RegistrySnapshot) -> Option<(HealthState, Vec<&Arc<Node>>)> {
    [HealthState::Healthy, HealthState::Degraded]
        .into_iter()
        .map(|state| {
            let nodes: Vec<&Arc<Node>> = snapshot
                .entries
                .iter()
                .filter(|e| e.state == state)
                .map(|e| &e.node)
                .collect();
            (state, nodes)
        })
        .find(|(_, nodes)| !nodes.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::upstream::registry::SnapshotEntry;

    fn entry(host: &str, weight: u32, priority: u32, state: HealthState) -> SnapshotEntry {
        let node = Node::new(&NodeConfig::new(host, 80).with_weight(weight).with_priority(priority));
        SnapshotEntry {
            node: Arc::new(node),
            state,
        }
    }

    fn snapshot(entries: Vec<SnapshotEntry>) -> RegistrySnapshot {
        RegistrySnapshot {
            generation: 7,
            entries,
        }
    }

    fn pick(selector: &Selector, snap: &RegistrySnapshot) -> String {
        selector.select(snap).unwrap().decision.node.host().to_string()
    }

    #[test]
    fn test_weighted_distribution() {
        let snap = snapshot(vec![
            entry("a", 1, 0, HealthState::Healthy),
            entry("b", 1, 0, HealthState::Healthy),
            entry("c", 2, 0, HealthState::Healthy),
        ]);
        let selector = Selector::new();
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..1000 {
            *counts.entry(pick(&selector, &snap)).or_default() += 1;
        }
        assert_eq!(counts["c"], 500);
        assert_eq!(counts["a"], 250);
        assert_eq!(counts["b"], 250);
    }

    #[test]
    fn test_smooth_sequence() {
        let snap = snapshot(vec![
            entry("a", 1, 0, HealthState::Healthy),
            entry("b", 1, 0, HealthState::Healthy),
            entry("c", 2, 0, HealthState::Healthy),
        ]);
        let selector = Selector::new();
        let seq: Vec<String> = (0..4).map(|_| pick(&selector, &snap)).collect();
        assert_eq!(seq, vec!["c", "a", "b", "c"]);
    }

    #[test]
    fn test_never_returns_down_or_unknown() {
        let snap = snapshot(vec![
            entry("a", 5, 0, HealthState::Down),
            entry("b", 5, 0, HealthState::Unknown),
            entry("c", 1, 0, HealthState::Healthy),
        ]);
        let selector = Selector::new();
        for _ in 0..100 {
            let sel = selector.select(&snap).unwrap();
            assert_eq!(sel.decision.node.host(), "c");
            assert_eq!(sel.decision.reason, RoutingReason::OnlyHealthy);
        }
    }

    #[test]
    fn test_degraded_only_when_no_healthy() {
        let snap = snapshot(vec![
            entry("a", 1, 0, HealthState::Degraded),
            entry("b", 1, 1, HealthState::Healthy),
        ]);
        let selector = Selector::new();
        assert_eq!(pick(&selector, &snap), "b");

        let snap = snapshot(vec![
            entry("a", 1, 0, HealthState::Degraded),
            entry("b", 1, 0, HealthState::Degraded),
            entry("c", 1, 0, HealthState::Down),
        ]);
        let sel = selector.select(&snap).unwrap();
        assert_eq!(sel.decision.state, HealthState::Degraded);
        assert!(sel.decision.reason.is_fallback());
        assert_eq!(
            sel.decision.reason.to_string(),
            "degraded fallback, weighted round-robin among 2 degraded nodes in tier 0"
        );
    }

    #[test]
    fn test_no_healthy_node() {
        let snap = snapshot(vec![
            entry("a", 1, 0, HealthState::Down),
            entry("b", 1, 0, HealthState::Unknown),
        ]);
        assert!(matches!(
            Selector::new().select(&snap),
            Err(BalancerError::NoHealthyNode)
        ));
        assert!(matches!(
            Selector::new().select(&snapshot(vec![])),
            Err(BalancerError::NoHealthyNode)
        ));
    }

    #[test]
    fn test_lowest_tier_wins() {
        let snap = snapshot(vec![
            entry("a", 10, 2, HealthState::Healthy),
            entry("b", 1, 1, HealthState::Healthy),
            entry("c", 1, 1, HealthState::Healthy),
        ]);
        let selector = Selector::new();
        for _ in 0..20 {
            assert_ne!(pick(&selector, &snap), "a");
        }
        let sel = selector.select(&snap).unwrap();
        assert_eq!(
            sel.decision.reason,
            RoutingReason::WeightedHealthy { candidates: 2, tier: 1 }
        );
        assert_eq!(sel.decision.generation, 7);
    }

    #[test]
    fn test_tie_prefers_fewest_in_flight() {
        let snap = snapshot(vec![
            entry("a", 1, 0, HealthState::Healthy),
            entry("b", 1, 0, HealthState::Healthy),
        ]);
        let _busy = snap.entries[0].node.acquire();
        let selector = Selector::new();
        assert_eq!(pick(&selector, &snap), "b");
    }

    #[test]
    fn test_guard_tracks_in_flight() {
        let snap = snapshot(vec![entry("a", 1, 0, HealthState::Healthy)]);
        let selector = Selector::new();
        let sel = selector.select(&snap).unwrap();
        assert_eq!(snap.entries[0].node.in_flight(), 1);
        drop(sel);
        assert_eq!(snap.entries[0].node.in_flight(), 0);
    }

    #[test]
    fn test_returning_node_starts_from_zero_weight() {
        let selector = Selector::new();
        let both = snapshot(vec![
            entry("a", 1, 0, HealthState::Healthy),
            entry("b", 3, 0, HealthState::Healthy),
        ]);
        assert_eq!(pick(&selector, &both), "b");

        // b leaves the pool for a while.
        let only_a = snapshot(vec![both.entries[0].clone(), entry("b", 3, 0, HealthState::Down)]);
        for _ in 0..3 {
            assert_eq!(pick(&selector, &only_a), "a");
        }

        // a carries 1, b restarts at 0: b wins the first pick back.
        let back = snapshot(vec![both.entries[0].clone(), both.entries[1].clone()]);
        assert_eq!(pick(&selector, &back), "b");
    }
}
