use super::node::{HealthState, Node, NodeId};
use super::tracker::{self, Transition};
use crate::config::{HealthThresholds, NodeConfig};
use crate::probe::ProbeResult;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

struct NodeSet {
    generation: u64,
    nodes: Vec<Arc<Node>>,
}

/// Authoritative node set.
///
/// Readers take a lock-free snapshot; `reload` swaps the entire set at once,
/// so a concurrent selection observes either the old or the new set.
pub struct NodeRegistry {
    set: ArcSwap<NodeSet>,
}

/// Point-in-time view of the registry.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    pub generation: u64,
    pub entries: Vec<SnapshotEntry>,
}

#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    pub node: Arc<Node>,
    pub state: HealthState,
}

impl RegistrySnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count(&self, state: HealthState) -> usize {
        self.entries.iter().filter(|e| e.state == state).count()
    }
}

impl NodeRegistry {
    pub fn new(configs: &[NodeConfig]) -> Self {
        let nodes = build_nodes(configs, &HashMap::new());
        Self {
            set: ArcSwap::from_pointee(NodeSet {
                generation: 0,
                nodes,
            }),
        }
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let set = self.set.load();
        RegistrySnapshot {
            generation: set.generation,
            entries: set
                .nodes
                .iter()
                .map(|node| SnapshotEntry {
                    node: node.clone(),
                    state: node.state(),
                })
                .collect(),
        }
    }

    /// Nodes to probe this round.
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.set.load().nodes.clone()
    }

    pub fn generation(&self) -> u64 {
        self.set.load().generation
    }

    /// Replace the whole node set. Nodes whose identity survives keep their
    /// health record and in-flight counter; relays holding old handles are
    /// untouched.
    pub fn reload(&self, configs: &[NodeConfig]) -> u64 {
        let current = self.set.load_full();
        let previous: HashMap<NodeId, Arc<Node>> = current
            .nodes
            .iter()
            .map(|n| (n.id().clone(), n.clone()))
            .collect();

        let nodes = build_nodes(configs, &previous);
        let kept = nodes
            .iter()
            .filter(|n| previous.contains_key(n.id()))
            .count();
        let generation = current.generation + 1;

        info!(
            generation,
            nodes = nodes.len(),
            kept,
            added = nodes.len() - kept,
            removed = previous.len() - kept,
            "registry: node set reloaded, generation={}, nodes={}",
            generation,
            nodes.len()
        );
        metrics::gauge!("balancer_registry_nodes").set(nodes.len() as f64);
        self.set.store(Arc::new(NodeSet { generation, nodes }));
        generation
    }

    /// Route a probe result to the owning node's state machine. Results for
    /// nodes that were removed by a concurrent reload are dropped.
    pub fn record(
        &self,
        result: &ProbeResult,
        thresholds: &HealthThresholds,
    ) -> Option<Transition> {
        let set = self.set.load();
        match set.nodes.iter().find(|n| n.id() == &result.node) {
            Some(node) => tracker::update(node, result, thresholds),
            None => {
                debug!("registry: dropping probe result for removed node, node={}", result.node);
                None
            }
        }
    }
}

fn build_nodes(configs: &[NodeConfig], previous: &HashMap<NodeId, Arc<Node>>) -> Vec<Arc<Node>> {
    let mut seen = std::collections::HashSet::new();
    configs
        .iter()
        .filter(|c| seen.insert((c.host.clone(), c.port)))
        .map(|c| {
            let id = NodeId::new(&c.host, c.port);
            match previous.get(&id) {
                Some(prev) => Arc::new(Node::carry_over(c, prev)),
                None => Arc::new(Node::new(c)),
            }
        })
        .collect()
}
