use crate::config::{BalancerConfig, NodeConfig};
use crate::upstream::{NodeRegistry, Selector};
use arc_swap::ArcSwap;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Shared state handed to the accept loop and the background loops.
#[derive(Clone)]
pub struct BalancerState {
    pub config: Arc<ArcSwap<BalancerConfig>>,
    pub registry: Arc<NodeRegistry>,
    pub selector: Arc<Selector>,
    /// Nodes from the panel. When non-empty they replace the static set.
    discovered: Arc<ArcSwap<Vec<NodeConfig>>>,
    /// Serializes store-then-reload so the registry always ends on the latest inputs.
    reload_lock: Arc<Mutex<()>>,
}

impl BalancerState {
    pub fn new(config: BalancerConfig) -> Self {
        let registry = NodeRegistry::new(&config.nodes);
        Self {
            config: Arc::new(ArcSwap::from_pointee(config)),
            registry: Arc::new(registry),
            selector: Arc::new(Selector::new()),
            discovered: Arc::new(ArcSwap::from_pointee(Vec::new())),
            reload_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn effective_nodes(&self) -> Vec<NodeConfig> {
        let discovered = self.discovered.load();
        if discovered.is_empty() {
            self.config.load().nodes.clone()
        } else {
            discovered.to_vec()
        }
    }

    /// Swap in a new configuration (SIGHUP). The registry is reloaded when
    /// the static set is the effective one and it changed.
    pub fn apply_config(&self, config: BalancerConfig) -> bool {
        let _reload = self.reload_lock.lock().unwrap_or_else(|e| e.into_inner());
        let old = self.config.load();
        if old.probe.interval != config.probe.interval || old.probe.mode != config.probe.mode {
            info!("config: probe mode and interval changes take effect after restart");
        }
        self.config.store(Arc::new(config));
        self.refresh_registry()
    }

    /// Record the panel's node list. Returns `true` when the registry changed.
    pub fn set_discovered(&self, nodes: Vec<NodeConfig>) -> bool {
        let _reload = self.reload_lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.discovered.load().as_slice() == nodes.as_slice() {
            return false;
        }
        self.discovered.store(Arc::new(nodes));
        self.refresh_registry()
    }

    /// Caller holds `reload_lock`.
    fn refresh_registry(&self) -> bool {
        let wanted = self.effective_nodes();
        let current = self.registry.nodes();
        let unchanged = wanted.len() == current.len()
            && wanted.iter().zip(current.iter()).all(|(w, n)| {
                n.id().host() == w.host
                    && n.id().port() == w.port
                    && n.weight() == w.weight.max(1)
                    && n.priority() == w.priority
            });
        if unchanged {
            return false;
        }
        self.registry.reload(&wanted);
        true
    }
}
