pub mod health;
pub mod node;
pub mod registry;
pub mod selector;
pub mod tracker;

pub use health::run_probe_round;
pub use node::{HealthRecord, HealthState, InFlightGuard, Node, NodeId};
pub use registry::{NodeRegistry, RegistrySnapshot, SnapshotEntry};
pub use selector::{RoutingDecision, RoutingReason, Selection, Selector};
pub use tracker::Transition;
