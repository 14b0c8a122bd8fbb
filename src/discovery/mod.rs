pub mod client;

pub use client::{strip_address, to_node_configs, PanelClient, PanelNode};
