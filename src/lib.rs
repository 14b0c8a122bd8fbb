pub mod alert;
pub mod config;
pub mod discovery;
pub mod error;
pub mod metrics;
pub mod probe;
pub mod proxy;
pub mod server;
pub mod upstream;
