mod handler;
pub mod relay;

pub use handler::{connect_upstream, handle_connection};
pub use relay::{relay, RelayLimits, RelayOutcome, RelayStats};
