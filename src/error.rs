use std::fmt;

#[derive(Debug)]
pub enum BalancerError {
    /// Invalid configuration. Fatal at startup, logged and ignored on reload.
    Config(String),
    /// Every node is DOWN or UNKNOWN; the inbound connection is rejected.
    NoHealthyNode,
    UpstreamConnect(String),
    UpstreamTimeout,
    Relay(std::io::Error),
    Http(reqwest::Error),
    Panel(String),
    Alert(String),
}

impl fmt::Display for BalancerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BalancerError::Config(msg) => write!(f, "config error: {}", msg),
            BalancerError::NoHealthyNode => write!(f, "no healthy node available"),
            BalancerError::UpstreamConnect(msg) => write!(f, "upstream connect error: {}", msg),
            BalancerError::UpstreamTimeout => write!(f, "upstream connect timeout"),
            BalancerError::Relay(e) => write!(f, "relay error: {}", e),
            BalancerError::Http(e) => write!(f, "http error: {}", e),
            BalancerError::Panel(msg) => write!(f, "panel error: {}", msg),
            BalancerError::Alert(msg) => write!(f, "alert error: {}", msg),
        }
    }
}

impl std::error::Error for BalancerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BalancerError::Relay(e) => Some(e),
            BalancerError::Http(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for BalancerError {
    fn from(e: std::io::Error) -> Self {
        BalancerError::Relay(e)
    }
}
