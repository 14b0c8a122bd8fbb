use super::ProbeTransport;
use crate::upstream::NodeId;
use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;

/// Liveness by TCP connect to the node's service port.
pub struct TcpTransport;

#[async_trait]
impl ProbeTransport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn check(&self, target: &NodeId, deadline: Duration) -> io::Result<()> {
        let stream = tokio::time::timeout(deadline, TcpStream::connect((target.host(), target.port())))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "tcp connect timed out"))??;
        drop(stream);
        Ok(())
    }
}
