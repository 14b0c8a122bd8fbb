pub mod bootstrap;
pub mod runtime;
mod state;

pub use state::BalancerState;

use crate::proxy;
use anyhow::Result;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

/// Run the accept loop until `shutdown` is cancelled.
///
/// Every connection runs in its own task. On shutdown the listener is
/// dropped, open sessions get `drain_timeout` to finish on their own, and
/// whatever is left is aborted.
pub async fn run_proxy_server(
    listener: TcpListener,
    state: BalancerState,
    shutdown: CancellationToken,
    drain_timeout: Duration,
) -> Result<()> {
    let addr = listener.local_addr()?;
    info!("server: proxy listening, addr={}", addr);

    let tracker = TaskTracker::new();
    let abort = CancellationToken::new();

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.cancelled() => {
                info!("server: proxy: stop accepting new connections, draining...");
                break;
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => {
                metrics::counter!("balancer_connections_total", "status" => "accepted").increment(1);
                v
            }
            Err(e) => {
                error!("server: proxy: accept failed, error={}", e);
                metrics::counter!("balancer_connections_total", "status" => "error").increment(1);
                continue;
            }
        };

        metrics::gauge!("balancer_connections_active").increment(1.0);
        let state = state.clone();
        let abort = abort.child_token();
        tracker.spawn(async move {
            proxy::handle_connection(stream, peer_addr, state, abort).await;
            metrics::gauge!("balancer_connections_active").decrement(1.0);
        });
    }

    drop(listener);
    tracker.close();

    if !tracker.is_empty() {
        info!("server: proxy: waiting for {} active connections to drain", tracker.len());
        if tokio::time::timeout(drain_timeout, tracker.wait()).await.is_err() {
            warn!(
                "server: proxy: drain timeout ({}s), aborting {} connections",
                drain_timeout.as_secs(),
                tracker.len()
            );
            abort.cancel();
            tracker.wait().await;
        }
    }
    info!("server: proxy: all connections drained");
    Ok(())
}
