use crate::error::BalancerError;
use crate::proxy::relay::{relay, RelayLimits, RelayOutcome};
use crate::server::BalancerState;
use crate::upstream::NodeId;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Handle one inbound connection:
///
/// 1. SELECT  - pick a node from the current registry snapshot, or close
/// 2. CONNECT - dial the node within the connect timeout
/// 3. RELAY   - copy bytes both ways until EOF, a timeout or abort
///
/// The in-flight slot taken at SELECT is held until this function returns.
pub async fn handle_connection(
    client: TcpStream,
    peer_addr: SocketAddr,
    state: BalancerState,
    abort: CancellationToken,
) {
    let snapshot = state.registry.snapshot();
    let selection = match state.selector.select(&snapshot) {
        Ok(s) => s,
        Err(e) => {
            warn!(
                peer = %peer_addr,
                nodes = snapshot.len(),
                "proxy: rejecting connection, peer={}, error={}",
                peer_addr,
                e
            );
            metrics::counter!("balancer_connections_rejected_total", "reason" => "no_healthy_node")
                .increment(1);
            drop(client);
            return;
        }
    };

    let decision = &selection.decision;
    debug!(
        peer = %peer_addr,
        node = %decision.node,
        state = %decision.state,
        generation = decision.generation,
        "proxy: routing decision, peer={}, node={}, reason={}",
        peer_addr,
        decision.node,
        decision.reason
    );
    if decision.reason.is_fallback() {
        metrics::counter!("balancer_degraded_fallback_total").increment(1);
    }

    let relay_cfg = state.config.load().relay.clone();
    let started = Instant::now();

    let upstream = match connect_upstream(&decision.node, relay_cfg.connect_timeout).await {
        Ok(s) => s,
        Err(e) => {
            warn!(
                peer = %peer_addr,
                node = %decision.node,
                "proxy: upstream connect failed, peer={}, node={}, error={}",
                peer_addr,
                decision.node,
                e
            );
            metrics::counter!(
                "balancer_upstream_connect_errors_total",
                "node" => decision.node.to_string(),
            )
            .increment(1);
            return;
        }
    };
    client.set_nodelay(true).ok();

    let limits = RelayLimits {
        idle: relay_cfg.idle_timeout,
        session: (!relay_cfg.session_timeout.is_zero()).then_some(relay_cfg.session_timeout),
    };
    let stats = relay(client, upstream, limits, &abort).await;
    let elapsed = started.elapsed();

    metrics::counter!(
        "balancer_sessions_total",
        "node" => decision.node.to_string(),
        "outcome" => stats.outcome.as_str(),
    )
    .increment(1);
    metrics::counter!("balancer_relay_bytes_total", "direction" => "upstream")
        .increment(stats.client_to_upstream);
    metrics::counter!("balancer_relay_bytes_total", "direction" => "downstream")
        .increment(stats.upstream_to_client);
    metrics::histogram!("balancer_session_duration_seconds").record(elapsed.as_secs_f64());

    match &stats.outcome {
        RelayOutcome::Failed(e) => warn!(
            peer = %peer_addr,
            node = %decision.node,
            sent = stats.client_to_upstream,
            received = stats.upstream_to_client,
            "proxy: session failed, peer={}, node={}, error={}",
            peer_addr,
            decision.node,
            e
        ),
        outcome => info!(
            peer = %peer_addr,
            node = %decision.node,
            sent = stats.client_to_upstream,
            received = stats.upstream_to_client,
            duration_ms = elapsed.as_millis() as u64,
            "proxy: session closed, peer={}, node={}, outcome={}",
            peer_addr,
            decision.node,
            outcome.as_str()
        ),
    }

    drop(selection);
}

pub async fn connect_upstream(node: &NodeId, connect_timeout: Duration) -> Result<TcpStream, BalancerError> {
    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect((node.host(), node.port())))
        .await
        .map_err(|_| BalancerError::UpstreamTimeout)?
        .map_err(|e| BalancerError::UpstreamConnect(format!("{}: {}", node, e)))?;
    stream.set_nodelay(true).ok();
    Ok(stream)
}
