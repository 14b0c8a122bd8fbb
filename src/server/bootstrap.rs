use crate::alert::{Notifier, TelegramSink};
use crate::config::BalancerConfig;
use crate::discovery::{self, PanelClient};
use crate::metrics::Metrics;
use crate::probe::Prober;
use crate::server::{self, BalancerState};
use crate::upstream::{self, HealthState, RegistrySnapshot, Transition};
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const REMINDER_TICK: Duration = Duration::from_secs(60);

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: PathBuf,
    pub env_file: PathBuf,
    pub env_file_status: EnvFileStatus,
    pub listen: Option<String>,
}

/// What happened to the `.env` file before the runtime started.
#[derive(Debug)]
pub enum EnvFileStatus {
    Loaded,
    Missing,
    Failed(String),
}

/// Merge `path` into the process environment. Existing variables win.
///
/// Runs before the runtime is built, so no other threads observe the
/// environment changing.
pub fn load_env_file(path: &Path) -> EnvFileStatus {
    match dotenvy::from_path(path) {
        Ok(()) => EnvFileStatus::Loaded,
        Err(e) if e.not_found() => EnvFileStatus::Missing,
        Err(e) => EnvFileStatus::Failed(e.to_string()),
    }
}

/// Balancer lifecycle: init → load → bind → background loops → serve → drain.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();
    match &args.env_file_status {
        EnvFileStatus::Loaded => tracing::info!("config: env file loaded, path={}", args.env_file.display()),
        EnvFileStatus::Missing => tracing::debug!("config: no env file, path={}", args.env_file.display()),
        EnvFileStatus::Failed(e) => tracing::warn!(
            "config: env file ignored, path={}, error={}",
            args.env_file.display(),
            e
        ),
    }

    // Phase 1: configuration. Any error here is fatal.
    let config = load_config(&args, &HashMap::new())?;

    // Phase 2: metrics exporter, then the listener.
    if let Some(ref listen) = config.metrics.listen {
        Metrics::install(listen.parse()?)?;
    }
    let addr = config.listen_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind {}: {}", addr, e))?;
    let drain_timeout = config.relay.drain_timeout;
    let state = BalancerState::new(config);

    // Phase 3: background loops, all owned here.
    let shutdown = CancellationToken::new();
    let alerts = start_alert_loop(&state, &shutdown);
    start_probe_loop(&state, alerts, &shutdown);
    start_discovery_loop(&state, &shutdown);
    start_reload_listener(&state, &args, &shutdown);

    // Phase 4: serve until a signal arrives, then drain.
    let proxy_handle = tokio::spawn({
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_proxy_server(listener, state, shutdown, drain_timeout).await }
    });

    wait_for_shutdown(&shutdown).await;

    match proxy_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("server: proxy stopped with error, error={}", e),
        Err(e) => tracing::error!("server: proxy task error: {}", e),
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

/// Read config file plus overrides. Keys in `file_env` win over the process
/// environment; the CLI listen address wins over both.
fn load_config(args: &BootstrapArgs, file_env: &HashMap<String, String>) -> Result<BalancerConfig> {
    let mut config = BalancerConfig::load_with(&args.config_path, |key| {
        file_env.get(key).cloned().or_else(|| std::env::var(key).ok())
    })?;
    if let Some(ref listen) = args.listen {
        config.listen = listen.clone();
        config.validate()?;
    }
    Ok(config)
}

/// Current `.env` contents, without touching the process environment.
fn read_env_file(path: &Path) -> HashMap<String, String> {
    match dotenvy::from_path_iter(path) {
        Ok(iter) => iter.filter_map(|item| item.ok()).collect(),
        Err(_) => HashMap::new(),
    }
}

// ---------------------------------------------------------------------------
// Loop owners. Each function spawns a task with its interval loop; the
// upstream/discovery/alert modules only provide single-shot operations.
// ---------------------------------------------------------------------------

/// Sleep for `duration`, but return `true` immediately if shutdown is signalled.
async fn sleep_or_shutdown(duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.cancelled() => true,
    }
}

fn start_probe_loop(
    state: &BalancerState,
    alerts: Option<mpsc::UnboundedSender<Transition>>,
    shutdown: &CancellationToken,
) {
    let (prober, interval) = {
        let cfg = state.config.load();
        (Prober::for_mode(cfg.probe.mode, cfg.probe.timeout), cfg.probe.interval)
    };
    tracing::info!(
        "health: probe loop started, transport={}, interval_ms={}, nodes={}",
        prober.transport_name(),
        interval.as_millis(),
        state.registry.snapshot().len()
    );

    let state = state.clone();
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => return,
            }

            let thresholds = state.config.load().health;
            let transitions = upstream::run_probe_round(&state.registry, &prober, &thresholds).await;
            publish_node_gauges(&state.registry.snapshot());

            if let Some(ref tx) = alerts {
                for t in transitions {
                    // The alert loop only goes away on shutdown.
                    let _ = tx.send(t);
                }
            }
        }
    });
}

fn publish_node_gauges(snapshot: &RegistrySnapshot) {
    for state in [
        HealthState::Unknown,
        HealthState::Healthy,
        HealthState::Degraded,
        HealthState::Down,
    ] {
        metrics::gauge!("balancer_nodes", "state" => state.as_str()).set(snapshot.count(state) as f64);
    }
}

fn start_discovery_loop(state: &BalancerState, shutdown: &CancellationToken) {
    let cfg = state.config.load().discovery.clone();
    if !cfg.enabled() {
        tracing::info!("discovery: panel: disabled, using static nodes");
        return;
    }
    let client = match PanelClient::new(&cfg) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("discovery: panel: client setup failed, error={}", e);
            return;
        }
    };
    tracing::info!(
        "discovery: panel: polling started, url={}, interval_s={}",
        client.base_url(),
        cfg.interval.as_secs()
    );

    let state = state.clone();
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        loop {
            poll_panel(&client, &state).await;
            let interval = state.config.load().discovery.interval;
            if sleep_or_shutdown(interval, &shutdown).await {
                return;
            }
        }
    });
}

/// Single round of panel discovery. Failures keep the current node set.
async fn poll_panel(client: &PanelClient, state: &BalancerState) {
    let start = Instant::now();
    let panel_nodes = match client.list_nodes().await {
        Ok(nodes) => nodes,
        Err(e) => {
            tracing::warn!("discovery: panel: poll failed, error={}", e);
            metrics::counter!("balancer_panel_poll_total", "result" => "error").increment(1);
            return;
        }
    };
    metrics::counter!("balancer_panel_poll_total", "result" => "success").increment(1);

    let port = state.config.load().discovery.service_port;
    let nodes = discovery::to_node_configs(&panel_nodes, port);
    tracing::debug!(
        "discovery: panel: queried, raw_nodes={}, usable={}, duration={:.3}s",
        panel_nodes.len(),
        nodes.len(),
        start.elapsed().as_secs_f64()
    );
    metrics::gauge!("balancer_discovered_nodes").set(nodes.len() as f64);

    let count = nodes.len();
    if state.set_discovered(nodes) {
        tracing::info!(
            "discovery: panel: node set updated, nodes={}, generation={}",
            count,
            state.registry.generation()
        );
    }
}

fn start_alert_loop(
    state: &BalancerState,
    shutdown: &CancellationToken,
) -> Option<mpsc::UnboundedSender<Transition>> {
    let cfg = state.config.load().alerts.clone();
    let sink = match TelegramSink::from_config(&cfg) {
        Ok(Some(sink)) => sink,
        Ok(None) => {
            tracing::info!("alert: telegram disabled");
            return None;
        }
        Err(e) => {
            tracing::error!("alert: telegram setup failed, error={}", e);
            return None;
        }
    };
    let notifier = Notifier::new(Arc::new(sink), cfg.reminder_interval());
    tracing::info!(
        "alert: telegram enabled, reminder_interval_h={}",
        cfg.reminder_interval_hours
    );

    let (tx, mut rx) = mpsc::unbounded_channel::<Transition>();
    let state = state.clone();
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut reminders = tokio::time::interval(REMINDER_TICK);
        reminders.set_missed_tick_behavior(MissedTickBehavior::Delay);
        reminders.tick().await;
        loop {
            tokio::select! {
                Some(t) = rx.recv() => notifier.on_transition(&t).await,
                _ = reminders.tick() => {
                    let live: HashSet<_> = state
                        .registry
                        .nodes()
                        .iter()
                        .map(|n| n.id().clone())
                        .collect();
                    notifier.retain(|id| live.contains(id));
                    notifier.send_reminders(SystemTime::now()).await;
                }
                _ = shutdown.cancelled() => return,
            }
        }
    });
    Some(tx)
}

#[cfg(unix)]
fn start_reload_listener(state: &BalancerState, args: &BootstrapArgs, shutdown: &CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("config: SIGHUP handler unavailable, reload disabled, error={}", e);
            return;
        }
    };
    let reload_args = BootstrapArgs {
        config_path: args.config_path.clone(),
        env_file: args.env_file.clone(),
        env_file_status: EnvFileStatus::Loaded,
        listen: args.listen.clone(),
    };
    let state = state.clone();
    let shutdown = shutdown.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                received = hangup.recv() => {
                    if received.is_none() {
                        return;
                    }
                }
                _ = shutdown.cancelled() => return,
            }

            tracing::info!("config: SIGHUP received, reloading");
            let file_env = read_env_file(&reload_args.env_file);
            match load_config(&reload_args, &file_env) {
                Ok(config) => {
                    let reloaded = state.apply_config(config);
                    tracing::info!(
                        "config: reload applied, registry_reloaded={}, generation={}",
                        reloaded,
                        state.registry.generation()
                    );
                    metrics::counter!("balancer_config_reloads_total", "result" => "success")
                        .increment(1);
                }
                Err(e) => {
                    tracing::error!("config: reload failed, keeping current config, error={:#}", e);
                    metrics::counter!("balancer_config_reloads_total", "result" => "error")
                        .increment(1);
                }
            }
        }
    });
}

#[cfg(not(unix))]
fn start_reload_listener(_state: &BalancerState, _args: &BootstrapArgs, _shutdown: &CancellationToken) {
    tracing::info!("config: reload on SIGHUP is not supported on this platform");
}

async fn wait_for_shutdown(shutdown: &CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }

    // Stops the accept loop and every background loop.
    shutdown.cancel();
}
