use crate::error::BalancerError;
use std::future::pending;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;

const BUF_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct RelayLimits {
    /// Close after this long with no bytes in either direction.
    pub idle: Duration,
    /// Hard cap on the whole session, if any.
    pub session: Option<Duration>,
}

#[derive(Debug)]
pub enum RelayOutcome {
    /// Both directions reached EOF.
    Completed,
    IdleTimeout,
    SessionTimeout,
    /// Cut short by shutdown after the drain period.
    Aborted,
    Failed(BalancerError),
}

impl RelayOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::IdleTimeout => "idle_timeout",
            Self::SessionTimeout => "session_timeout",
            Self::Aborted => "aborted",
            Self::Failed(_) => "error",
        }
    }
}

#[derive(Debug)]
pub struct RelayStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
    pub outcome: RelayOutcome,
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => pending::<()>().await,
    }
}

/// Last time bytes moved in either direction, as millis since `start`.
struct Activity {
    start: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let ms = self.start.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(ms, Ordering::Relaxed);
    }

    fn quiet_for(&self) -> Duration {
        let last = self.start + Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        Instant::now().saturating_duration_since(last)
    }
}

/// Resolves once neither direction has moved bytes for `idle`.
async fn idle_watch(activity: &Activity, idle: Duration) {
    loop {
        let quiet = activity.quiet_for();
        if quiet >= idle {
            return;
        }
        sleep(idle - quiet).await;
    }
}

/// One direction: read, write, repeat; EOF becomes a write shutdown.
async fn pump<R, W>(rd: &mut R, wr: &mut W, moved: &AtomicU64, activity: &Activity) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = rd.read(&mut buf).await?;
        if n == 0 {
            wr.shutdown().await.ok();
            return Ok(());
        }
        activity.touch();
        wr.write_all(&buf[..n]).await?;
        moved.fetch_add(n as u64, Ordering::Relaxed);
        activity.touch();
    }
}

/// Copy bytes both ways until both sides finish or a limit fires.
///
/// The two directions run independently, so a peer that writes before it
/// reads again never blocks the opposite direction. EOF from one side is
/// propagated as a write shutdown to the other. The session is idle only
/// when no bytes move in either direction for the idle limit.
pub async fn relay<C, U>(client: C, upstream: U, limits: RelayLimits, abort: &CancellationToken) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut upstream_rd, mut upstream_wr) = tokio::io::split(upstream);
    let to_upstream = AtomicU64::new(0);
    let to_client = AtomicU64::new(0);
    let activity = Activity::new();
    let deadline = limits.session.map(|d| Instant::now() + d);

    let outcome = tokio::select! {
        res = async {
            tokio::try_join!(
                pump(&mut client_rd, &mut upstream_wr, &to_upstream, &activity),
                pump(&mut upstream_rd, &mut client_wr, &to_client, &activity),
            )
        } => match res {
            Ok(_) => RelayOutcome::Completed,
            Err(e) => RelayOutcome::Failed(BalancerError::Relay(e)),
        },
        _ = idle_watch(&activity, limits.idle) => RelayOutcome::IdleTimeout,
        _ = until(deadline) => RelayOutcome::SessionTimeout,
        _ = abort.cancelled() => RelayOutcome::Aborted,
    };

    RelayStats {
        client_to_upstream: to_upstream.load(Ordering::Relaxed),
        upstream_to_client: to_client.load(Ordering::Relaxed),
        outcome,
    }
}
