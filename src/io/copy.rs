use crate::error::{Error, Result};
use crate::io::ByteStreamRef;
use rand::Rng;
use std::net::Shutdown;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

pub const DEFAULT_HALF_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_HALF_CLOSE_JITTER: Duration = Duration::from_secs(1);

type StatsCallback = Box<dyn FnMut(usize) + Send>;

/// Why the copier closed both streams before both directions finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForceClose {
    /// One direction hit EOF and the other stayed silent past the grace
    /// period.
    HalfCloseTimeout,
    IdleTimeout,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
    pub forced: Option<ForceClose>,
}

/// Pumps bytes in both directions between two streams until both reach EOF,
/// then closes them.
///
/// Once one direction is done the other gets a bounded half-close grace
/// period (default 10s ± 1s) before both streams are force-closed. A
/// transport fault in either direction closes both streams immediately and
/// is logged once.
pub struct TwoWayCopier {
    a: ByteStreamRef,
    b: ByteStreamRef,
    label: String,
    buffer_size: usize,
    half_close_timeout: Duration,
    half_close_jitter: Duration,
    idle_timeout: Option<Duration>,
    cancellation_token: Option<CancellationToken>,
    stats_a_to_b: Option<StatsCallback>,
    stats_b_to_a: Option<StatsCallback>,
}

impl TwoWayCopier {
    pub fn new(a: ByteStreamRef, b: ByteStreamRef) -> Self {
        Self {
            a,
            b,
            label: "copy".to_string(),
            buffer_size: 16 * 1024,
            half_close_timeout: DEFAULT_HALF_CLOSE_TIMEOUT,
            half_close_jitter: DEFAULT_HALF_CLOSE_JITTER,
            idle_timeout: None,
            cancellation_token: None,
            stats_a_to_b: None,
            stats_b_to_a: None,
        }
    }

    /// Name used in log lines
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(1);
        self
    }

    pub fn half_close_timeout(mut self, timeout: Duration) -> Self {
        self.half_close_timeout = timeout;
        self
    }

    /// The grace period is randomised by up to ± `jitter`.
    pub fn half_close_jitter(mut self, jitter: Duration) -> Self {
        self.half_close_jitter = jitter;
        self
    }

    /// Force-close after this long without traffic in either direction
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = Some(token);
        self
    }

    pub fn with_stats<F1, F2>(mut self, stats_a_to_b: F1, stats_b_to_a: F2) -> Self
    where
        F1: FnMut(usize) + Send + 'static,
        F2: FnMut(usize) + Send + 'static,
    {
        self.stats_a_to_b = Some(Box::new(stats_a_to_b));
        self.stats_b_to_a = Some(Box::new(stats_b_to_a));
        self
    }

    pub async fn run(self) -> Result<CopyStats> {
        let TwoWayCopier {
            a,
            b,
            label,
            buffer_size,
            half_close_timeout,
            half_close_jitter,
            idle_timeout,
            cancellation_token,
            stats_a_to_b,
            stats_b_to_a,
        } = self;
        let started = Instant::now();
        let counter_ab = Arc::new(AtomicU64::new(0));
        let counter_ba = Arc::new(AtomicU64::new(0));
        let activity = Arc::new(AtomicU64::new(0));

        // The pumps live only inside this block: a pump parked in a read
        // still holds that stream's reader, so it must be gone before close.
        let outcome: Result<Option<ForceClose>> = {
            let forward = copy_half(
                a.clone(),
                b.clone(),
                buffer_size,
                counter_ab.clone(),
                Activity::new(started, activity.clone()),
                stats_a_to_b,
            );
            let backward = copy_half(
                b.clone(),
                a.clone(),
                buffer_size,
                counter_ba.clone(),
                Activity::new(started, activity.clone()),
                stats_b_to_a,
            );
            tokio::pin!(forward);
            tokio::pin!(backward);

            let token = cancellation_token.unwrap_or_default();
            let mut idle_check = tokio::time::interval(Duration::from_secs(1));
            let mut forward_done = false;
            let mut backward_done = false;
            let mut deadline: Option<Instant> = None;
            let grace = grace_period(half_close_timeout, half_close_jitter);

            loop {
                if forward_done && backward_done {
                    break Ok(None);
                }
                let at = deadline;
                let expiry = async move {
                    match at {
                        Some(at) => sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                };
                tokio::select! {
                    r = &mut forward, if !forward_done => match r {
                        Ok(()) => {
                            forward_done = true;
                            deadline.get_or_insert_with(|| Instant::now() + grace);
                        }
                        Err(e) => break Err(e),
                    },
                    r = &mut backward, if !backward_done => match r {
                        Ok(()) => {
                            backward_done = true;
                            deadline.get_or_insert_with(|| Instant::now() + grace);
                        }
                        Err(e) => break Err(e),
                    },
                    _ = expiry => break Ok(Some(ForceClose::HalfCloseTimeout)),
                    _ = token.cancelled() => break Ok(Some(ForceClose::Cancelled)),
                    _ = idle_check.tick(), if idle_timeout.is_some() => {
                        let last = Duration::from_millis(activity.load(Ordering::Relaxed));
                        let idle = started.elapsed().saturating_sub(last);
                        if idle_timeout.is_some_and(|limit| idle >= limit) {
                            break Ok(Some(ForceClose::IdleTimeout));
                        }
                    }
                }
            }
        };

        // Whatever happened, both ends are released before reporting.
        for (name, stream) in [("a", &a), ("b", &b)] {
            if let Err(e) = stream.close().await {
                trace!("{}: closing side {}: {}", label, name, e);
            }
        }

        let stats = |forced| CopyStats {
            a_to_b: counter_ab.load(Ordering::Relaxed),
            b_to_a: counter_ba.load(Ordering::Relaxed),
            forced,
        };
        match outcome {
            Ok(forced) => {
                if let Some(reason) = forced {
                    debug!("{}: force-closed ({:?})", label, reason);
                }
                Ok(stats(forced))
            }
            Err(e) => {
                warn!("{}: {}", label, e);
                Err(e)
            }
        }
    }
}

fn grace_period(timeout: Duration, jitter: Duration) -> Duration {
    let jitter = jitter.as_millis() as i64;
    let offset = if jitter > 0 {
        rand::rng().random_range(-jitter..=jitter)
    } else {
        0
    };
    let millis = (timeout.as_millis() as i64 + offset).max(0);
    Duration::from_millis(millis as u64)
}

struct Activity {
    started: Instant,
    last: Arc<AtomicU64>,
}

impl Activity {
    fn new(started: Instant, last: Arc<AtomicU64>) -> Self {
        Self { started, last }
    }

    fn touch(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last.fetch_max(elapsed, Ordering::Relaxed);
    }
}

async fn copy_half(
    src: ByteStreamRef,
    dst: ByteStreamRef,
    buffer_size: usize,
    counter: Arc<AtomicU64>,
    activity: Activity,
    mut stats: Option<StatsCallback>,
) -> Result<()> {
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        dst.write(&buf[..n]).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
        activity.touch();
        if let Some(cb) = stats.as_mut() {
            cb(n);
        }
    }
    // The peer may already be gone; the data made it either way.
    match dst.shutdown(Shutdown::Write).await {
        Ok(()) | Err(Error::Closed) => Ok(()),
        Err(e) => {
            trace!("half-close failed: {}", e);
            Ok(())
        }
    }
}
