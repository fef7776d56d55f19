//! Low resolution time sources for entry deadlines.
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// A source of the current time in whole seconds.
///
/// Only differences between two readings are meaningful.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> u64;
}

/// Adds a TTL to a reading of a [`Clock`], truncating fractional seconds.
pub(crate) fn deadline(now: u64, ttl: Duration) -> u64 {
    now.saturating_add(ttl.as_secs())
}

/// A clock updated once per second by a background task.
///
/// Reading it is a single atomic load. The task stops on [`shutdown`](Self::shutdown) or when
/// the clock is dropped, after which the reading stays frozen.
pub struct TickingClock {
    seconds: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

impl TickingClock {
    /// Starts a clock reading `0` that ticks on the given runtime.
    pub fn start(runtime: &Handle) -> Self {
        let seconds = Arc::new(AtomicU64::new(0));
        let shutdown = CancellationToken::new();

        let task = {
            let seconds = Arc::clone(&seconds);
            let shutdown = shutdown.clone();
            async move {
                let started = Instant::now();
                let mut interval = tokio::time::interval(Duration::from_secs(1));
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = interval.tick() => {
                            seconds.store(started.elapsed().as_secs(), Ordering::Relaxed);
                        }
                    }
                }
                tracing::trace!("clock ticker stopped");
            }
        };
        runtime.spawn(task);

        Self { seconds, shutdown }
    }

    /// Stops the background task.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Clock for TickingClock {
    fn now(&self) -> u64 {
        self.seconds.load(Ordering::Relaxed)
    }
}

impl Drop for TickingClock {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl fmt::Debug for TickingClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TickingClock")
            .field("now", &self.now())
            .field("stopped", &self.shutdown.is_cancelled())
            .finish()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    seconds: AtomicU64,
}

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self {
            seconds: AtomicU64::new(start),
        }
    }

    /// Moves the clock forward by `by`, truncated to whole seconds.
    pub fn advance(&self, by: Duration) {
        self.seconds.fetch_add(by.as_secs(), Ordering::Relaxed);
    }

    pub fn set(&self, seconds: u64) {
        self.seconds.store(seconds, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.seconds.load(Ordering::Relaxed)
    }
}
