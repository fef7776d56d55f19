//! The per-key state machine shared by all callers of a cache.
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::task::{Context, Poll};

use arc_swap::ArcSwapOption;
use futures::channel::oneshot;
use futures::future::{self, FutureExt, Shared};

use crate::error::CacheError;

/// The outcome of an entry: a value, an explicit "no value for this key", or an error.
pub type EntryResult<V> = Result<Option<V>, CacheError>;

type Completion<V> = Shared<oneshot::Receiver<EntryResult<V>>>;

/// Marks `stale_at` as claimed by a running refresh.
const CLAIM_FLAG: u64 = 1 << 62;
const STALE_MASK: u64 = CLAIM_FLAG - 1;

/// A cached value together with the state of its computation.
///
/// An entry starts out pending, is resolved exactly once by whoever created it, and may afterwards
/// be refreshed any number of times. At most one refresh can be claimed at a time.
pub struct CacheEntry<V> {
    resolved: ArcSwapOption<Option<V>>,
    completion: Completion<V>,
    stale_at: AtomicU64,
    admitted: AtomicU32,
}

impl<V: Clone> CacheEntry<V> {
    /// Creates a pending entry and the sender that resolves its waiters.
    pub(crate) fn pending() -> (Self, oneshot::Sender<EntryResult<V>>) {
        let (sender, receiver) = oneshot::channel();
        let entry = Self {
            resolved: ArcSwapOption::empty(),
            completion: receiver.shared(),
            stale_at: AtomicU64::new(STALE_MASK),
            admitted: AtomicU32::new(0),
        };
        (entry, sender)
    }

    /// Whether the initial computation has finished successfully.
    pub fn is_resolved(&self) -> bool {
        self.resolved.load().is_some()
    }

    /// The current value, if the entry is resolved and has one.
    pub fn value(&self) -> Option<V> {
        self.resolved.load_full().and_then(|value| (*value).clone())
    }

    pub(crate) fn resolution(&self) -> Option<Option<V>> {
        self.resolved.load_full().map(|value| (*value).clone())
    }

    /// The clock reading at which this entry becomes eligible for a refresh.
    ///
    /// Pending entries report `u64::MAX >> 2`.
    pub fn stale_at(&self) -> u64 {
        self.stale_at.load(Ordering::Acquire) & STALE_MASK
    }

    /// Whether a background refresh has been claimed and not finished yet.
    pub fn is_refreshing(&self) -> bool {
        self.stale_at.load(Ordering::Acquire) & CLAIM_FLAG != 0
    }

    /// Number of callers that joined the initial computation.
    pub fn waiters(&self) -> u32 {
        self.admitted.load(Ordering::Relaxed)
    }

    /// Resolves to the current value, waiting for the initial computation if needed.
    pub fn wait(&self) -> ValueFuture<V> {
        let state = match self.resolution() {
            Some(value) => WaitState::Ready(future::ready(Ok(value))),
            None => WaitState::Waiting(self.completion.clone()),
        };
        ValueFuture { state }
    }

    /// Publishes a new value and deadline, clearing any refresh claim.
    pub(crate) fn resolve(&self, value: Option<V>, stale_at: u64) {
        // The deadline goes first, so whoever observes the value also observes its deadline.
        self.stale_at.store(stale_at & STALE_MASK, Ordering::Release);
        self.resolved.store(Some(Arc::new(value)));
    }

    /// Claims the next refresh of a resolved entry whose deadline has passed.
    ///
    /// Returns `true` for exactly one of any number of concurrent callers.
    pub(crate) fn try_claim_refresh(&self, now: u64) -> bool {
        if !self.is_resolved() {
            return false;
        }
        let current = self.stale_at.load(Ordering::Acquire);
        if current & CLAIM_FLAG != 0 || now < current {
            return false;
        }
        self.stale_at
            .compare_exchange(
                current,
                current | CLAIM_FLAG,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Gives up a refresh claim, leaving the value and deadline untouched.
    pub(crate) fn release_claim(&self) {
        self.stale_at.fetch_and(!CLAIM_FLAG, Ordering::AcqRel);
    }

    /// Moves the deadline and clears the claim, keeping the current value.
    pub(crate) fn postpone(&self, stale_at: u64) {
        self.stale_at.store(stale_at & STALE_MASK, Ordering::Release);
    }

    /// Admits one more waiter, unless `max` waiters already joined the pending computation.
    ///
    /// Reading a resolved entry never needs a slot.
    pub(crate) fn try_enter_queue(&self, max: Option<u32>) -> bool {
        let Some(max) = max else {
            return true;
        };
        if self.is_resolved() {
            return true;
        }
        if self.admitted.load(Ordering::Relaxed) >= max {
            return false;
        }
        self.admitted.fetch_add(1, Ordering::AcqRel) < max
    }
}

impl<V> fmt::Debug for CacheEntry<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stale_at = self.stale_at.load(Ordering::Relaxed);
        f.debug_struct("CacheEntry")
            .field("resolved", &self.resolved.load().is_some())
            .field("stale_at", &(stale_at & STALE_MASK))
            .field("refreshing", &(stale_at & CLAIM_FLAG != 0))
            .field("waiters", &self.admitted.load(Ordering::Relaxed))
            .finish()
    }
}

enum WaitState<V> {
    Ready(future::Ready<EntryResult<V>>),
    Waiting(Completion<V>),
}

/// Future returned by [`CacheEntry::wait`].
///
/// Dropping it does not affect the computation it waits for.
#[must_use = "futures do nothing unless polled"]
pub struct ValueFuture<V> {
    state: WaitState<V>,
}

impl<V: Clone> Future for ValueFuture<V> {
    type Output = EntryResult<V>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            WaitState::Ready(ready) => ready.poll_unpin(cx),
            WaitState::Waiting(completion) => completion
                .poll_unpin(cx)
                .map(|result| result.unwrap_or_else(|_canceled| Err(CacheError::InternalError))),
        }
    }
}

impl<V> fmt::Debug for ValueFuture<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            WaitState::Ready(_) => "ready",
            WaitState::Waiting(_) => "waiting",
        };
        f.debug_struct("ValueFuture").field("state", &state).finish()
    }
}
