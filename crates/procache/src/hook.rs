//! Observing cache events.
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::entry::CacheEntry;

/// Why an [`EventHook`] was invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventReason {
    /// The key was not cached and its computation was started.
    Miss,
    /// The entry went stale and a refresh was started.
    Outdated,
    /// A computation or refresh stored a new value.
    Updated,
    /// The entry reached its hard TTL and was evicted.
    Expired,
    /// A computation or refresh failed.
    Error,
}

impl AsRef<str> for EventReason {
    fn as_ref(&self) -> &str {
        match self {
            EventReason::Miss => "miss",
            EventReason::Outdated => "outdated",
            EventReason::Updated => "updated",
            EventReason::Expired => "expired",
            EventReason::Error => "error",
        }
    }
}

impl fmt::Display for EventReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// A callback informed about entry lifecycle events.
///
/// Hooks run on a dedicated task, one event at a time, and never delay the caller that caused
/// the event. Events are dropped while the hook falls behind by more than
/// [`hook_queue_size`](crate::CacheConfig::hook_queue_size), except for
/// [`Expired`](EventReason::Expired) events, which wait for room in the queue.
pub trait EventHook<K, V>: Send + Sync + 'static {
    fn on_event(&self, key: &K, entry: &CacheEntry<V>, reason: EventReason);
}

impl<K, V, F> EventHook<K, V> for F
where
    F: Fn(&K, &CacheEntry<V>, EventReason) + Send + Sync + 'static,
{
    fn on_event(&self, key: &K, entry: &CacheEntry<V>, reason: EventReason) {
        self(key, entry, reason)
    }
}

struct HookMessage<K, V> {
    key: K,
    entry: Arc<CacheEntry<V>>,
    reason: EventReason,
}

/// Feeds events to an [`EventHook`] running on its own task.
pub(crate) struct HookDispatcher<K, V> {
    queue_tx: mpsc::Sender<HookMessage<K, V>>,
    cache: Arc<str>,
    runtime: Handle,
}

impl<K, V> Clone for HookDispatcher<K, V> {
    fn clone(&self) -> Self {
        Self {
            queue_tx: self.queue_tx.clone(),
            cache: Arc::clone(&self.cache),
            runtime: self.runtime.clone(),
        }
    }
}

impl<K, V> HookDispatcher<K, V>
where
    K: Send + 'static,
    V: Send + Sync + 'static,
{
    /// Spawns the worker task, which stops once every dispatcher is dropped.
    pub(crate) fn spawn(
        runtime: &Handle,
        cache: &str,
        capacity: usize,
        hook: Arc<dyn EventHook<K, V>>,
    ) -> Self {
        let (queue_tx, mut queue_rx) = mpsc::channel::<HookMessage<K, V>>(capacity.max(1));
        let cache: Arc<str> = cache.into();

        let worker = {
            let cache = Arc::clone(&cache);
            async move {
                while let Some(message) = queue_rx.recv().await {
                    let HookMessage { key, entry, reason } = message;
                    let result =
                        catch_unwind(AssertUnwindSafe(|| hook.on_event(&key, &entry, reason)));
                    if result.is_err() {
                        tracing::error!(cache = %cache, %reason, "event hook panicked");
                    }
                }
                tracing::trace!(cache = %cache, "event hook worker stopped");
            }
        };
        runtime.spawn(worker);

        Self {
            queue_tx,
            cache,
            runtime: runtime.clone(),
        }
    }

    pub(crate) fn send(&self, key: K, entry: Arc<CacheEntry<V>>, reason: EventReason) {
        metric!(
            gauge("procache.hook.queue_capacity") = self.queue_tx.capacity() as u64,
            "cache" => &*self.cache,
        );
        self.queue_tx
            .try_send(HookMessage { key, entry, reason })
            .unwrap_or_else(|_| {
                metric!(
                    counter("procache.hook.dropped") += 1,
                    "cache" => &*self.cache,
                    "reason" => reason.as_ref(),
                );
                tracing::error!(cache = %self.cache, %reason, "event hook queue full");
            });
    }

    /// Queues one event per item without dropping any.
    ///
    /// The events are forwarded by a task that waits for room in the queue, so this neither
    /// blocks nor depends on the caller being inside the runtime.
    pub(crate) fn send_all(&self, items: Vec<(K, Arc<CacheEntry<V>>)>, reason: EventReason) {
        let queue_tx = self.queue_tx.clone();
        let cache = Arc::clone(&self.cache);
        self.runtime.spawn(async move {
            for (key, entry) in items {
                let message = HookMessage { key, entry, reason };
                if queue_tx.send(message).await.is_err() {
                    tracing::debug!(cache = %cache, %reason, "event hook worker stopped");
                    return;
                }
            }
        });
    }
}
