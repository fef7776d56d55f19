//! The single-key coalescing cache.
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::config::CacheConfig;
use crate::entry::{CacheEntry, EntryResult, ValueFuture};
use crate::error::CacheError;
use crate::hook::EventReason;
use crate::shared::{CacheCore, Slot};
use crate::utils::CallOnDrop;
use crate::{CacheKey, CacheValue};

/// Computes the value for a single key.
///
/// Implemented for all async closures taking the key, the caller's context and a
/// cancellation token.
pub trait Producer<K, V, C = ()>: Send + Sync + 'static {
    fn produce(
        &self,
        key: K,
        context: C,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, anyhow::Result<V>>;
}

impl<K, V, C, F, Fut> Producer<K, V, C> for F
where
    F: Fn(K, C, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
{
    fn produce(
        &self,
        key: K,
        context: C,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, anyhow::Result<V>> {
        self(key, context, cancel).boxed()
    }
}

/// A cache that computes each missing value once, no matter how many callers ask for it.
///
/// Once a value is older than [`outdate_ttl`](CacheConfig::outdate_ttl), the next caller
/// triggers a single background refresh and everyone keeps getting the old value until the
/// refresh is done. Values are evicted after [`expire_ttl`](CacheConfig::expire_ttl).
///
/// All computations run as independent tasks, so a caller going away never leaves a key
/// stuck in the pending state.
pub struct CoalescingCache<K, V, C = ()> {
    core: Arc<CacheCore<K, V>>,
    producer: Arc<dyn Producer<K, V, C>>,
}

impl<K, V, C> Clone for CoalescingCache<K, V, C> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            producer: Arc::clone(&self.producer),
        }
    }
}

impl<K, V, C> CoalescingCache<K, V, C>
where
    K: CacheKey,
    V: CacheValue,
    C: Send + 'static,
{
    pub(crate) fn from_parts(
        core: Arc<CacheCore<K, V>>,
        producer: Arc<dyn Producer<K, V, C>>,
    ) -> Self {
        Self { core, producer }
    }

    /// Returns the value for `key`, computing it if needed.
    ///
    /// `context` and `cancel` are handed to the producer if this call starts a computation or a
    /// refresh. Cancelling `cancel` does not cancel a computation somebody else started.
    pub async fn get(
        &self,
        key: K,
        context: C,
        cancel: CancellationToken,
    ) -> Result<V, CacheError> {
        self.lookup(key, context, cancel)?.await
    }

    /// Like [`get`](Self::get), but returns `None` right away if too many callers already wait
    /// for the same key.
    pub fn try_get(&self, key: K, context: C, cancel: CancellationToken) -> Option<Lookup<V>> {
        self.lookup(key, context, cancel).ok()
    }

    /// Evicts `key`, so the next lookup computes it again.
    ///
    /// Callers already waiting for the value are not affected.
    pub fn remove(&self, key: &K) {
        self.core.store.remove(key);
    }

    pub fn config(&self) -> &CacheConfig {
        &self.core.config
    }

    fn lookup(
        &self,
        key: K,
        context: C,
        cancel: CancellationToken,
    ) -> Result<Lookup<V>, CacheError> {
        let name = self.core.name();
        let entry = match self.core.get_or_insert(&key) {
            Slot::Created(entry, resolver) => {
                metric!(counter("procache.miss") += 1, "cache" => name);
                // the creator always gets the first slot
                entry.try_enter_queue(self.core.config.max_queue_size);
                self.core.notify(&key, &entry, EventReason::Miss);
                self.spawn_creation(key, Arc::clone(&entry), resolver, context, cancel);
                entry
            }
            Slot::Existing(entry) if !entry.is_resolved() => {
                metric!(
                    counter("procache.hit") += 1,
                    "cache" => name,
                    "pending" => "true",
                );
                self.core.enter_queue(&entry)?;
                entry
            }
            Slot::Existing(entry) => {
                let now = self.core.now();
                if self.core.refreshes_enabled() && entry.try_claim_refresh(now) {
                    metric!(counter("procache.stale") += 1, "cache" => name);
                    self.core.notify(&key, &entry, EventReason::Outdated);
                    self.spawn_refresh(key, Arc::clone(&entry), context, cancel);
                } else {
                    metric!(
                        counter("procache.hit") += 1,
                        "cache" => name,
                        "pending" => "false",
                    );
                }
                entry
            }
        };
        Ok(Lookup {
            inner: entry.wait(),
        })
    }

    fn spawn_creation(
        &self,
        key: K,
        entry: Arc<CacheEntry<V>>,
        resolver: oneshot::Sender<EntryResult<V>>,
        context: C,
        cancel: CancellationToken,
    ) {
        let core = Arc::clone(&self.core);
        let producer = Arc::clone(&self.producer);
        let task = async move {
            // The producer panicked or the runtime is shutting down.
            let abandoned = {
                let core = Arc::clone(&core);
                let key = key.clone();
                let entry = Arc::clone(&entry);
                CallOnDrop::new(move || core.remove_entry(&key, &entry))
            };

            let started = Instant::now();
            let result = producer.produce(key.clone(), context, cancel).await;
            abandoned.disarm();
            metric!(
                timer("procache.computation.duration") = started.elapsed(),
                "cache" => core.name(),
            );
            let result = result.map(Some).map_err(CacheError::from_producer);
            core.complete_creation(&key, &entry, resolver, result);
        };
        self.core.spawn(task);
    }

    fn spawn_refresh(
        &self,
        key: K,
        entry: Arc<CacheEntry<V>>,
        context: C,
        cancel: CancellationToken,
    ) {
        tracing::debug!(cache = self.core.name(), ?key, "spawning background refresh");
        let core = Arc::clone(&self.core);
        let producer = Arc::clone(&self.producer);
        let task = async move {
            let abandoned = {
                let entry = Arc::clone(&entry);
                CallOnDrop::new(move || entry.release_claim())
            };

            let result = producer.produce(key.clone(), context, cancel).await;
            abandoned.disarm();
            match result {
                Ok(value) => core.complete_refresh(&key, &entry, Some(value)),
                Err(err) => core.fail_refresh(&key, &entry, &CacheError::from_producer(err)),
            }
        };
        self.core.spawn(task);
    }
}

impl<K, V, C> fmt::Debug for CoalescingCache<K, V, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoalescingCache")
            .field("core", &self.core)
            .finish()
    }
}

/// Future returned by [`CoalescingCache::try_get`].
///
/// Dropping it does not cancel the computation it waits for.
#[must_use = "futures do nothing unless polled"]
#[derive(Debug)]
pub struct Lookup<V> {
    inner: ValueFuture<V>,
}

impl<V: Clone> Future for Lookup<V> {
    type Output = Result<V, CacheError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner
            .poll_unpin(cx)
            .map(|result| result?.ok_or(CacheError::InternalError))
    }
}
