//! The batch variant of the coalescing cache.
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::BoxFuture;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio_util::sync::CancellationToken;

use crate::config::CacheConfig;
use crate::entry::{CacheEntry, EntryResult, ValueFuture};
use crate::error::CacheError;
use crate::hook::EventReason;
use crate::shared::{CacheCore, Slot};
use crate::{CacheKey, CacheValue};

/// Computes the values for a set of keys in one call.
///
/// The result may omit keys: those are cached as having no value. Keys that were not
/// requested are ignored, and only the first value returned for a key is used.
pub trait BatchProducer<K, V, C = ()>: Send + Sync + 'static {
    fn produce(
        &self,
        keys: Vec<K>,
        context: C,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, anyhow::Result<Vec<(K, V)>>>;
}

impl<K, V, C, F, Fut> BatchProducer<K, V, C> for F
where
    F: Fn(Vec<K>, C, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Vec<(K, V)>>> + Send + 'static,
{
    fn produce(
        &self,
        keys: Vec<K>,
        context: C,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, anyhow::Result<Vec<(K, V)>>> {
        self(keys, context, cancel).boxed()
    }
}

/// A coalescing cache that looks up many keys at once.
///
/// Every call issues at most one producer call, covering all keys that are missing or due for a
/// refresh. Keys that are currently computed by another caller are waited for instead.
/// See [`CoalescingCache`](crate::CoalescingCache) for the lifecycle of single entries.
pub struct BatchCoalescingCache<K, V, C = ()> {
    core: Arc<CacheCore<K, V>>,
    producer: Arc<dyn BatchProducer<K, V, C>>,
}

impl<K, V, C> Clone for BatchCoalescingCache<K, V, C> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            producer: Arc::clone(&self.producer),
        }
    }
}

impl<K, V, C> BatchCoalescingCache<K, V, C>
where
    K: CacheKey,
    V: CacheValue,
    C: Send + 'static,
{
    pub(crate) fn from_parts(
        core: Arc<CacheCore<K, V>>,
        producer: Arc<dyn BatchProducer<K, V, C>>,
    ) -> Self {
        Self { core, producer }
    }

    /// Returns the values of all `keys` that have one.
    ///
    /// Duplicate keys are looked up once. Keys without a value are left out, as are keys that
    /// were refreshed by this call but no longer returned by the producer.
    ///
    /// Fails if the producer call fails, if a key computed by another caller failed, or if too
    /// many callers wait for one of the keys. In the last case the producer call is still made.
    pub async fn get(
        &self,
        keys: impl IntoIterator<Item = K>,
        context: C,
        cancel: CancellationToken,
    ) -> Result<Vec<(K, V)>, CacheError> {
        let name = self.core.name();
        let now = self.core.now();
        let refreshes_enabled = self.core.refreshes_enabled();

        let mut seen = FxHashSet::default();
        let mut values = Vec::new();
        let mut waits: Vec<(K, ValueFuture<V>)> = Vec::new();
        let mut requests = BatchRequests::new(Arc::clone(&self.core));
        let mut rejected = None;

        for key in keys {
            if !seen.insert(key.clone()) {
                continue;
            }
            match self.core.get_or_insert(&key) {
                Slot::Created(entry, resolver) => {
                    metric!(counter("procache.miss") += 1, "cache" => name);
                    entry.try_enter_queue(self.core.config.max_queue_size);
                    self.core.notify(&key, &entry, EventReason::Miss);
                    requests.create(key, entry, resolver);
                }
                Slot::Existing(entry) => match entry.resolution() {
                    None => {
                        metric!(
                            counter("procache.hit") += 1,
                            "cache" => name,
                            "pending" => "true",
                        );
                        match self.core.enter_queue(&entry) {
                            Ok(()) => waits.push((key, entry.wait())),
                            Err(err) => rejected = Some(err),
                        }
                    }
                    Some(_) if refreshes_enabled && entry.try_claim_refresh(now) => {
                        metric!(counter("procache.stale") += 1, "cache" => name);
                        self.core.notify(&key, &entry, EventReason::Outdated);
                        requests.refresh(key, entry);
                    }
                    Some(value) => {
                        metric!(
                            counter("procache.hit") += 1,
                            "cache" => name,
                            "pending" => "false",
                        );
                        if let Some(value) = value {
                            values.push((key, value));
                        }
                    }
                },
            }
        }

        if !requests.is_empty() {
            let produced = self.run_producer(requests, context, cancel).await?;
            values.extend(produced);
        }

        if let Some(err) = rejected {
            return Err(err);
        }

        for (key, wait) in waits {
            if let Some(value) = wait.await? {
                values.push((key, value));
            }
        }

        Ok(values)
    }

    /// Evicts `key`, so the next lookup computes it again.
    pub fn remove(&self, key: &K) {
        self.core.store.remove(key);
    }

    pub fn config(&self) -> &CacheConfig {
        &self.core.config
    }

    async fn run_producer(
        &self,
        mut requests: BatchRequests<K, V>,
        context: C,
        cancel: CancellationToken,
    ) -> Result<Vec<(K, V)>, CacheError> {
        let keys = std::mem::take(&mut requests.keys);
        metric!(
            histogram("procache.batch.keys") = keys.len() as u64,
            "cache" => self.core.name(),
        );
        tracing::debug!(cache = self.core.name(), ?keys, "spawning batch computation");

        let producer = Arc::clone(&self.producer);
        let task = async move {
            let started = Instant::now();
            let result = producer.produce(keys, context, cancel).await;
            metric!(
                timer("procache.batch.duration") = started.elapsed(),
                "cache" => requests.core.name(),
            );
            requests.finish(result)
        };
        self.core
            .spawn(task)
            .await
            .unwrap_or(Err(CacheError::InternalError))
    }
}

impl<K, V, C> fmt::Debug for BatchCoalescingCache<K, V, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchCoalescingCache")
            .field("core", &self.core)
            .finish()
    }
}

enum Request<V> {
    Create {
        entry: Arc<CacheEntry<V>>,
        resolver: oneshot::Sender<EntryResult<V>>,
    },
    Refresh {
        entry: Arc<CacheEntry<V>>,
    },
}

/// The keys of one producer call, together with the entries waiting for them.
///
/// Entries still outstanding when this is dropped are cleaned up: created entries are evicted
/// and their waiters fail, refresh claims are released.
struct BatchRequests<K: CacheKey, V: CacheValue> {
    core: Arc<CacheCore<K, V>>,
    keys: Vec<K>,
    pending: FxHashMap<K, Request<V>>,
}

impl<K: CacheKey, V: CacheValue> BatchRequests<K, V> {
    fn new(core: Arc<CacheCore<K, V>>) -> Self {
        Self {
            core,
            keys: Vec::new(),
            pending: FxHashMap::default(),
        }
    }

    fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn create(
        &mut self,
        key: K,
        entry: Arc<CacheEntry<V>>,
        resolver: oneshot::Sender<EntryResult<V>>,
    ) {
        self.push(key, Request::Create { entry, resolver });
    }

    fn refresh(&mut self, key: K, entry: Arc<CacheEntry<V>>) {
        self.push(key, Request::Refresh { entry });
    }

    fn push(&mut self, key: K, request: Request<V>) {
        self.keys.push(key.clone());
        self.pending.insert(key, request);
    }

    /// Applies the producer result to all requested entries.
    fn finish(
        mut self,
        result: anyhow::Result<Vec<(K, V)>>,
    ) -> Result<Vec<(K, V)>, CacheError> {
        let core = Arc::clone(&self.core);
        let produced = match result {
            Ok(produced) => produced,
            Err(err) => {
                let err = CacheError::from_producer(err);
                for (key, request) in self.pending.drain() {
                    match request {
                        Request::Create { entry, resolver } => {
                            core.complete_creation(&key, &entry, resolver, Err(err.clone()))
                        }
                        Request::Refresh { entry } => core.fail_refresh(&key, &entry, &err),
                    }
                }
                return Err(err);
            }
        };

        let mut values = Vec::with_capacity(produced.len());
        for (key, value) in produced {
            // not requested, or returned twice
            let Some(request) = self.pending.remove(&key) else {
                continue;
            };
            match request {
                Request::Create { entry, resolver } => {
                    core.complete_creation(&key, &entry, resolver, Ok(Some(value.clone())))
                }
                Request::Refresh { entry } => {
                    core.complete_refresh(&key, &entry, Some(value.clone()))
                }
            }
            values.push((key, value));
        }

        for (key, request) in self.pending.drain() {
            match request {
                Request::Create { entry, resolver } => {
                    core.complete_creation(&key, &entry, resolver, Ok(None))
                }
                Request::Refresh { entry } => core.postpone_refresh(&key, &entry),
            }
        }

        Ok(values)
    }
}

impl<K: CacheKey, V: CacheValue> Drop for BatchRequests<K, V> {
    fn drop(&mut self) {
        for (key, request) in self.pending.drain() {
            match request {
                Request::Create { entry, .. } => self.core.remove_entry(&key, &entry),
                Request::Refresh { entry } => entry.release_claim(),
            }
        }
    }
}
