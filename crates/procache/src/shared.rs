//! Internals shared by the single-key and the batch cache.
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::channel::oneshot;
use sentry::{Hub, SentryFutureExt};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::batch::{BatchCoalescingCache, BatchProducer};
use crate::cache::{CoalescingCache, Producer};
use crate::clock::{Clock, TickingClock, deadline};
use crate::config::CacheConfig;
use crate::entry::{CacheEntry, EntryResult};
use crate::error::{CacheError, ConfigError};
use crate::hook::{EventHook, EventReason, HookDispatcher};
use crate::store::memory::MemoryStore;
use crate::store::{BackingStore, ExpiredHook, StoreFactory};
use crate::{CacheKey, CacheValue, shards};

/// The store type backing a cache with keys `K` and values `V`.
pub type EntryStore<K, V> = Arc<dyn BackingStore<K, Arc<CacheEntry<V>>>>;

/// The result of looking up a key that may need to be created.
pub(crate) enum Slot<V> {
    Existing(Arc<CacheEntry<V>>),
    /// A pending entry was just stored; the caller has to resolve it.
    Created(Arc<CacheEntry<V>>, oneshot::Sender<EntryResult<V>>),
}

pub(crate) struct CacheCore<K, V> {
    pub(crate) config: CacheConfig,
    pub(crate) store: EntryStore<K, V>,
    clock: Arc<dyn Clock>,
    hooks: Option<HookDispatcher<K, V>>,
    runtime: Handle,
}

impl<K: CacheKey, V: CacheValue> CacheCore<K, V> {
    pub(crate) fn name(&self) -> &str {
        &self.config.name
    }

    pub(crate) fn now(&self) -> u64 {
        self.clock.now()
    }

    fn stale_deadline(&self) -> u64 {
        deadline(self.now(), self.config.outdate_ttl)
    }

    pub(crate) fn refreshes_enabled(&self) -> bool {
        self.config.refreshes_enabled()
    }

    /// Looks up `key`, storing a new pending entry if there is none.
    pub(crate) fn get_or_insert(&self, key: &K) -> Slot<V> {
        metric!(counter("procache.access") += 1, "cache" => self.name());
        if let Some(entry) = self.store.try_get(key) {
            return Slot::Existing(entry);
        }

        let _guard = shards::lock(key);
        if let Some(entry) = self.store.try_get(key) {
            return Slot::Existing(entry);
        }
        let (entry, resolver) = CacheEntry::pending();
        let entry = Arc::new(entry);
        self.store
            .set(key.clone(), Arc::clone(&entry), self.config.expire_ttl);
        tracing::trace!(cache = self.name(), ?key, "created pending entry");
        Slot::Created(entry, resolver)
    }

    /// Removes `entry` from the store, unless `key` already maps to a different entry.
    pub(crate) fn remove_entry(&self, key: &K, entry: &Arc<CacheEntry<V>>) {
        let _guard = shards::lock(key);
        if let Some(current) = self.store.try_get(key) {
            if Arc::ptr_eq(&current, entry) {
                self.store.remove(key);
            }
        }
    }

    /// Stores `entry` again to extend its hard TTL, unless `key` was taken over meanwhile.
    fn reinsert(&self, key: &K, entry: &Arc<CacheEntry<V>>) {
        let _guard = shards::lock(key);
        let replaced = match self.store.try_get(key) {
            Some(current) => !Arc::ptr_eq(&current, entry),
            None => false,
        };
        if !replaced {
            self.store
                .set(key.clone(), Arc::clone(entry), self.config.expire_ttl);
        }
    }

    /// Admits a caller to wait on `entry`.
    pub(crate) fn enter_queue(&self, entry: &CacheEntry<V>) -> Result<(), CacheError> {
        if entry.try_enter_queue(self.config.max_queue_size) {
            return Ok(());
        }
        metric!(counter("procache.queue_limit_hit") += 1, "cache" => self.name());
        Err(CacheError::QueueLimitExceeded {
            limit: self.config.max_queue_size.unwrap_or(u32::MAX),
        })
    }

    /// Publishes the outcome of the initial computation of `entry`.
    ///
    /// On failure the entry is removed first, so that the next caller starts over.
    pub(crate) fn complete_creation(
        &self,
        key: &K,
        entry: &Arc<CacheEntry<V>>,
        resolver: oneshot::Sender<EntryResult<V>>,
        result: EntryResult<V>,
    ) {
        match result {
            Ok(value) => {
                metric!(
                    counter("procache.computation") += 1,
                    "cache" => self.name(),
                    "status" => "ok",
                );
                entry.resolve(value.clone(), self.stale_deadline());
                resolver.send(Ok(value)).ok();
                self.notify(key, entry, EventReason::Updated);
            }
            Err(err) => {
                metric!(
                    counter("procache.computation") += 1,
                    "cache" => self.name(),
                    "status" => "error",
                );
                tracing::debug!(cache = self.name(), ?key, "computation failed: {err}");
                self.remove_entry(key, entry);
                resolver.send(Err(err)).ok();
                self.notify(key, entry, EventReason::Error);
            }
        }
    }

    /// Publishes a refreshed value of an entry whose refresh was claimed.
    pub(crate) fn complete_refresh(&self, key: &K, entry: &Arc<CacheEntry<V>>, value: Option<V>) {
        metric!(
            counter("procache.refresh") += 1,
            "cache" => self.name(),
            "status" => "ok",
        );
        entry.resolve(value, self.stale_deadline());
        self.reinsert(key, entry);
        self.notify(key, entry, EventReason::Updated);
    }

    /// Keeps the current value of an entry the producer no longer returned.
    pub(crate) fn postpone_refresh(&self, key: &K, entry: &Arc<CacheEntry<V>>) {
        metric!(
            counter("procache.refresh") += 1,
            "cache" => self.name(),
            "status" => "vanished",
        );
        entry.postpone(self.stale_deadline());
        self.reinsert(key, entry);
    }

    /// Gives up a failed refresh, keeping the stale value.
    pub(crate) fn fail_refresh(&self, key: &K, entry: &Arc<CacheEntry<V>>, err: &CacheError) {
        metric!(
            counter("procache.refresh") += 1,
            "cache" => self.name(),
            "status" => "error",
        );
        tracing::warn!(cache = self.name(), ?key, "background refresh failed: {err}");
        entry.release_claim();
        self.notify(key, entry, EventReason::Error);
    }

    pub(crate) fn notify(&self, key: &K, entry: &Arc<CacheEntry<V>>, reason: EventReason) {
        if let Some(hooks) = &self.hooks {
            hooks.send(key.clone(), Arc::clone(entry), reason);
        }
    }

    /// Runs `future` as an independent task, isolated from the caller's sentry scope.
    pub(crate) fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.runtime
            .spawn(future.bind_hub(Hub::new_from_top(Hub::current())))
    }
}

impl<K, V> fmt::Debug for CacheCore<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheCore")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .field("hooks", &self.hooks.is_some())
            .finish()
    }
}

/// Builds a [`CoalescingCache`] or a [`BatchCoalescingCache`].
///
/// Both have to be built from within a tokio runtime, which is used for all background work.
pub struct CacheBuilder<K, V> {
    config: CacheConfig,
    store: Option<StoreFactory<K, Arc<CacheEntry<V>>>>,
    hook: Option<Arc<dyn EventHook<K, V>>>,
    clock: Option<Arc<dyn Clock>>,
}

impl<K: CacheKey, V: CacheValue> CacheBuilder<K, V> {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            store: None,
            hook: None,
            clock: None,
        }
    }

    /// Uses a custom store instead of the default [`MemoryStore`].
    pub fn with_store(mut self, factory: StoreFactory<K, Arc<CacheEntry<V>>>) -> Self {
        self.store = Some(factory);
        self
    }

    pub fn with_hook(mut self, hook: impl EventHook<K, V>) -> Self {
        self.hook = Some(Arc::new(hook));
        self
    }

    /// Uses a custom clock instead of a [`TickingClock`].
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build<C, P>(self, producer: P) -> Result<CoalescingCache<K, V, C>, ConfigError>
    where
        C: Send + 'static,
        P: Producer<K, V, C>,
    {
        let core = self.build_core()?;
        Ok(CoalescingCache::from_parts(core, Arc::new(producer)))
    }

    pub fn build_batch<C, P>(
        self,
        producer: P,
    ) -> Result<BatchCoalescingCache<K, V, C>, ConfigError>
    where
        C: Send + 'static,
        P: BatchProducer<K, V, C>,
    {
        let core = self.build_core()?;
        Ok(BatchCoalescingCache::from_parts(core, Arc::new(producer)))
    }

    fn build_core(self) -> Result<Arc<CacheCore<K, V>>, ConfigError> {
        let Self {
            config,
            store,
            hook,
            clock,
        } = self;
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| ConfigError::NoRuntime)?;

        let clock = clock.unwrap_or_else(|| Arc::new(TickingClock::start(&runtime)));
        let hooks = hook.map(|hook| {
            HookDispatcher::spawn(&runtime, &config.name, config.hook_capacity(), hook)
        });

        let on_expired: ExpiredHook<K, Arc<CacheEntry<V>>> = {
            let name = config.name.clone();
            let hooks = hooks.clone();
            Arc::new(move |items: Vec<(K, Arc<CacheEntry<V>>)>| {
                metric!(
                    counter("procache.store.expired") += items.len() as i64,
                    "cache" => &name,
                );
                if let Some(hooks) = &hooks {
                    hooks.send_all(items, EventReason::Expired);
                }
            })
        };
        let store: EntryStore<K, V> = match store {
            Some(factory) => factory(Some(on_expired)),
            None => Arc::new(MemoryStore::new(
                Arc::clone(&clock),
                Duration::from_secs(config.scan_interval_secs()),
                Some(on_expired),
            )),
        };

        tracing::debug!(cache = %config.name, ?config, "built cache");
        Ok(Arc::new(CacheCore {
            config,
            store,
            clock,
            hooks,
            runtime,
        }))
    }
}
