//! The default in-process store.
use std::fmt;
use std::hash::Hash;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::runtime::Handle;

use super::{BackingStore, ExpiredHook};
use crate::clock::{Clock, deadline};
use crate::utils::CallOnDrop;

struct StoreItem<V> {
    value: V,
    expire_at: u64,
}

struct Inner<K, V> {
    items: DashMap<K, StoreItem<V>>,
    clock: Arc<dyn Clock>,
    scan_interval: u64,
    next_scan: AtomicU64,
    scanning: AtomicBool,
    on_expired: Option<ExpiredHook<K, V>>,
}

/// A concurrent map whose items expire after a TTL.
///
/// Reads treat expired items as absent. Expired items are physically removed by a sweep, which is
/// started from [`set`](BackingStore::set) at most once per scan interval and runs on the blocking
/// pool of the current tokio runtime (or inline outside of a runtime).
pub struct MemoryStore<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for MemoryStore<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> MemoryStore<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(
        clock: Arc<dyn Clock>,
        scan_interval: Duration,
        on_expired: Option<ExpiredHook<K, V>>,
    ) -> Self {
        let scan_interval = scan_interval.as_secs().max(1);
        let next_scan = clock.now().saturating_add(scan_interval);
        let inner = Inner {
            items: DashMap::new(),
            clock,
            scan_interval,
            next_scan: AtomicU64::new(next_scan),
            scanning: AtomicBool::new(false),
            on_expired,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Number of items held, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.inner.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.items.is_empty()
    }

    /// Removes all expired items right away, unless a sweep is already running.
    pub fn sweep(&self) {
        if self.inner.scanning.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.sweep();
    }

    fn maybe_start_sweep(&self, now: u64) {
        let inner = &self.inner;
        let next_scan = inner.next_scan.load(Ordering::Acquire);
        if now < next_scan || inner.scanning.load(Ordering::Acquire) {
            return;
        }
        let following = now.saturating_add(inner.scan_interval);
        if inner
            .next_scan
            .compare_exchange(next_scan, following, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        if inner.scanning.swap(true, Ordering::AcqRel) {
            return;
        }

        let inner = Arc::clone(inner);
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || inner.sweep());
            }
            Err(_) => inner.sweep(),
        }
    }
}

impl<K, V> Inner<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Expects `scanning` to be set, and clears it when done.
    fn sweep(self: &Arc<Self>) {
        let _done = {
            let inner = Arc::clone(self);
            CallOnDrop::new(move || inner.scanning.store(false, Ordering::Release))
        };

        let now = self.clock.now();
        let expired: Vec<K> = self
            .items
            .iter()
            .filter(|item| now >= item.expire_at)
            .map(|item| item.key().clone())
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for key in expired {
            if let Some((key, item)) = self.items.remove_if(&key, |_, item| now >= item.expire_at)
            {
                removed.push((key, item.value));
            }
        }

        tracing::debug!(expired = removed.len(), "swept expired cache items");

        if removed.is_empty() {
            return;
        }
        if let Some(on_expired) = &self.on_expired {
            if catch_unwind(AssertUnwindSafe(|| on_expired(removed))).is_err() {
                tracing::error!("expiration hook panicked");
            }
        }
    }
}

impl<K, V> BackingStore<K, V> for MemoryStore<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn set(&self, key: K, value: V, expire_ttl: Duration) {
        let now = self.inner.clock.now();
        let item = StoreItem {
            value,
            expire_at: deadline(now, expire_ttl),
        };
        self.inner.items.insert(key, item);
        self.maybe_start_sweep(now);
    }

    fn try_get(&self, key: &K) -> Option<V> {
        let now = self.inner.clock.now();
        let item = self.inner.items.get(key)?;
        (now < item.expire_at).then(|| item.value.clone())
    }

    fn remove(&self, key: &K) {
        self.inner.items.remove(key);
    }
}

impl<K: Eq + Hash, V> fmt::Debug for MemoryStore<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("len", &self.inner.items.len())
            .field("scan_interval", &self.inner.scan_interval)
            .field("next_scan", &self.inner.next_scan.load(Ordering::Relaxed))
            .finish()
    }
}
