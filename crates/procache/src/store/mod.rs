//! Pluggable key-value storage holding cache entries.
use std::sync::Arc;
use std::time::Duration;

pub mod memory;

/// Called with the items a store evicted because their hard TTL passed.
pub type ExpiredHook<K, V> = Arc<dyn Fn(Vec<(K, V)>) + Send + Sync>;

/// Builds the store for a cache, given the hook it must report expirations to.
pub type StoreFactory<K, V> =
    Box<dyn FnOnce(Option<ExpiredHook<K, V>>) -> Arc<dyn BackingStore<K, V>> + Send>;

/// A key-value store with per-item expiration.
///
/// Implementations must be safe to call concurrently. An item whose TTL passed must no longer be
/// returned from [`try_get`](Self::try_get), and should eventually be reported to the
/// [`ExpiredHook`] the store was built with.
pub trait BackingStore<K, V>: Send + Sync {
    /// Inserts or replaces the item for `key`, expiring `expire_ttl` from now.
    fn set(&self, key: K, value: V, expire_ttl: Duration);

    fn try_get(&self, key: &K) -> Option<V>;

    fn remove(&self, key: &K);
}
