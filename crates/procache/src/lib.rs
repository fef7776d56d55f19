//! A request-coalescing cache that refreshes stale values in the background.
//!
//! Concurrent lookups of a missing key share a single computation, and values past their
//! staleness deadline keep being served while exactly one caller refreshes them. See
//! [`CoalescingCache`] for single keys and [`BatchCoalescingCache`] for looking up many keys
//! with one producer call.

use std::fmt;
use std::hash::Hash;

#[macro_use]
pub mod metrics;

pub mod batch;
pub mod cache;
pub mod clock;
pub mod config;
pub mod entry;
pub mod error;
pub mod hook;
mod shards;
mod shared;
pub mod store;
mod utils;

pub use batch::{BatchCoalescingCache, BatchProducer};
pub use cache::{CoalescingCache, Lookup, Producer};
pub use clock::{Clock, ManualClock, TickingClock};
pub use config::CacheConfig;
pub use entry::{CacheEntry, EntryResult, ValueFuture};
pub use error::{CacheError, ConfigError};
pub use hook::{EventHook, EventReason};
pub use shared::{CacheBuilder, EntryStore};
pub use store::memory::MemoryStore;
pub use store::{BackingStore, ExpiredHook, StoreFactory};
pub use tokio_util::sync::CancellationToken;

/// Types usable as cache keys.
pub trait CacheKey: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> CacheKey for T where T: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

/// Types usable as cached values.
pub trait CacheValue: Clone + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + Send + Sync + 'static {}
