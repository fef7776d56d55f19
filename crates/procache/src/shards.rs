//! Striped locks serializing entry creation per key.
use std::hash::{BuildHasher, Hash};
use std::sync::{Mutex, MutexGuard, PoisonError};

use rustc_hash::FxBuildHasher;

const SHARDS: usize = 256;

static KEY_LOCKS: [Mutex<()>; SHARDS] = [const { Mutex::new(()) }; SHARDS];

fn shard_of<K: Hash + ?Sized>(key: &K) -> usize {
    FxBuildHasher.hash_one(key) as usize & (SHARDS - 1)
}

/// Locks the shard owning `key`.
///
/// The guard must never be held across an `.await`.
pub(crate) fn lock<K: Hash + ?Sized>(key: &K) -> MutexGuard<'static, ()> {
    KEY_LOCKS[shard_of(key)]
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}
