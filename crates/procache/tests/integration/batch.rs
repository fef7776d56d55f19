use std::sync::{Arc, Mutex};
use std::time::Duration;

use procache::{
    BackingStore, BatchCoalescingCache, CacheBuilder, CacheConfig, CacheEntry, CacheError, Clock,
    ManualClock, MemoryStore,
};
use procache_test::{Counter, Gate, Versioned};

use crate::{CancellationToken, Value, config, manual_clock, shared_store, test};

/// A batch backend that only knows even keys.
#[derive(Default)]
struct Backend {
    counter: Counter,
    requests: Mutex<Vec<Vec<u32>>>,
    /// Even keys that are not returned anymore.
    hidden: Mutex<Vec<u32>>,
    gate: Gate,
    /// The call number from which calls wait for the gate.
    gate_from: Option<usize>,
    /// The call number that panics instead of returning.
    panic_on: Option<usize>,
}

impl Backend {
    async fn produce(self: Arc<Self>, keys: Vec<u32>) -> anyhow::Result<Vec<(u32, Value)>> {
        self.requests.lock().unwrap().push(keys.clone());
        let version = self.counter.check()?;
        if self.panic_on == Some(version) {
            panic!("backend panicked on call {version}");
        }
        if self.gate_from.is_some_and(|from| version >= from) {
            self.gate.wait().await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        let hidden = self.hidden.lock().unwrap().clone();
        Ok(keys
            .into_iter()
            .filter(|key| key % 2 == 0 && !hidden.contains(key))
            .map(|key| (key, Versioned::new(key, version)))
            .collect())
    }

    /// The requested keys of every call so far, sorted per call.
    fn requests(&self) -> Vec<Vec<u32>> {
        let mut requests = self.requests.lock().unwrap().clone();
        for keys in &mut requests {
            keys.sort();
        }
        requests
    }
}

struct BatchFixture {
    cache: BatchCoalescingCache<u32, Value>,
    backend: Arc<Backend>,
    clock: Arc<ManualClock>,
    store: MemoryStore<u32, Arc<CacheEntry<Value>>>,
}

impl BatchFixture {
    fn new(config: CacheConfig) -> Self {
        Self::with_backend(config, Backend::default())
    }

    fn with_backend(config: CacheConfig, backend: Backend) -> Self {
        test::setup();

        let clock = manual_clock();
        let backend = Arc::new(backend);
        let (factory, slot) = shared_store(&clock, config.expiration_scan_interval);

        let cache = CacheBuilder::<u32, Value>::new(config)
            .with_clock(clock.clone())
            .with_store(factory)
            .build_batch({
                let backend = Arc::clone(&backend);
                move |keys: Vec<u32>, _: (), _cancel: CancellationToken| {
                    Arc::clone(&backend).produce(keys)
                }
            })
            .unwrap();
        let store = slot.lock().unwrap().take().unwrap();

        Self {
            cache,
            backend,
            clock,
            store,
        }
    }

    async fn get(&self, keys: &[u32]) -> Result<Vec<(u32, usize)>, CacheError> {
        let values = self
            .cache
            .get(keys.to_vec(), (), CancellationToken::new())
            .await?;
        let mut values: Vec<_> = values
            .into_iter()
            .map(|(key, value)| {
                assert_eq!(key, value.key);
                (key, value.version)
            })
            .collect();
        values.sort();
        Ok(values)
    }

    fn advance(&self, secs: u64) {
        self.clock.advance(Duration::from_secs(secs));
    }

    fn clock_now(&self) -> u64 {
        self.clock.now()
    }

    fn gate_open(&self) {
        self.backend.gate.open();
    }

    fn entry(&self, key: u32) -> Arc<CacheEntry<Value>> {
        self.store.try_get(&key).unwrap()
    }
}

#[tokio::test]
async fn test_partial_result() {
    let fixture = BatchFixture::new(config(60, 0));

    assert_eq!(fixture.get(&[1, 2, 3, 4, 5]).await.unwrap(), [(2, 1), (4, 1)]);

    // odd keys are cached as having no value
    assert_eq!(fixture.get(&[1, 2, 3, 4, 5]).await.unwrap(), [(2, 1), (4, 1)]);
    assert_eq!(fixture.backend.requests(), [vec![1, 2, 3, 4, 5]]);

    let odd = fixture.entry(3);
    assert!(odd.is_resolved());
    assert_eq!(odd.value(), None);
}

#[tokio::test]
async fn test_intersecting_requests() {
    let fixture = BatchFixture::new(config(60, 0));

    assert_eq!(fixture.get(&[1, 2, 3]).await.unwrap(), [(2, 1)]);
    assert_eq!(fixture.get(&[2, 3, 4, 5]).await.unwrap(), [(2, 1), (4, 2)]);

    // duplicates are requested once
    assert_eq!(fixture.get(&[6, 6, 2, 6]).await.unwrap(), [(2, 1), (6, 3)]);

    // nothing to compute, no call
    assert_eq!(fixture.get(&[1, 2]).await.unwrap(), [(2, 1)]);
    assert!(fixture.get(&[]).await.unwrap().is_empty());

    assert_eq!(
        fixture.backend.requests(),
        [vec![1, 2, 3], vec![4, 5], vec![6]]
    );
}

#[tokio::test]
async fn test_refresh_stale_keys() {
    let fixture = BatchFixture::new(config(10, 1));

    assert_eq!(fixture.get(&[1, 2]).await.unwrap(), [(2, 1)]);

    // stale keys are refreshed in the same call as new keys
    fixture.advance(1);
    assert_eq!(fixture.get(&[2, 4]).await.unwrap(), [(2, 2), (4, 2)]);
    assert_eq!(fixture.backend.requests(), [vec![1, 2], vec![2, 4]]);

    let refreshed = fixture.entry(2);
    assert!(!refreshed.is_refreshing());
    assert_eq!(refreshed.stale_at(), fixture.clock_now() + 1);

    // key 1 is stale as well, and refreshed on its own
    assert_eq!(fixture.get(&[1, 2, 4]).await.unwrap(), [(2, 2), (4, 2)]);
    assert_eq!(fixture.backend.requests()[2], [1]);
}

#[tokio::test]
async fn test_vanished_refresh() {
    let fixture = BatchFixture::new(config(10, 1));

    assert_eq!(fixture.get(&[2]).await.unwrap(), [(2, 1)]);

    fixture.advance(1);
    fixture.backend.hidden.lock().unwrap().push(2);

    // the refresh did not return the key, so this call has no value for it
    assert!(fixture.get(&[2]).await.unwrap().is_empty());

    // the old value is kept and no longer stale
    let entry = fixture.entry(2);
    assert!(!entry.is_refreshing());
    assert_eq!(entry.value().unwrap().version, 1);
    assert_eq!(fixture.get(&[2]).await.unwrap(), [(2, 1)]);
    assert_eq!(fixture.backend.requests(), [vec![2], vec![2]]);
}

#[tokio::test]
async fn test_producer_failure() {
    let fixture = BatchFixture::new(config(10, 1));

    assert_eq!(fixture.get(&[1, 2]).await.unwrap(), [(2, 1)]);

    fixture.advance(1);
    fixture.backend.counter.set_failing(true);
    let err = fixture.get(&[2, 3, 4]).await.unwrap_err();
    assert!(matches!(err, CacheError::Producer(_)), "{err:?}");

    // new entries were dropped, stale ones kept their value
    assert!(fixture.store.try_get(&3).is_none());
    assert!(fixture.store.try_get(&4).is_none());
    let stale = fixture.entry(2);
    assert!(!stale.is_refreshing());
    assert_eq!(stale.value().unwrap().version, 1);

    fixture.backend.counter.set_failing(false);
    assert_eq!(fixture.get(&[4]).await.unwrap(), [(4, 3)]);
    assert_eq!(
        fixture.backend.requests(),
        [vec![1, 2], vec![2, 3, 4], vec![4]]
    );
}

#[tokio::test]
async fn test_panicking_producer() {
    let backend = Backend {
        panic_on: Some(2),
        ..Default::default()
    };
    let fixture = BatchFixture::with_backend(config(10, 1), backend);

    assert_eq!(fixture.get(&[2]).await.unwrap(), [(2, 1)]);

    fixture.advance(1);
    let err = fixture.get(&[2, 4]).await.unwrap_err();
    assert!(matches!(err, CacheError::InternalError), "{err:?}");

    // the new entry was evicted and the refresh claim released
    assert!(fixture.store.try_get(&4).is_none());
    let stale = fixture.entry(2);
    assert!(!stale.is_refreshing());
    assert_eq!(stale.value().unwrap().version, 1);

    assert_eq!(fixture.get(&[2, 4]).await.unwrap(), [(2, 3), (4, 3)]);
    assert_eq!(
        fixture.backend.requests(),
        [vec![2], vec![2, 4], vec![2, 4]]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_waits_for_keys_in_flight() {
    let backend = Backend {
        gate_from: Some(1),
        ..Default::default()
    };
    let fixture = BatchFixture::with_backend(config(60, 0), backend);

    let first = {
        let cache = fixture.cache.clone();
        tokio::spawn(async move { cache.get(vec![1, 2], (), CancellationToken::new()).await })
    };
    let backend = Arc::clone(&fixture.backend);
    test::eventually(|| {
        let backend = Arc::clone(&backend);
        async move { backend.counter.calls() == 1 }
    })
    .await;

    // key 2 is in flight, only key 4 is requested
    let second = {
        let cache = fixture.cache.clone();
        tokio::spawn(async move { cache.get(vec![2, 4], (), CancellationToken::new()).await })
    };
    test::eventually(|| {
        let backend = Arc::clone(&backend);
        async move { backend.counter.calls() == 2 }
    })
    .await;

    fixture.gate_open();
    let first = first.await.unwrap().unwrap();
    let mut second = second.await.unwrap().unwrap();
    second.sort_by_key(|(key, _)| *key);

    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 2);
    assert!(Arc::ptr_eq(&first[0].1, &second[0].1));
    assert_eq!(second[1].1.version, 2);
    assert_eq!(fixture.backend.requests(), [vec![1, 2], vec![4]]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_queue_limit() {
    let mut cfg = config(60, 0);
    cfg.max_queue_size = Some(1);
    let backend = Backend {
        gate_from: Some(1),
        ..Default::default()
    };
    let fixture = BatchFixture::with_backend(cfg, backend);

    let first = {
        let cache = fixture.cache.clone();
        tokio::spawn(async move { cache.get(vec![2], (), CancellationToken::new()).await })
    };
    let backend = Arc::clone(&fixture.backend);
    test::eventually(|| {
        let backend = Arc::clone(&backend);
        async move { backend.counter.calls() == 1 }
    })
    .await;

    // key 4 is still computed, but the call fails because key 2 is full
    let second = {
        let cache = fixture.cache.clone();
        tokio::spawn(async move { cache.get(vec![2, 4], (), CancellationToken::new()).await })
    };
    test::eventually(|| {
        let backend = Arc::clone(&backend);
        async move { backend.counter.calls() == 2 }
    })
    .await;

    fixture.gate_open();
    let err = second.await.unwrap().unwrap_err();
    assert!(matches!(err, CacheError::QueueLimitExceeded { limit: 1 }));

    assert_eq!(first.await.unwrap().unwrap().len(), 1);
    assert_eq!(fixture.get(&[2, 4]).await.unwrap(), [(2, 1), (4, 2)]);
    assert_eq!(fixture.backend.requests(), [vec![2], vec![4]]);
}
