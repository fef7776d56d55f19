//! Helpers for testing caches.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Producers should record their invocations in a [`Counter`], so tests can assert how often
//!    a value was actually computed.
//!
//!  - Background work (refreshes, hooks) completes asynchronously. Use [`eventually`] instead of
//!    fixed sleeps to wait for it.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `procache` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("procache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Counts producer invocations and optionally makes them fail.
#[derive(Debug, Default)]
pub struct Counter {
    calls: AtomicUsize,
    failing: AtomicBool,
}

impl Counter {
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    /// Records an invocation, returning its 1-based number.
    ///
    /// Fails while [`set_failing`](Self::set_failing) is enabled. Failed invocations are
    /// counted too.
    pub fn check(&self) -> anyhow::Result<usize> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("producer failure on call {call}");
        }
        Ok(call)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

/// A value tagged with the producer invocation that created it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<K> {
    pub key: K,
    pub version: usize,
}

impl<K> Versioned<K> {
    pub fn new(key: K, version: usize) -> Arc<Self> {
        Arc::new(Self { key, version })
    }
}

/// A latch that producers can wait on until the test opens it.
#[derive(Debug, Clone)]
pub struct Gate {
    tx: Arc<watch::Sender<bool>>,
}

impl Gate {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn open(&self) {
        self.tx.send_replace(true);
    }

    /// Resolves once the gate is open.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // the sender lives as long as `self`, so this cannot fail
        let _ = rx.wait_for(|open| *open).await;
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

/// Polls `check` until it returns `true`.
///
/// # Panics
///
/// Panics if the condition does not hold within three seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let poll = async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(3), poll)
        .await
        .expect("condition not met within 3s");
}
