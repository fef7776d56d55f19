use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// An error returned from a cache lookup.
///
/// Errors are cloned to every caller that waits on the same computation, so
/// the producer error is kept behind an [`Arc`].
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The producer failed while creating the value.
    ///
    /// Failures of background refreshes are never reported through this variant.
    #[error("producer failed: {0:#}")]
    Producer(Arc<anyhow::Error>),
    /// Too many callers are already waiting for the same key.
    #[error("wait queue limit of {limit} exceeded")]
    QueueLimitExceeded { limit: u32 },
    /// The computation was dropped or panicked before it produced a result.
    #[error("internal error")]
    InternalError,
}

impl CacheError {
    pub(crate) fn from_producer(err: anyhow::Error) -> Self {
        Self::Producer(Arc::new(err))
    }

    /// Returns `true` if retrying the same lookup later may succeed without changes.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Producer(_))
    }
}

/// An invalid cache configuration, rejected when building a cache.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("outdate_ttl ({outdate:?}) must not exceed expire_ttl ({expire:?})")]
    OutdateExceedsExpire { outdate: Duration, expire: Duration },
    #[error("max_queue_size must be greater than zero")]
    ZeroQueueSize,
    #[error("caches must be built from within a tokio runtime")]
    NoRuntime,
}
