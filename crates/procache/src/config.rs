//! Configuration of a single cache instance.
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::error::ConfigError;

/// Configuration for a [`CoalescingCache`](crate::CoalescingCache) or
/// [`BatchCoalescingCache`](crate::BatchCoalescingCache).
///
/// Durations are given in humantime format when deserialized, e.g. `expire_ttl: 5m`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CacheConfig {
    /// Name used to tag logs and metrics.
    #[serde(default = "default_name")]
    pub name: String,

    /// Hard lifetime of an entry, measured from its creation or last refresh.
    #[serde(with = "humantime_serde")]
    pub expire_ttl: Duration,

    /// Age after which an entry is refreshed in the background.
    ///
    /// A zero duration disables background refreshes.
    #[serde(default, with = "humantime_serde")]
    pub outdate_ttl: Duration,

    /// Maximum number of callers that may wait on a single pending key.
    ///
    /// `None` means unlimited.
    #[serde(default)]
    pub max_queue_size: Option<u32>,

    /// How often the default store sweeps expired entries.
    #[serde(
        default = "default_expiration_scan_interval",
        with = "humantime_serde"
    )]
    pub expiration_scan_interval: Duration,

    /// Capacity of the channel feeding the event hook.
    #[serde(default = "default_hook_queue_size")]
    pub hook_queue_size: usize,
}

fn default_name() -> String {
    "default".into()
}

fn default_expiration_scan_interval() -> Duration {
    Duration::from_secs(600)
}

fn default_hook_queue_size() -> usize {
    1024
}

impl CacheConfig {
    /// Creates a config with the given hard TTL and defaults for everything else.
    pub fn new(expire_ttl: Duration) -> Self {
        Self {
            name: default_name(),
            expire_ttl,
            outdate_ttl: Duration::ZERO,
            max_queue_size: None,
            expiration_scan_interval: default_expiration_scan_interval(),
            hook_queue_size: default_hook_queue_size(),
        }
    }

    /// Parses a config from a YAML document.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        if yaml.trim().is_empty() {
            anyhow::bail!("cache config empty");
        }
        serde_yaml::from_str(yaml).context("failed to parse cache config YAML")
    }

    /// Checks the config for contradictory values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.outdate_ttl > self.expire_ttl {
            return Err(ConfigError::OutdateExceedsExpire {
                outdate: self.outdate_ttl,
                expire: self.expire_ttl,
            });
        }
        if self.max_queue_size == Some(0) {
            return Err(ConfigError::ZeroQueueSize);
        }
        Ok(())
    }

    /// Whether stale entries are refreshed in the background.
    pub fn refreshes_enabled(&self) -> bool {
        !self.outdate_ttl.is_zero()
    }

    /// The sweep interval in whole seconds, at least one.
    pub(crate) fn scan_interval_secs(&self) -> u64 {
        self.expiration_scan_interval.as_secs().max(1)
    }

    pub(crate) fn hook_capacity(&self) -> usize {
        self.hook_queue_size.max(1)
    }
}
