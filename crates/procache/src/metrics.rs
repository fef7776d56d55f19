//! Statsd reporting for cache lookups, computations and hook dispatch.
//!
//! Every metric carries a `cache` tag with the configured cache name. Nothing is sent until
//! [`configure_statsd`] has been called once for the process.
use std::collections::BTreeMap;
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use cadence::{Metric, MetricBuilder, StatsdClient, UdpMetricSink};

#[doc(hidden)]
pub use cadence;

static METRICS_CLIENT: OnceLock<MetricsClient> = OnceLock::new();

/// A statsd client plus the tags attached to everything it sends.
#[derive(Debug)]
pub struct MetricsClient {
    pub statsd: StatsdClient,
    default_tags: BTreeMap<String, String>,
}

impl MetricsClient {
    /// Adds the default tags and sends the metric, ignoring send errors.
    #[inline(always)]
    pub fn send<'a, T>(&'a self, metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        self.default_tags
            .iter()
            .fold(metric, |metric, (tag, value)| metric.with_tag(tag, value))
            .send()
    }
}

/// Starts reporting to the statsd server at `host`, prefixing every metric name with `prefix`.
///
/// A process can only be configured once.
pub fn configure_statsd<A: ToSocketAddrs>(
    prefix: &str,
    host: A,
    default_tags: BTreeMap<String, String>,
) -> Result<()> {
    let addrs: Vec<_> = host
        .to_socket_addrs()
        .context("failed to resolve statsd host")?
        .collect();
    let Some(addr) = addrs.first() else {
        anyhow::bail!("statsd host resolved to no addresses");
    };
    tracing::info!(%addr, prefix, "Reporting cache metrics to statsd");

    let socket = UdpSocket::bind("0.0.0.0:0").context("failed to bind statsd socket")?;
    socket.set_nonblocking(true)?;
    let sink = UdpMetricSink::from(&addrs[..], socket)?;

    METRICS_CLIENT
        .set(MetricsClient {
            statsd: StatsdClient::from_sink(prefix, sink),
            default_tags,
        })
        .map_err(|_| anyhow::anyhow!("statsd metrics were already configured"))
}

/// Runs `f` with the configured client, or returns `R::default()` without one.
#[inline(always)]
pub fn with_client<F, R>(f: F) -> R
where
    F: FnOnce(&MetricsClient) -> R,
    R: Default,
{
    METRICS_CLIENT.get().map(f).unwrap_or_default()
}

/// Emits a counter, gauge, timer or histogram with optional `key => value` tags.
///
/// ```ignore
/// metric!(counter("procache.access") += 1, "cache" => name, "hit" => "true");
/// metric!(timer("procache.computation.duration") = started.elapsed(), "cache" => name);
/// ```
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send count_with_tags, $id, $value $(, $k => $v)*)
    };
    (gauge($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send gauge_with_tags, $id, $value $(, $k => $v)*)
    };
    (timer($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send time_with_tags, $id, $value $(, $k => $v)*)
    };
    (histogram($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send histogram_with_tags, $id, $value $(, $k => $v)*)
    };
    (@send $method:ident, $id:expr, $value:expr $(, $k:expr => $v:expr)*) => {{
        $crate::metrics::with_client(|client| {
            #[allow(unused_imports)]
            use $crate::metrics::cadence::prelude::*;
            client.send(client.statsd.$method($id, $value)$(.with_tag($k, $v))*);
        })
    }};
}
