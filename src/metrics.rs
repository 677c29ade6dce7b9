//! StatsD telemetry
//!
//! A thin facade over the statsd client: timings, gauges, and counters with
//! the `wireguard` prefix. Sends are fire-and-forget UDP; a telemetry
//! failure must never affect reconciliation, so errors are swallowed.

use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Instant;

use cadence::prelude::*;
use cadence::{NopMetricSink, StatsdClient, UdpMetricSink};

use crate::error::MetricsError;

/// Metric prefix shared by all relays
const PREFIX: &str = "wireguard";

/// Shared statsd client
#[derive(Clone)]
pub struct Metrics {
    client: Arc<StatsdClient>,
}

impl Metrics {
    /// Connect a UDP sink to the given statsd address
    ///
    /// # Errors
    ///
    /// Returns `MetricsError` if the local socket cannot be bound or the
    /// address does not resolve.
    pub fn new(address: &str) -> Result<Self, MetricsError> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        let sink = UdpMetricSink::from(address, socket)?;
        Ok(Self {
            client: Arc::new(StatsdClient::from_sink(PREFIX, sink)),
        })
    }

    /// A client that discards everything; used by tests
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            client: Arc::new(StatsdClient::from_sink(PREFIX, NopMetricSink)),
        }
    }

    /// Report the time elapsed since `started` under the given name
    pub fn timing(&self, name: &str, started: Instant) {
        let _ = self.client.time(name, started.elapsed());
    }

    pub fn gauge(&self, name: &str, value: u64) {
        let _ = self.client.gauge(name, value);
    }

    pub fn incr(&self, name: &str) {
        let _ = self.client.incr(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_client_swallows_everything() {
        let metrics = Metrics::disabled();
        metrics.timing("synchronize_time", Instant::now());
        metrics.gauge("connected_peers", 42);
        metrics.incr("error_getting_peers");
    }

    #[test]
    fn test_udp_sink_construction() {
        let metrics = Metrics::new("127.0.0.1:8125").unwrap();
        metrics.incr("startup");
    }
}
