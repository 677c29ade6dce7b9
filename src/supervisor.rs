//! Control loop
//!
//! A single serialized dispatcher selects over the event channel, three
//! periodic tickers, and the shutdown watch. At most one of {event handling,
//! peer counting, synchronization, handshake reset} runs at any instant, so
//! the engines carry no locks. The tickers are free-running: a tick that
//! would fire while a previous task is still executing is coalesced into
//! one, never queued.
//!
//! Kernel calls inside the dispatcher are blocking and non-cancellable;
//! shutdown takes effect between tasks.

use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant as TokioInstant};
use tracing::{info, warn};

use crate::api::{ApiClient, EventAction, WireguardEvent};
use crate::metrics::Metrics;
use crate::portforward::PortforwardEngine;
use crate::wireguard::WireguardEngine;

/// Periods for the supervisor tickers
#[derive(Debug, Clone)]
pub struct Intervals {
    pub count_peers: Duration,
    pub synchronize: Duration,
    pub reset_handshake: Duration,
    /// Max random extra delay per synchronization tick. Decorrelates relays
    /// that restart together; not a correctness measure.
    pub synchronize_jitter: Duration,
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            count_peers: Duration::from_secs(60),
            synchronize: Duration::from_secs(60),
            reset_handshake: Duration::from_secs(60),
            synchronize_jitter: Duration::from_secs(45),
        }
    }
}

/// Jitter for the count and reset tickers
const TICK_JITTER: Duration = Duration::from_micros(1);

/// A ticker whose every tick is delayed by a fresh random jitter
///
/// The deadline is re-armed when a tick is consumed, so ticks that would
/// have fired while the dispatcher was busy coalesce.
struct JitteredInterval {
    period: Duration,
    max_jitter: Duration,
    deadline: TokioInstant,
}

impl JitteredInterval {
    fn new(period: Duration, max_jitter: Duration) -> Self {
        let mut interval = Self {
            period,
            max_jitter,
            deadline: TokioInstant::now(),
        };
        interval.rearm();
        interval
    }

    fn rearm(&mut self) {
        let jitter = if self.max_jitter.is_zero() {
            Duration::ZERO
        } else {
            rand::thread_rng().gen_range(Duration::ZERO..=self.max_jitter)
        };
        self.deadline = TokioInstant::now() + self.period + jitter;
    }

    /// Wait for the next tick. Cancel-safe: dropping the future leaves the
    /// deadline armed, completing it re-arms.
    async fn tick(&mut self) {
        sleep_until(self.deadline).await;
        self.rearm();
    }
}

/// Owns the engines, the inventory client, and the dispatcher state
pub struct Supervisor {
    api: ApiClient,
    wireguard: WireguardEngine,
    portforward: PortforwardEngine,
    metrics: Metrics,
    events: mpsc::Receiver<WireguardEvent>,
    count_ticker: JitteredInterval,
    sync_ticker: JitteredInterval,
    reset_ticker: JitteredInterval,
    shutdown: watch::Receiver<bool>,
}

impl Supervisor {
    pub fn new(
        api: ApiClient,
        wireguard: WireguardEngine,
        portforward: PortforwardEngine,
        metrics: Metrics,
        events: mpsc::Receiver<WireguardEvent>,
        intervals: &Intervals,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            api,
            wireguard,
            portforward,
            metrics,
            events,
            count_ticker: JitteredInterval::new(intervals.count_peers, TICK_JITTER),
            sync_ticker: JitteredInterval::new(intervals.synchronize, intervals.synchronize_jitter),
            reset_ticker: JitteredInterval::new(intervals.reset_handshake, TICK_JITTER),
            shutdown,
        }
    }

    /// Run until the shutdown watch flips or the event channel closes
    ///
    /// The relay converges once (synchronize + count) before the loop starts
    /// serving tickers and events.
    pub async fn run(mut self) {
        self.synchronize().await;
        self.count_peers().await;

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    info!("supervisor shutting down");
                    return;
                }
                event = self.events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event),
                        None => {
                            info!("event channel closed, supervisor stopping");
                            return;
                        }
                    }
                }
                () = self.count_ticker.tick() => self.count_peers().await,
                () = self.sync_ticker.tick() => {
                    self.synchronize().await;
                    self.metrics.gauge("eventchannel_length", self.events.len() as u64);
                }
                () = self.reset_ticker.tick() => self.reset_handshake(),
            }
        }
    }

    fn handle_event(&self, event: WireguardEvent) {
        match event.action {
            EventAction::Add => {
                let started = Instant::now();
                self.wireguard.add_peer(&event.peer);
                self.metrics.timing("add_event_add_peer_time", started);

                let started = Instant::now();
                self.portforward.add_portforwarding(&event.peer);
                self.metrics.timing("add_event_add_portforwarding_time", started);
            }
            EventAction::Remove => {
                let started = Instant::now();
                self.wireguard.remove_peer(&event.peer);
                self.metrics.timing("remove_event_remove_peer_time", started);

                let started = Instant::now();
                self.portforward.remove_portforwarding(&event.peer);
                self.metrics
                    .timing("remove_event_remove_portforwarding_time", started);
            }
            EventAction::UpdatePorts => {
                let started = Instant::now();
                self.portforward.update_single_peer(&event.peer);
                self.metrics
                    .timing("update_ports_event_update_portforwarding_time", started);
            }
            // Bad data from the API, ignore it
            EventAction::Unknown => {}
        }
    }

    /// Fetch the inventory and reconcile both engines
    ///
    /// On a fetch error the kernel is left untouched, preserving the
    /// last-known-good configuration until the next tick.
    async fn synchronize(&self) {
        let run_started = Instant::now();

        let started = Instant::now();
        let peers = match self.api.wireguard_peers().await {
            Ok(peers) => peers,
            Err(e) => {
                self.metrics.incr("error_getting_peers");
                warn!(error = %e, "error getting peers");
                self.metrics.timing("synchronize_time", run_started);
                return;
            }
        };
        self.metrics.timing("get_wireguard_peers_time", started);

        let started = Instant::now();
        self.wireguard.update_peers(&peers);
        self.metrics.timing("update_peers_time", started);

        let started = Instant::now();
        self.portforward.update_portforwarding(&peers);
        self.metrics.timing("update_portforwarding_time", started);

        self.metrics.timing("synchronize_time", run_started);
    }

    /// Count connected peers, gauge them, and report the keys upstream
    async fn count_peers(&self) {
        let run_started = Instant::now();

        let (connected_keys, peer_count) = self.wireguard.count_peers();
        self.metrics.gauge("connected_peers", peer_count as u64);

        let started = Instant::now();
        match self.api.post_connections(&connected_keys).await {
            Ok(()) => self
                .metrics
                .timing("post_wireguard_connections_time", started),
            Err(e) => {
                self.metrics.incr("error_posting_connections");
                warn!(error = %e, "error posting connections");
            }
        }

        self.metrics.timing("countpeers_time", run_started);
    }

    fn reset_handshake(&self) {
        let started = Instant::now();
        self.wireguard.reset_peers();
        self.metrics.timing("resethandshake_time", started);
    }
}
