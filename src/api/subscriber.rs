//! Message-queue event subscriber
//!
//! Maintains a WebSocket subscription to the inventory's message queue and
//! forwards decoded peer events into a bounded channel. The supervisor is
//! the sole consumer; when the channel is full the event is dropped here and
//! the periodic synchronization catches up.

use std::time::Duration;

use base64::prelude::*;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::peer::WireguardPeer;
use crate::error::SubscriberError;
use crate::metrics::Metrics;

/// Capacity of the event channel between subscriber and supervisor
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// How long to wait before reconnecting after a dropped connection
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Peer event action as delivered by the message queue
///
/// Unknown actions decode to [`EventAction::Unknown`] and are dropped by the
/// supervisor rather than failing the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum EventAction {
    #[serde(rename = "ADD")]
    Add,
    #[serde(rename = "REMOVE")]
    Remove,
    #[serde(rename = "UPDATE_PORTS")]
    UpdatePorts,
    #[serde(other)]
    Unknown,
}

/// A near-real-time peer notification
#[derive(Debug, Clone, Deserialize)]
pub struct WireguardEvent {
    pub action: EventAction,
    pub peer: WireguardPeer,
}

#[derive(Serialize)]
struct SubscribeFrame<'a> {
    action: &'a str,
    channel: &'a str,
}

/// WebSocket subscriber for the peer event stream
pub struct Subscriber {
    pub url: String,
    pub username: String,
    pub password: String,
    pub channel: String,
    pub metrics: Metrics,
}

impl Subscriber {
    /// Validate the URL and spawn the subscription task
    ///
    /// The task reconnects with a fixed backoff until the shutdown watch
    /// flips. Dropping the returned sender half never happens from here; the
    /// channel closes when this task ends.
    ///
    /// # Errors
    ///
    /// Returns `SubscriberError::InvalidUrl` when the message-queue URL is
    /// unusable. Transport errors after startup are retried, not returned.
    pub fn subscribe(
        self,
        shutdown: watch::Receiver<bool>,
        events: mpsc::Sender<WireguardEvent>,
    ) -> Result<JoinHandle<()>, SubscriberError> {
        self.client_request()?;
        Ok(tokio::spawn(self.run(shutdown, events)))
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>, events: mpsc::Sender<WireguardEvent>) {
        while !*shutdown.borrow_and_update() {
            tokio::select! {
                _ = shutdown.changed() => break,
                result = self.connection(&events) => {
                    match result {
                        Ok(()) => info!("message-queue connection closed"),
                        Err(e) => warn!(error = %e, "message-queue connection lost"),
                    }
                    self.metrics.incr("mq_reconnect");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        () = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
            }
        }
        info!("message-queue subscriber stopped");
    }

    /// One connection lifetime: subscribe, then pump events until the peer
    /// closes or the transport fails
    async fn connection(
        &self,
        events: &mpsc::Sender<WireguardEvent>,
    ) -> Result<(), SubscriberError> {
        let request = self.client_request()?;
        let (mut stream, _) = connect_async(request).await?;

        let frame = serde_json::to_string(&SubscribeFrame {
            action: "SUBSCRIBE",
            channel: &self.channel,
        })
        .expect("subscribe frame serializes");
        stream.send(Message::Text(frame)).await?;
        info!(channel = %self.channel, "subscribed to message-queue");

        while let Some(message) = stream.next().await {
            match message? {
                Message::Text(text) => self.forward(&text, events),
                Message::Close(_) => break,
                Message::Binary(_) | Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }

        Ok(())
    }

    fn forward(&self, text: &str, events: &mpsc::Sender<WireguardEvent>) {
        let event: WireguardEvent = match serde_json::from_str(text) {
            Ok(event) => event,
            Err(e) => {
                // Bad data from the API, ignore it
                self.metrics.incr("mq_decode_error");
                debug!(error = %e, "dropping undecodable message-queue event");
                return;
            }
        };

        self.metrics.incr("mq_event_received");
        if events.try_send(event).is_err() {
            // Overflow is the producer's cost; the periodic sync catches up
            self.metrics.incr("mq_event_dropped");
            warn!("event channel full, dropping event");
        }
    }

    fn client_request(&self) -> Result<Request, SubscriberError> {
        let mut request =
            self.url
                .as_str()
                .into_client_request()
                .map_err(|e| SubscriberError::InvalidUrl {
                    url: self.url.clone(),
                    reason: e.to_string(),
                })?;

        if !self.username.is_empty() && !self.password.is_empty() {
            let credentials = BASE64_STANDARD.encode(format!("{}:{}", self.username, self.password));
            let value = HeaderValue::from_str(&format!("Basic {credentials}"))
                .expect("base64 credentials are a valid header value");
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        Ok(request)
    }
}
