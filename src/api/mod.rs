//! Inventory API surface
//!
//! - [`peer`]: the peer wire format and its parsing boundary
//! - [`client`]: HTTP client for peer fetches and connection reports
//! - [`subscriber`]: WebSocket subscriber for near-real-time peer events

pub mod client;
pub mod peer;
pub mod subscriber;

pub use client::{ApiClient, ApiConfig};
pub use peer::{
    ConnectedKeys, ParsedPeer, PeerKey, PeerParseError, PresharedKey, WireguardPeer,
    WireguardPeerList,
};
pub use subscriber::{EventAction, Subscriber, WireguardEvent, EVENT_CHANNEL_CAPACITY};
