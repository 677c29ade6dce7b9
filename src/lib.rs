//! wg-steward: control-plane daemon for WireGuard relay hosts
//!
//! Keeps a relay's kernel WireGuard interfaces and its DNAT portforwarding
//! rules in continuous agreement with the authoritative peer inventory. The
//! daemon owns no routing policy; its job is reconciliation.
//!
//! # Architecture
//!
//! ```text
//! inventory API ──fetch──▶ Supervisor ──peers──▶ WireguardEngine ──▶ netlink
//!       ▲                      │                 PortforwardEngine ──▶ iptables
//!       └──connection report───┤
//! message queue ──events──────▶┘  (single serialized dispatcher)
//! ```
//!
//! The supervisor pulls the peer list and hands the same list to both
//! engines; each reconciles its own kernel domain independently. The event
//! stream bypasses the periodic path and drives single-peer fast paths.
//!
//! # Modules
//!
//! - [`api`]: peer wire format, inventory HTTP client, event subscriber
//! - [`wireguard`]: peer reconciliation over the WireGuard interfaces
//! - [`portforward`]: DNAT rule reconciliation in the managed chains
//! - [`supervisor`]: the serialized control loop and its tickers
//! - [`config`]: CLI flags and `WG_*` environment variables
//! - [`metrics`]: statsd telemetry
//! - [`error`]: error types

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod api;
pub mod config;
pub mod error;
pub mod metrics;
pub mod portforward;
pub mod supervisor;
pub mod wireguard;

// Re-export commonly used types at the crate root
pub use api::{
    ApiClient, ApiConfig, ConnectedKeys, EventAction, PeerKey, PresharedKey, Subscriber,
    WireguardEvent, WireguardPeer, WireguardPeerList, EVENT_CHANNEL_CAPACITY,
};
pub use config::Config;
pub use error::{
    ApiError, ConfigError, MetricsError, PortforwardError, Result, StewardError, SubscriberError,
    WireguardError,
};
pub use metrics::Metrics;
pub use portforward::PortforwardEngine;
pub use supervisor::{Intervals, Supervisor};
pub use wireguard::WireguardEngine;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
