//! Error types for wg-steward
//!
//! Errors fall into three bands: construction errors (fatal, operators must
//! provision before launch), transient runtime errors (logged and swallowed
//! inside the engines, the next periodic reconciliation re-converges), and
//! bad inventory data (dropped at the parsing boundary). Only the first band
//! surfaces through these types to `main`.

use std::io;

use thiserror::Error;

/// Top-level error type for wg-steward
#[derive(Debug, Error)]
pub enum StewardError {
    /// Configuration errors (flag validation, duration parsing)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Inventory API errors
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    /// WireGuard kernel control errors
    #[error("WireGuard error: {0}")]
    Wireguard(#[from] WireguardError),

    /// Portforwarding (netfilter) errors
    #[error("Portforwarding error: {0}")]
    Portforward(#[from] PortforwardError),

    /// Event-stream subscriber errors
    #[error("Subscriber error: {0}")]
    Subscriber(#[from] SubscriberError),

    /// Metrics sink errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] MetricsError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration-related errors
///
/// Flag and duration parse failures are reported by clap before this layer;
/// what remains is cross-flag validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No WireGuard interfaces configured
    #[error("No wireguard interfaces configured")]
    NoInterfaces,
}

/// Inventory API errors
#[derive(Debug, Error)]
pub enum ApiError {
    /// Request construction, transport, timeout, or non-2xx status
    #[error("Inventory request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Response body that did not decode as a peer list
    #[error("Error decoding wireguard peers: {0}")]
    Decode(String),
}

/// WireGuard kernel control errors
#[derive(Debug, Error)]
pub enum WireguardError {
    /// Interface name rejected by the kernel naming rules
    #[error("Invalid wireguard interface name {name}: {reason}")]
    InvalidInterface { name: String, reason: String },

    /// Construction-time probe of a configured interface failed
    #[error("Error getting wireguard interface {interface}: {reason}")]
    InterfaceProbe { interface: String, reason: String },

    /// A peer-config batch was rejected by the kernel
    #[error("Error configuring wireguard interface {interface}: {reason}")]
    Configure { interface: String, reason: String },

    /// Engine constructed with an empty interface list
    #[error("No wireguard interfaces configured")]
    NoInterfaces,

    /// Netlink I/O error
    #[error("WireGuard I/O error: {0}")]
    Io(#[from] io::Error),
}

impl WireguardError {
    pub fn probe(interface: impl Into<String>, reason: impl ToString) -> Self {
        Self::InterfaceProbe {
            interface: interface.into(),
            reason: reason.to_string(),
        }
    }

    pub fn configure(interface: impl Into<String>, reason: impl ToString) -> Self {
        Self::Configure {
            interface: interface.into(),
            reason: reason.to_string(),
        }
    }
}

/// Portforwarding (iptables/ipset) errors
#[derive(Debug, Error)]
pub enum PortforwardError {
    /// Managed chain missing from the nat table
    #[error("An iptables chain named {chain} does not exist ({family})")]
    MissingChain { chain: String, family: &'static str },

    /// Referenced ipset missing
    #[error("An ipset named {0} does not exist")]
    MissingIpset(String),

    /// Relay hostname not of the form <country>-<city>-NNN.mullvad.net
    #[error("Hostname {0} is not of format <country>-<city>-<XXX>.mullvad.net")]
    InvalidHostname(String),

    /// iptables/ip6tables invocation failure
    #[error("Firewall operation failed: {0}")]
    Firewall(String),
}

impl PortforwardError {
    pub fn firewall(reason: impl ToString) -> Self {
        Self::Firewall(reason.to_string())
    }
}

/// Event-stream subscriber errors
#[derive(Debug, Error)]
pub enum SubscriberError {
    /// Malformed message-queue URL
    #[error("Invalid message-queue url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// WebSocket transport error
    #[error("Message-queue connection error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Metrics sink errors
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Failed to bind the local UDP socket
    #[error("Metrics socket error: {0}")]
    Io(#[from] io::Error),

    /// Failed to construct the statsd sink
    #[error("Metrics sink error: {0}")]
    Sink(#[from] cadence::MetricError),
}

/// Type alias for Result with StewardError
pub type Result<T> = std::result::Result<T, StewardError>;
