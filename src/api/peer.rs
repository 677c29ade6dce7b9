//! Peer records from the inventory API
//!
//! This is the parsing boundary for inventory data: a record that fails to
//! parse here is dropped by the engines rather than failing a whole batch.
//! No I/O happens in this module.

use std::collections::HashMap;
use std::fmt;

use base64::prelude::*;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// A list of wireguard peers as returned by the inventory
pub type WireguardPeerList = Vec<WireguardPeer>;

/// Connected base64 pubkeys and the number of interfaces each was seen on
pub type ConnectedKeys = HashMap<String, u32>;

/// A wireguard peer as represented on the inventory wire format
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct WireguardPeer {
    /// Single-host IPv4 assignment, always /32
    pub ipv4: String,
    /// Single-host IPv6 assignment, always /128
    pub ipv6: String,
    /// Forwarded TCP/UDP ports; empty means no portforwarding
    #[serde(default)]
    pub ports: Vec<u16>,
    /// Optional location tags; `null` elements decode as empty strings
    #[serde(
        default,
        deserialize_with = "cities_null_to_empty",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub cities: Vec<String>,
    /// 44-char base64 encoding of the 32-byte public key
    pub pubkey: String,
}

/// The inventory occasionally emits `cities: null` or `[null, "got"]`.
/// Tolerate both rather than failing the whole peer list.
fn cities_null_to_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let cities: Option<Vec<Option<String>>> = Option::deserialize(deserializer)?;
    Ok(cities
        .unwrap_or_default()
        .into_iter()
        .map(|city| city.unwrap_or_default())
        .collect())
}

/// Reasons a peer record is rejected at the parsing boundary
#[derive(Debug, Error)]
pub enum PeerParseError {
    /// Public key not exactly 32 base64-decoded bytes
    #[error("invalid public key: {0}")]
    Pubkey(String),

    /// ipv4 field not a parseable IPv4 CIDR
    #[error("invalid ipv4 address: {0}")]
    Ipv4(String),

    /// ipv6 field not a parseable IPv6 CIDR
    #[error("invalid ipv6 address: {0}")]
    Ipv6(String),
}

/// An opaque 32-byte WireGuard public key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerKey([u8; 32]);

impl PeerKey {
    /// Decode from standard base64; anything but exactly 32 bytes is rejected
    pub fn from_base64(s: &str) -> Result<Self, PeerParseError> {
        let bytes = BASE64_STANDARD
            .decode(s)
            .map_err(|e| PeerParseError::Pubkey(e.to_string()))?;
        let raw: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| PeerParseError::Pubkey(format!("{} bytes, want 32", b.len())))?;
        Ok(Self(raw))
    }

    #[must_use]
    pub const fn from_raw(raw: [u8; 32]) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_raw(&self) -> [u8; 32] {
        self.0
    }

    #[must_use]
    pub fn to_base64(&self) -> String {
        BASE64_STANDARD.encode(self.0)
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerKey({})", self.to_base64())
    }
}

/// An opaque 32-byte preshared key
///
/// Holds its bytes by value; cloning copies them, so a snapshot's key is
/// never aliased across a later kernel call.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PresharedKey([u8; 32]);

impl PresharedKey {
    #[must_use]
    pub const fn from_raw(raw: [u8; 32]) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_raw(&self) -> [u8; 32] {
        self.0
    }
}

impl fmt::Debug for PresharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Key material stays out of logs
        f.write_str("PresharedKey(..)")
    }
}

/// A peer record with its key and addresses validated
#[derive(Debug, Clone)]
pub struct ParsedPeer {
    pub key: PeerKey,
    pub ipv4: Ipv4Net,
    pub ipv6: Ipv6Net,
}

impl ParsedPeer {
    /// The allowed-IP pair handed to the kernel
    #[must_use]
    pub fn allowed_ips(&self) -> Vec<IpNet> {
        vec![IpNet::V4(self.ipv4), IpNet::V6(self.ipv6)]
    }
}

impl WireguardPeer {
    /// Validate the record into kernel-ready types
    ///
    /// # Errors
    ///
    /// Returns `PeerParseError` if the pubkey or either address is malformed.
    /// Callers drop such peers entirely, in case we get bad data from the API.
    pub fn parse(&self) -> Result<ParsedPeer, PeerParseError> {
        let key = PeerKey::from_base64(&self.pubkey)?;
        let ipv4 = self
            .ipv4
            .parse::<Ipv4Net>()
            .map_err(|e| PeerParseError::Ipv4(e.to_string()))?;
        let ipv6 = self
            .ipv6
            .parse::<Ipv6Net>()
            .map_err(|e| PeerParseError::Ipv6(e.to_string()))?;
        Ok(ParsedPeer { key, ipv4, ipv6 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_pubkey() -> String {
        BASE64_STANDARD.encode([b'a'; 32])
    }

    fn fixture_peer() -> WireguardPeer {
        WireguardPeer {
            ipv4: "10.99.0.1/32".into(),
            ipv6: "fc00:bbbb:bbbb:bb01::1/128".into(),
            ports: vec![4321, 1234],
            cities: vec![],
            pubkey: fixture_pubkey(),
        }
    }

    #[test]
    fn test_decode_peer_list() {
        let json = format!(
            r#"[{{"ipv4":"10.99.0.1/32","ipv6":"fc00:bbbb:bbbb:bb01::1/128","ports":[4321,1234],"pubkey":"{}"}}]"#,
            fixture_pubkey()
        );
        let peers: WireguardPeerList = serde_json::from_str(&json).unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].ports, vec![4321, 1234]);
        assert!(peers[0].cities.is_empty());
    }

    #[test]
    fn test_decode_null_cities() {
        let json = format!(
            r#"{{"ipv4":"10.99.0.1/32","ipv6":"fc00::1/128","ports":[],"cities":null,"pubkey":"{}"}}"#,
            fixture_pubkey()
        );
        let peer: WireguardPeer = serde_json::from_str(&json).unwrap();
        assert!(peer.cities.is_empty());
    }

    #[test]
    fn test_decode_null_city_element() {
        let json = format!(
            r#"{{"ipv4":"10.99.0.1/32","ipv6":"fc00::1/128","ports":[],"cities":[null,"se-mma"],"pubkey":"{}"}}"#,
            fixture_pubkey()
        );
        let peer: WireguardPeer = serde_json::from_str(&json).unwrap();
        assert_eq!(peer.cities, vec![String::new(), "se-mma".to_string()]);
    }

    #[test]
    fn test_parse_valid_peer() {
        let parsed = fixture_peer().parse().unwrap();
        assert_eq!(parsed.key.to_base64(), fixture_pubkey());
        assert_eq!(parsed.ipv4.to_string(), "10.99.0.1/32");
        assert_eq!(parsed.allowed_ips().len(), 2);
    }

    #[test]
    fn test_parse_rejects_bad_pubkey() {
        let mut peer = fixture_peer();
        peer.pubkey = "not base64!!".into();
        assert!(matches!(peer.parse(), Err(PeerParseError::Pubkey(_))));

        // Valid base64 but wrong length
        peer.pubkey = BASE64_STANDARD.encode([b'a'; 31]);
        assert!(matches!(peer.parse(), Err(PeerParseError::Pubkey(_))));
    }

    #[test]
    fn test_parse_rejects_bad_addresses() {
        let mut peer = fixture_peer();
        peer.ipv6 = "garbage".into();
        assert!(matches!(peer.parse(), Err(PeerParseError::Ipv6(_))));

        let mut peer = fixture_peer();
        peer.ipv4 = "fc00::1/128".into();
        assert!(matches!(peer.parse(), Err(PeerParseError::Ipv4(_))));
    }

    #[test]
    fn test_peer_key_roundtrip() {
        let key = PeerKey::from_base64(&fixture_pubkey()).unwrap();
        assert_eq!(key.as_raw(), [b'a'; 32]);
        assert_eq!(PeerKey::from_raw([b'a'; 32]), key);
        assert_eq!(key.to_string(), fixture_pubkey());
    }
}
