//! WireGuard peer reconciliation engine
//!
//! Diffs the authorized peer set from the inventory against the live device
//! state on one or more interfaces and submits minimal peer-config batches.
//! Also implements the periodic handshake reset and connected-peer counting.
//!
//! Per-interface failures are logged and swallowed so that one broken
//! interface never blocks reconciliation of its siblings; only construction
//! errors propagate.

pub mod backend;

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, SystemTime};

use ipnet::IpNet;
use tracing::{debug, warn};

use crate::api::peer::{ConnectedKeys, PeerKey, WireguardPeer};
use crate::error::WireguardError;

pub use backend::{DevicePeer, NetlinkBackend, PeerUpdate, WgBackend};

/// Wireguard sends a handshake roughly every 2 minutes, so peers with a
/// handshake within that interval are counted as connected.
pub const HANDSHAKE_INTERVAL: Duration = Duration::from_secs(2 * 60);

/// How long since the last handshake a key keeps being reported as connected
pub const CONNECTED_INTERVAL: Duration = Duration::from_secs(3 * 60);

/// A wireguard session can't last longer than this without a new handshake;
/// peers idle past it are reset to zero out stale counters.
pub const INACTIVITY_TIME: Duration = Duration::from_secs(3 * 60);

/// Peer reconciliation over a fixed set of wireguard interfaces
pub struct WireguardEngine {
    backend: Box<dyn WgBackend>,
    interfaces: Vec<String>,
}

impl WireguardEngine {
    /// Open the kernel backend and verify every configured interface exists
    ///
    /// # Errors
    ///
    /// Returns an error if the list is empty or any interface probe fails.
    /// Operators must provision interfaces before launch.
    pub fn new(interfaces: Vec<String>) -> Result<Self, WireguardError> {
        Self::with_backend(Box::new(NetlinkBackend), interfaces)
    }

    /// Same as [`WireguardEngine::new`] over an explicit backend
    ///
    /// # Errors
    ///
    /// Returns an error if the list is empty or any interface probe fails.
    pub fn with_backend(
        backend: Box<dyn WgBackend>,
        interfaces: Vec<String>,
    ) -> Result<Self, WireguardError> {
        if interfaces.is_empty() {
            return Err(WireguardError::NoInterfaces);
        }
        for interface in &interfaces {
            backend.device_peers(interface)?;
        }
        Ok(Self {
            backend,
            interfaces,
        })
    }

    /// The interfaces this engine manages
    #[must_use]
    pub fn interfaces(&self) -> &[String] {
        &self.interfaces
    }

    /// Update every managed interface to match the given peer list
    ///
    /// Unparseable peers are dropped. For each interface the diff is computed
    /// against a fresh snapshot and submitted as a single batch; an empty
    /// diff skips the kernel call entirely.
    pub fn update_peers(&self, peers: &[WireguardPeer]) {
        let desired = desired_peers(peers);

        for interface in &self.interfaces {
            let snapshot = match self.backend.device_peers(interface) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(%interface, error = %e, "error connecting to wireguard interface");
                    continue;
                }
            };
            let existing: HashMap<PeerKey, &DevicePeer> =
                snapshot.iter().map(|peer| (peer.public_key, peer)).collect();

            let mut batch = Vec::new();

            // Add peers missing from the device, update peers whose
            // allowed-IP set changed
            for (key, allowed_ips) in &desired {
                let unchanged = existing
                    .get(key)
                    .is_some_and(|peer| same_allowed_ips(&peer.allowed_ips, allowed_ips));
                if !unchanged {
                    batch.push(PeerUpdate::Apply {
                        public_key: *key,
                        allowed_ips: allowed_ips.clone(),
                        preshared_key: None,
                    });
                }
            }

            // Remove peers no longer present in the inventory
            for key in existing.keys() {
                if !desired.contains_key(key) {
                    batch.push(PeerUpdate::Remove { public_key: *key });
                }
            }

            if batch.is_empty() {
                continue;
            }

            debug!(%interface, mutations = batch.len(), "applying peer batch");
            if let Err(e) = self.backend.apply(interface, &batch) {
                warn!(%interface, error = %e, "error configuring wireguard interface");
            }
        }
    }

    /// Reset peers whose session has definitely ended
    ///
    /// A peer that once had a handshake but has been idle past
    /// [`INACTIVITY_TIME`] still carries stale handshake and transfer
    /// counters. Removing and immediately re-adding it zeroes them. The
    /// removal and re-insertion are two sequential batches per interface; if
    /// the second fails the interface is left without those peers until the
    /// next synchronization restores them from the inventory.
    pub fn reset_peers(&self) {
        let now = SystemTime::now();

        for interface in &self.interfaces {
            let snapshot = match self.backend.device_peers(interface) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(%interface, error = %e, "error connecting to wireguard interface");
                    continue;
                }
            };

            let stale: Vec<&DevicePeer> = snapshot
                .iter()
                .filter(|peer| needs_reset(peer, now))
                .collect();
            if stale.is_empty() {
                continue;
            }

            let removals: Vec<PeerUpdate> = stale
                .iter()
                .map(|peer| PeerUpdate::Remove {
                    public_key: peer.public_key,
                })
                .collect();
            // The preshared key is copied by value out of the snapshot; the
            // re-insert must not alias memory the removal may invalidate.
            let reinserts: Vec<PeerUpdate> = stale
                .iter()
                .map(|peer| PeerUpdate::Apply {
                    public_key: peer.public_key,
                    allowed_ips: peer.allowed_ips.clone(),
                    preshared_key: peer.preshared_key,
                })
                .collect();

            if let Err(e) = self.backend.apply(interface, &removals) {
                warn!(%interface, error = %e, "error configuring wireguard interface");
                continue;
            }
            if let Err(e) = self.backend.apply(interface, &reinserts) {
                warn!(%interface, error = %e, "error configuring wireguard interface");
                continue;
            }

            debug!(%interface, peers = stale.len(), "reset idle peers");
        }
    }

    /// Count connected peers across all managed interfaces
    ///
    /// Returns the connected-key map (base64 pubkey → number of interfaces
    /// the key was seen connected on within [`CONNECTED_INTERVAL`]) and the
    /// total count of peers with a handshake within [`HANDSHAKE_INTERVAL`].
    #[must_use]
    pub fn count_peers(&self) -> (ConnectedKeys, usize) {
        let now = SystemTime::now();
        let mut connected_keys = ConnectedKeys::new();
        let mut peer_count = 0;

        for interface in &self.interfaces {
            let snapshot = match self.backend.device_peers(interface) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(%interface, error = %e, "error connecting to wireguard interface");
                    continue;
                }
            };

            for peer in &snapshot {
                let Some(handshake) = peer.last_handshake else {
                    continue;
                };
                // A handshake in the future (clock steps) counts as fresh
                let age = now.duration_since(handshake).unwrap_or_default();
                if age <= HANDSHAKE_INTERVAL {
                    peer_count += 1;
                }
                if age <= CONNECTED_INTERVAL {
                    *connected_keys
                        .entry(peer.public_key.to_base64())
                        .or_insert(0) += 1;
                }
            }
        }

        (connected_keys, peer_count)
    }

    /// Add a single peer to every managed interface without checking the
    /// existing configuration
    pub fn add_peer(&self, peer: &WireguardPeer) {
        let Ok(parsed) = peer.parse() else {
            return;
        };
        let update = [PeerUpdate::Apply {
            public_key: parsed.key,
            allowed_ips: parsed.allowed_ips(),
            preshared_key: None,
        }];

        for interface in &self.interfaces {
            if let Err(e) = self.backend.apply(interface, &update) {
                warn!(%interface, error = %e, "error configuring wireguard interface");
            }
        }
    }

    /// Remove a single peer from every managed interface without checking
    /// the existing configuration
    pub fn remove_peer(&self, peer: &WireguardPeer) {
        let Ok(parsed) = peer.parse() else {
            return;
        };
        let update = [PeerUpdate::Remove {
            public_key: parsed.key,
        }];

        for interface in &self.interfaces {
            if let Err(e) = self.backend.apply(interface, &update) {
                warn!(%interface, error = %e, "error configuring wireguard interface");
            }
        }
    }
}

/// Convert the inventory peers into a map for comparison, dropping records
/// that fail to parse. Duplicate pubkeys: the later record wins.
fn desired_peers(peers: &[WireguardPeer]) -> HashMap<PeerKey, Vec<IpNet>> {
    let mut desired = HashMap::with_capacity(peers.len());
    for peer in peers {
        let Ok(parsed) = peer.parse() else {
            continue;
        };
        desired.insert(parsed.key, parsed.allowed_ips());
    }
    desired
}

/// Allowed-IP sets are equal regardless of ordering
fn same_allowed_ips(a: &[IpNet], b: &[IpNet]) -> bool {
    a.len() == b.len() && a.iter().collect::<BTreeSet<_>>() == b.iter().collect::<BTreeSet<_>>()
}

fn needs_reset(peer: &DevicePeer, now: SystemTime) -> bool {
    peer.last_handshake
        .is_some_and(|t| now.duration_since(t).is_ok_and(|age| age > INACTIVITY_TIME))
}
