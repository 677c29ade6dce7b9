//! Kernel seam for the wireguard engine
//!
//! The engine talks to devices through [`WgBackend`] so that reconciliation
//! logic can be exercised against an in-memory device in tests. The only
//! production implementation drives the kernel over netlink.

use std::time::SystemTime;

use ipnet::IpNet;
use wireguard_control::{AllowedIp, Backend, Device, DeviceUpdate, InterfaceName, Key, PeerConfigBuilder};

use crate::api::peer::{PeerKey, PresharedKey};
use crate::error::WireguardError;

/// A peer as observed on a wireguard device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePeer {
    pub public_key: PeerKey,
    pub allowed_ips: Vec<IpNet>,
    /// Wall-clock time of the last handshake, if any ever happened
    pub last_handshake: Option<SystemTime>,
    pub preshared_key: Option<PresharedKey>,
}

/// One entry of a peer-config batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerUpdate {
    /// Add the peer, or update it with replace-allowed-ips semantics
    Apply {
        public_key: PeerKey,
        allowed_ips: Vec<IpNet>,
        preshared_key: Option<PresharedKey>,
    },
    /// Remove the peer
    Remove { public_key: PeerKey },
}

/// Access to wireguard devices
///
/// All calls are blocking kernel transactions; the supervisor serializes
/// them, so implementations carry no locking of their own.
pub trait WgBackend: Send + Sync {
    /// Snapshot the peers currently configured on an interface
    ///
    /// # Errors
    ///
    /// Returns `WireguardError::InterfaceProbe` when the device cannot be
    /// queried (missing interface, netlink failure).
    fn device_peers(&self, interface: &str) -> Result<Vec<DevicePeer>, WireguardError>;

    /// Submit one peer-config batch to an interface
    ///
    /// # Errors
    ///
    /// Returns `WireguardError::Configure` when the kernel rejects the batch.
    /// A partial failure leaves the device in an intermediate state; the next
    /// periodic synchronization re-converges it.
    fn apply(&self, interface: &str, updates: &[PeerUpdate]) -> Result<(), WireguardError>;
}

/// Netlink-backed device access
#[derive(Debug, Default, Clone, Copy)]
pub struct NetlinkBackend;

impl NetlinkBackend {
    fn interface(name: &str) -> Result<InterfaceName, WireguardError> {
        name.parse()
            .map_err(|e| WireguardError::InvalidInterface {
                name: name.to_string(),
                reason: format!("{e:?}"),
            })
    }
}

impl WgBackend for NetlinkBackend {
    fn device_peers(&self, interface: &str) -> Result<Vec<DevicePeer>, WireguardError> {
        let iface = Self::interface(interface)?;
        let device =
            Device::get(&iface, Backend::Kernel).map_err(|e| WireguardError::probe(interface, e))?;

        let mut peers = Vec::with_capacity(device.peers.len());
        for info in &device.peers {
            let Ok(raw) = <[u8; 32]>::try_from(info.config.public_key.as_bytes()) else {
                continue;
            };
            let preshared_key = info
                .config
                .preshared_key
                .as_ref()
                .and_then(|key| <[u8; 32]>::try_from(key.as_bytes()).ok())
                .map(PresharedKey::from_raw);
            let allowed_ips = info
                .config
                .allowed_ips
                .iter()
                .filter_map(|ip| IpNet::new(ip.address, ip.cidr).ok())
                .collect();

            peers.push(DevicePeer {
                public_key: PeerKey::from_raw(raw),
                allowed_ips,
                last_handshake: info.stats.last_handshake_time,
                preshared_key,
            });
        }

        Ok(peers)
    }

    fn apply(&self, interface: &str, updates: &[PeerUpdate]) -> Result<(), WireguardError> {
        let iface = Self::interface(interface)?;

        let mut device_update = DeviceUpdate::new();
        for update in updates {
            device_update = match update {
                PeerUpdate::Apply {
                    public_key,
                    allowed_ips,
                    preshared_key,
                } => {
                    let ips: Vec<AllowedIp> = allowed_ips
                        .iter()
                        .map(|net| AllowedIp {
                            address: net.addr(),
                            cidr: net.prefix_len(),
                        })
                        .collect();
                    let mut builder = PeerConfigBuilder::new(&Key(public_key.as_raw()))
                        .replace_allowed_ips()
                        .add_allowed_ips(&ips);
                    if let Some(psk) = preshared_key {
                        builder = builder.set_preshared_key(Key(psk.as_raw()));
                    }
                    device_update.add_peer(builder)
                }
                PeerUpdate::Remove { public_key } => {
                    device_update.remove_peer_by_key(&Key(public_key.as_raw()))
                }
            };
        }

        device_update
            .apply(&iface, Backend::Kernel)
            .map_err(|e| WireguardError::configure(interface, e))
    }
}
