//! Kernel-backed integration tests
//!
//! These talk to real wireguard devices over netlink and therefore need a
//! provisioned host: a wireguard interface named `wg0` and CAP_NET_ADMIN.
//! They are skipped by default.
//!
//! Run with: cargo test -- --ignored

use base64::prelude::*;

use wg_steward::{WireguardEngine, WireguardPeer};

const TEST_INTERFACE: &str = "wg0";

fn fixture_peer() -> WireguardPeer {
    WireguardPeer {
        ipv4: "10.99.0.1/32".into(),
        ipv6: "fc00:bbbb:bbbb:bb01::1/128".into(),
        ports: vec![1234, 4321],
        cities: vec![],
        pubkey: BASE64_STANDARD.encode([b'a'; 32]),
    }
}

#[test]
#[ignore]
fn test_construction_probes_real_interface() {
    WireguardEngine::new(vec![TEST_INTERFACE.to_string()]).expect("wg0 must exist for this test");
}

#[test]
#[ignore]
fn test_construction_fails_for_missing_interface() {
    assert!(WireguardEngine::new(vec!["nonexistant".to_string()]).is_err());
}

#[test]
#[ignore]
fn test_reconcile_roundtrip_on_real_interface() {
    let engine = WireguardEngine::new(vec![TEST_INTERFACE.to_string()]).unwrap();
    let peer = fixture_peer();

    engine.update_peers(std::slice::from_ref(&peer));
    let (_, count) = engine.count_peers();
    // The fixture peer has no live session; it must not count as connected
    assert_eq!(count, 0);

    // Leave the device the way we found it
    engine.update_peers(&[]);
}
