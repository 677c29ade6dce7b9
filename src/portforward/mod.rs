//! Portforwarding (DNAT) reconciliation engine
//!
//! Translates the authorized peer set into iptables DNAT rules in a fixed
//! pair of pre-provisioned chains (one per transport protocol, on both
//! address families) and diffs them against the live rules. Rules are
//! compared by their canonical single-line string form.
//!
//! The engine is a tenant of provisioned infrastructure: missing chains or
//! ipsets are construction errors, never created here.

pub mod backend;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::LazyLock;

use ipnet::{Ipv4Net, Ipv6Net};
use regex::Regex;
use tracing::{debug, warn};

use crate::api::peer::WireguardPeer;
use crate::error::PortforwardError;

pub use backend::{Family, FirewallBackend, SystemFirewall, TABLE};

/// Transport protocols the managed chains cover
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }

    const fn chain_suffix(self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
        }
    }
}

const TRANSPORTS: [Transport; 2] = [Transport::Tcp, Transport::Udp];

/// A managed chain: its name and the transport its rules match
#[derive(Debug, Clone)]
pub struct Chain {
    name: String,
    transport: Transport,
}

impl Chain {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

static HOSTNAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-z]+-[a-z]+)-[0-9]{3}\.mullvad\.net$").expect("hostname pattern is valid")
});

/// Derive the `<country>-<city>` location from a relay hostname
///
/// # Errors
///
/// Returns `PortforwardError::InvalidHostname` when the hostname is not of
/// the form `<country>-<city>-NNN.mullvad.net`.
pub fn location_from_hostname(hostname: &str) -> Result<String, PortforwardError> {
    HOSTNAME_PATTERN
        .captures(hostname)
        .and_then(|captures| captures.get(1))
        .map(|location| location.as_str().to_string())
        .ok_or_else(|| PortforwardError::InvalidHostname(hostname.to_string()))
}

/// DNAT rule reconciliation over the fixed chain set
pub struct PortforwardEngine {
    firewall: Box<dyn FirewallBackend>,
    chains: Vec<Chain>,
    ipset_v4: String,
    ipset_v6: String,
    location: String,
}

impl PortforwardEngine {
    /// Open netfilter handles and verify the pre-provisioned chains and
    /// ipsets exist on both families
    ///
    /// # Errors
    ///
    /// Any missing chain or ipset, or a hostname not matching
    /// `<country>-<city>-NNN.mullvad.net`, is fatal.
    pub fn new(
        chain_prefix: &str,
        ipset_v4: &str,
        ipset_v6: &str,
        hostname: &str,
    ) -> Result<Self, PortforwardError> {
        Self::with_backend(
            Box::new(SystemFirewall::new()?),
            chain_prefix,
            ipset_v4,
            ipset_v6,
            hostname,
        )
    }

    /// Same as [`PortforwardEngine::new`] over an explicit backend
    ///
    /// # Errors
    ///
    /// Same preconditions as [`PortforwardEngine::new`].
    pub fn with_backend(
        firewall: Box<dyn FirewallBackend>,
        chain_prefix: &str,
        ipset_v4: &str,
        ipset_v6: &str,
        hostname: &str,
    ) -> Result<Self, PortforwardError> {
        let chains: Vec<Chain> = TRANSPORTS
            .iter()
            .map(|&transport| Chain {
                name: format!("{chain_prefix}_{}", transport.chain_suffix()),
                transport,
            })
            .collect();

        for chain in &chains {
            for family in [Family::V4, Family::V6] {
                if !firewall.chain_exists(family, &chain.name)? {
                    return Err(PortforwardError::MissingChain {
                        chain: chain.name.clone(),
                        family: family.as_str(),
                    });
                }
            }
        }

        for ipset in [ipset_v4, ipset_v6] {
            if !firewall.ipset_exists(ipset)? {
                return Err(PortforwardError::MissingIpset(ipset.to_string()));
            }
        }

        let location = location_from_hostname(hostname)?;

        Ok(Self {
            firewall,
            chains,
            ipset_v4: ipset_v4.to_string(),
            ipset_v6: ipset_v6.to_string(),
            location,
        })
    }

    /// The `<country>-<city>` location derived from the relay hostname
    #[must_use]
    pub fn location(&self) -> &str {
        &self.location
    }

    /// The managed chains
    #[must_use]
    pub fn chains(&self) -> &[Chain] {
        &self.chains
    }

    /// Update the chains to match the portforwarding of the given peers
    ///
    /// Peers with an empty port list contribute no rules. Inserts and
    /// deletes are independent; individual failures are logged and the next
    /// periodic run reconciles.
    pub fn update_portforwarding(&self, peers: &[WireguardPeer]) {
        for chain in &self.chains {
            let mut desired: HashMap<String, Family> = HashMap::new();
            for peer in peers {
                if peer.ports.is_empty() {
                    continue;
                }
                let Some(rules) = self.peer_rules(peer, chain.transport) else {
                    continue;
                };
                for (rule, family) in rules {
                    desired.insert(rule, family);
                }
            }

            let existing = match self.current_rules(&chain.name) {
                Ok(existing) => existing,
                Err(e) => {
                    warn!(error = %e, "error getting current iptables rules");
                    return;
                }
            };

            for (rule, family) in &desired {
                if !existing.contains_key(rule) {
                    if let Err(e) = self.firewall.insert(*family, &chain.name, rule) {
                        warn!(chain = %chain.name, error = %e, "error adding iptables rule");
                        continue;
                    }
                }
            }

            for (rule, family) in &existing {
                if !desired.contains_key(rule) {
                    if let Err(e) = self.firewall.delete(*family, &chain.name, rule) {
                        warn!(chain = %chain.name, error = %e, "error deleting iptables rule");
                        continue;
                    }
                }
            }
        }
    }

    /// Event-driven refresh of one peer's rules
    ///
    /// Inserts the peer's current rules without checking for duplicates (the
    /// fast path prizes latency; the periodic sync dedupes), then sweeps
    /// rules still pointing at the peer's address with a stale port set.
    pub fn update_single_peer(&self, peer: &WireguardPeer) {
        if peer.ports.is_empty() {
            return;
        }

        for chain in &self.chains {
            let Some(rules) = self.peer_rules(peer, chain.transport) else {
                continue;
            };
            let existing = match self.current_rules(&chain.name) {
                Ok(existing) => existing,
                Err(e) => {
                    warn!(error = %e, "error getting current iptables rules");
                    return;
                }
            };

            for (rule, family) in &rules {
                if let Err(e) = self.firewall.insert(*family, &chain.name, rule) {
                    warn!(chain = %chain.name, error = %e, "error adding iptables rule");
                    continue;
                }
                self.remove_stale_peer_rules(peer, *family, &chain.name, &existing, rule);
            }
        }
    }

    /// Insert a peer's rules without checking existing ones
    pub fn add_portforwarding(&self, peer: &WireguardPeer) {
        if peer.ports.is_empty() {
            return;
        }

        for chain in &self.chains {
            let Some(rules) = self.peer_rules(peer, chain.transport) else {
                continue;
            };
            for (rule, family) in &rules {
                if let Err(e) = self.firewall.insert(*family, &chain.name, rule) {
                    warn!(chain = %chain.name, error = %e, "error adding iptables rule");
                }
            }
        }
    }

    /// Delete a peer's rules without checking existing ones
    pub fn remove_portforwarding(&self, peer: &WireguardPeer) {
        if peer.ports.is_empty() {
            return;
        }

        for chain in &self.chains {
            let Some(rules) = self.peer_rules(peer, chain.transport) else {
                continue;
            };
            for (rule, family) in &rules {
                if let Err(e) = self.firewall.delete(*family, &chain.name, rule) {
                    warn!(chain = %chain.name, error = %e, "error deleting iptables rule");
                    continue;
                }
            }
        }
    }

    /// The canonical v4 and v6 rules for a peer on one transport, or `None`
    /// when either address fails to parse: the peer is then skipped for both
    /// families, in case we get bad data from the API.
    fn peer_rules(
        &self,
        peer: &WireguardPeer,
        transport: Transport,
    ) -> Option<[(String, Family); 2]> {
        let ipv4 = peer.ipv4.parse::<Ipv4Net>().ok()?;
        let ipv6 = peer.ipv6.parse::<Ipv6Net>().ok()?;
        let ports = ports_csv(&peer.ports);

        let v4 = format!(
            "-p {} -m set --match-set {} dst -m multiport --dports {} -j DNAT --to-destination {}",
            transport.as_str(),
            self.ipset_v4,
            ports,
            ipv4.addr()
        );
        let v6 = format!(
            "-p {} -m set --match-set {} dst -m multiport --dports {} -j DNAT --to-destination {}",
            transport.as_str(),
            self.ipset_v6,
            ports,
            ipv6.addr()
        );

        Some([(v4, Family::V4), (v6, Family::V6)])
    }

    /// Snapshot a chain on both families, normalized to the canonical form:
    /// the chain header line is dropped, the `-A <chain> ` prefix and the
    /// `/32` and `/128` masks are stripped.
    fn current_rules(&self, chain: &str) -> Result<HashMap<String, Family>, PortforwardError> {
        let mut rules = HashMap::new();
        let prefix = format!("-A {chain} ");

        for family in [Family::V4, Family::V6] {
            let listed = self.firewall.list(family, chain)?;
            for line in listed.into_iter().skip(1) {
                let rule = line
                    .strip_prefix(&prefix)
                    .unwrap_or(&line)
                    .replace("/32", "")
                    .replace("/128", "");
                rules.insert(rule, family);
            }
        }

        Ok(rules)
    }

    /// Delete rules that still point at the peer's address on this family
    /// but differ from the freshly inserted rule
    fn remove_stale_peer_rules(
        &self,
        peer: &WireguardPeer,
        family: Family,
        chain: &str,
        existing: &HashMap<String, Family>,
        fresh: &str,
    ) {
        let peer_ip: Option<IpAddr> = match family {
            Family::V4 => peer
                .ipv4
                .parse::<Ipv4Net>()
                .ok()
                .map(|net| IpAddr::V4(net.addr())),
            Family::V6 => peer
                .ipv6
                .parse::<Ipv6Net>()
                .ok()
                .map(|net| IpAddr::V6(net.addr())),
        };
        let Some(peer_ip) = peer_ip else {
            return;
        };

        for (old_rule, old_family) in existing {
            if *old_family != family || old_rule == fresh {
                continue;
            }
            // The DNAT destination is the last token of the canonical form
            let Some(destination) = old_rule.split_whitespace().last() else {
                continue;
            };
            if destination.parse::<IpAddr>().is_ok_and(|ip| ip == peer_ip) {
                debug!(chain, rule = %old_rule, "sweeping stale portforwarding rule");
                if let Err(e) = self.firewall.delete(family, chain, old_rule) {
                    warn!(chain, error = %e, "error deleting iptables rule");
                }
            }
        }
    }
}

/// Ports sorted ascending and comma-joined, the `--dports` canonical form
fn ports_csv(ports: &[u16]) -> String {
    let mut ports = ports.to_vec();
    ports.sort_unstable();
    ports
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::backend::mock::{FirewallOp, MockFirewall};
    use super::*;
    use base64::prelude::*;

    const TCP_CHAIN: &str = "PORTFORWARDING_TCP";
    const UDP_CHAIN: &str = "PORTFORWARDING_UDP";

    fn peer(last_octet: u8, ports: Vec<u16>) -> WireguardPeer {
        WireguardPeer {
            ipv4: format!("10.99.0.{last_octet}/32"),
            ipv6: format!("fc00:bbbb:bbbb:bb01::{last_octet:x}/128"),
            ports,
            cities: vec![],
            pubkey: BASE64_STANDARD.encode([last_octet; 32]),
        }
    }

    fn engine(firewall: MockFirewall) -> (PortforwardEngine, MockFirewall) {
        let engine = PortforwardEngine::with_backend(
            Box::new(firewall.clone()),
            "PORTFORWARDING",
            "PORTFORWARDING_IPV4",
            "PORTFORWARDING_IPV6",
            "se-mma-001.mullvad.net",
        )
        .unwrap();
        (engine, firewall)
    }

    #[test]
    fn test_construction_requires_chains() {
        let firewall = MockFirewall::provisioned();
        let result = PortforwardEngine::with_backend(
            Box::new(firewall),
            "MISSING",
            "PORTFORWARDING_IPV4",
            "PORTFORWARDING_IPV6",
            "se-mma-001.mullvad.net",
        );
        assert!(matches!(result, Err(PortforwardError::MissingChain { .. })));
    }

    #[test]
    fn test_construction_requires_ipsets() {
        let firewall = MockFirewall::provisioned();
        firewall.remove_ipset("PORTFORWARDING_IPV6");
        let result = PortforwardEngine::with_backend(
            Box::new(firewall),
            "PORTFORWARDING",
            "PORTFORWARDING_IPV4",
            "PORTFORWARDING_IPV6",
            "se-mma-001.mullvad.net",
        );
        assert!(matches!(result, Err(PortforwardError::MissingIpset(_))));
    }

    #[test]
    fn test_location_from_hostname() {
        assert_eq!(
            location_from_hostname("se-mma-001.mullvad.net").unwrap(),
            "se-mma"
        );
        assert!(location_from_hostname("bad").is_err());
        assert!(location_from_hostname("se-mma-01.mullvad.net").is_err());
        assert!(location_from_hostname("se-mma-001.mullvadXnet").is_err());
    }

    #[test]
    fn test_engine_exposes_location() {
        let (engine, _) = engine(MockFirewall::provisioned());
        assert_eq!(engine.location(), "se-mma");
    }

    #[test]
    fn test_add_one_peer_inserts_four_rules() {
        let (engine, firewall) = engine(MockFirewall::provisioned());

        engine.update_portforwarding(&[peer(1, vec![4321, 1234])]);

        assert_eq!(
            firewall.rules(Family::V4, TCP_CHAIN),
            vec![
                "-p tcp -m set --match-set PORTFORWARDING_IPV4 dst -m multiport \
                 --dports 1234,4321 -j DNAT --to-destination 10.99.0.1"
            ]
        );
        assert_eq!(
            firewall.rules(Family::V6, TCP_CHAIN),
            vec![
                "-p tcp -m set --match-set PORTFORWARDING_IPV6 dst -m multiport \
                 --dports 1234,4321 -j DNAT --to-destination fc00:bbbb:bbbb:bb01::1"
            ]
        );
        assert_eq!(firewall.rules(Family::V4, UDP_CHAIN).len(), 1);
        assert_eq!(firewall.rules(Family::V6, UDP_CHAIN).len(), 1);
        assert!(firewall.rules(Family::V4, UDP_CHAIN)[0].starts_with("-p udp "));
    }

    #[test]
    fn test_ports_are_sorted_in_rule() {
        assert_eq!(ports_csv(&[4321, 80, 1234]), "80,1234,4321");
        assert_eq!(ports_csv(&[1234, 4321]), ports_csv(&[4321, 1234]));
    }

    #[test]
    fn test_second_sync_is_idempotent() {
        let (engine, firewall) = engine(MockFirewall::provisioned());
        let peers = vec![peer(1, vec![1234, 4321])];

        engine.update_portforwarding(&peers);
        firewall.clear_ops();

        engine.update_portforwarding(&peers);
        assert!(
            firewall.ops().is_empty(),
            "no-op sync must not touch the firewall"
        );
    }

    #[test]
    fn test_changed_ip_replaces_rules() {
        let (engine, firewall) = engine(MockFirewall::provisioned());
        engine.update_portforwarding(&[peer(1, vec![1234])]);
        firewall.clear_ops();

        let mut moved = peer(1, vec![1234]);
        moved.ipv4 = "10.99.0.2/32".into();
        moved.ipv6 = "fc00:bbbb:bbbb:bb01::2/128".into();
        engine.update_portforwarding(std::slice::from_ref(&moved));

        // Per chain: two inserts and two deletes
        let ops = firewall.ops();
        let inserts = ops
            .iter()
            .filter(|op| matches!(op, FirewallOp::Insert { .. }))
            .count();
        let deletes = ops
            .iter()
            .filter(|op| matches!(op, FirewallOp::Delete { .. }))
            .count();
        assert_eq!(inserts, 4);
        assert_eq!(deletes, 4);
        assert!(firewall.rules(Family::V4, TCP_CHAIN)[0].ends_with("10.99.0.2"));
    }

    #[test]
    fn test_remove_all_peers_empties_chains() {
        let (engine, firewall) = engine(MockFirewall::provisioned());
        engine.update_portforwarding(&[peer(1, vec![1234, 4321])]);

        engine.update_portforwarding(&[]);

        for chain in [TCP_CHAIN, UDP_CHAIN] {
            for family in [Family::V4, Family::V6] {
                assert!(firewall.rules(family, chain).is_empty());
            }
        }
    }

    #[test]
    fn test_peer_without_ports_produces_no_rules() {
        let (engine, firewall) = engine(MockFirewall::provisioned());
        let silent = peer(1, vec![]);

        engine.update_portforwarding(std::slice::from_ref(&silent));
        engine.add_portforwarding(&silent);
        engine.remove_portforwarding(&silent);
        engine.update_single_peer(&silent);

        assert!(firewall.ops().is_empty());
    }

    #[test]
    fn test_unparseable_peer_skipped_for_both_families() {
        let (engine, firewall) = engine(MockFirewall::provisioned());
        let mut bad = peer(1, vec![1234]);
        bad.ipv6 = "garbage".into();

        engine.update_portforwarding(&[bad]);

        assert!(firewall.ops().is_empty(), "the v4 rule must not be emitted either");
    }

    #[test]
    fn test_add_portforwarding_skips_snapshot() {
        let (engine, firewall) = engine(MockFirewall::provisioned());

        engine.add_portforwarding(&peer(1, vec![1234]));
        engine.add_portforwarding(&peer(1, vec![1234]));

        // No existence checking on the fast path: duplicates accumulate
        assert_eq!(firewall.rules(Family::V4, TCP_CHAIN).len(), 2);
    }

    #[test]
    fn test_remove_portforwarding_deletes_rules() {
        let (engine, firewall) = engine(MockFirewall::provisioned());
        let p = peer(1, vec![1234]);
        engine.add_portforwarding(&p);

        engine.remove_portforwarding(&p);

        for chain in [TCP_CHAIN, UDP_CHAIN] {
            for family in [Family::V4, Family::V6] {
                assert!(firewall.rules(family, chain).is_empty());
            }
        }
    }

    #[test]
    fn test_update_single_peer_sweeps_stale_rules() {
        let (engine, firewall) = engine(MockFirewall::provisioned());
        let other = peer(2, vec![9999]);
        engine.update_portforwarding(&[peer(1, vec![1234]), other.clone()]);
        firewall.clear_ops();

        engine.update_single_peer(&peer(1, vec![5678]));

        for chain in [TCP_CHAIN, UDP_CHAIN] {
            for family in [Family::V4, Family::V6] {
                let rules = firewall.rules(family, chain);
                assert_eq!(rules.len(), 2, "peer rule replaced, other peer intact");
                assert!(rules.iter().any(|r| r.contains("--dports 5678")));
                assert!(rules.iter().any(|r| r.contains("--dports 9999")));
                assert!(!rules.iter().any(|r| r.contains("--dports 1234")));
            }
        }
    }

    #[test]
    fn test_update_single_peer_leaves_identical_rule_untouched() {
        let (engine, firewall) = engine(MockFirewall::provisioned());
        let p = peer(1, vec![1234]);
        engine.update_portforwarding(std::slice::from_ref(&p));
        firewall.clear_ops();

        engine.update_single_peer(&p);

        // The fast path re-inserts without deleting the identical rule
        let deletes = firewall
            .ops()
            .iter()
            .filter(|op| matches!(op, FirewallOp::Delete { .. }))
            .count();
        assert_eq!(deletes, 0);
        assert_eq!(firewall.rules(Family::V4, TCP_CHAIN).len(), 2);
    }
}
