//! Netfilter seam for the portforwarding engine
//!
//! Mirrors the small slice of iptables/ip6tables and ipset the engine needs:
//! list a chain, insert a rule at position 1, delete a rule, and check that
//! pre-provisioned chains and ipsets exist. The engine never creates them.

use std::process::Command;

use crate::error::PortforwardError;

/// iptables table the engine operates against
pub const TABLE: &str = "nat";

/// Address family a rule or handle belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::V4 => "ipv4",
            Self::V6 => "ipv6",
        }
    }
}

/// Access to the nat table on both address families
pub trait FirewallBackend: Send + Sync {
    /// Whether a chain exists in the nat table
    ///
    /// # Errors
    ///
    /// Returns `PortforwardError::Firewall` if the table cannot be queried.
    fn chain_exists(&self, family: Family, chain: &str) -> Result<bool, PortforwardError>;

    /// List a chain in `-S` format; the first line is the chain header
    ///
    /// # Errors
    ///
    /// Returns `PortforwardError::Firewall` if listing fails.
    fn list(&self, family: Family, chain: &str) -> Result<Vec<String>, PortforwardError>;

    /// Insert a rule at position 1 of a chain
    ///
    /// # Errors
    ///
    /// Returns `PortforwardError::Firewall` if the rule is rejected.
    fn insert(&self, family: Family, chain: &str, rule: &str) -> Result<(), PortforwardError>;

    /// Delete a rule from a chain by its argv representation
    ///
    /// # Errors
    ///
    /// Returns `PortforwardError::Firewall` if the rule does not exist or
    /// deletion fails.
    fn delete(&self, family: Family, chain: &str, rule: &str) -> Result<(), PortforwardError>;

    /// Whether an ipset with the given name exists
    ///
    /// # Errors
    ///
    /// Returns `PortforwardError::Firewall` if ipset cannot be queried.
    fn ipset_exists(&self, name: &str) -> Result<bool, PortforwardError>;
}

/// iptables/ip6tables-backed implementation
pub struct SystemFirewall {
    iptables: iptables::IPTables,
    ip6tables: iptables::IPTables,
}

impl SystemFirewall {
    /// Open handles for both address families
    ///
    /// # Errors
    ///
    /// Returns `PortforwardError::Firewall` if either binary is unusable.
    pub fn new() -> Result<Self, PortforwardError> {
        let iptables = iptables::new(false).map_err(|e| PortforwardError::firewall(e))?;
        let ip6tables = iptables::new(true).map_err(|e| PortforwardError::firewall(e))?;
        Ok(Self {
            iptables,
            ip6tables,
        })
    }

    fn handle(&self, family: Family) -> &iptables::IPTables {
        match family {
            Family::V4 => &self.iptables,
            Family::V6 => &self.ip6tables,
        }
    }
}

impl FirewallBackend for SystemFirewall {
    fn chain_exists(&self, family: Family, chain: &str) -> Result<bool, PortforwardError> {
        self.handle(family)
            .chain_exists(TABLE, chain)
            .map_err(|e| PortforwardError::firewall(e))
    }

    fn list(&self, family: Family, chain: &str) -> Result<Vec<String>, PortforwardError> {
        self.handle(family)
            .list(TABLE, chain)
            .map_err(|e| PortforwardError::firewall(e))
    }

    fn insert(&self, family: Family, chain: &str, rule: &str) -> Result<(), PortforwardError> {
        self.handle(family)
            .insert(TABLE, chain, rule, 1)
            .map_err(|e| PortforwardError::firewall(e))
    }

    fn delete(&self, family: Family, chain: &str, rule: &str) -> Result<(), PortforwardError> {
        self.handle(family)
            .delete(TABLE, chain, rule)
            .map_err(|e| PortforwardError::firewall(e))
    }

    fn ipset_exists(&self, name: &str) -> Result<bool, PortforwardError> {
        let output = Command::new("ipset")
            .args(["list", "-n"])
            .output()
            .map_err(|e| PortforwardError::firewall(e))?;
        if !output.status.success() {
            return Err(PortforwardError::Firewall(format!(
                "ipset list failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let names = String::from_utf8_lossy(&output.stdout);
        Ok(names.lines().any(|line| line.trim() == name))
    }
}
