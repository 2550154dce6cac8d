//! Per-network static route table
//!
//! Rules live in an [`AddressTable`], so lookups are longest-prefix-match
//! and listing is most specific first.

use super::address_table::{AddressTable, Cidr};
use crate::{Error, Result};
use std::fmt;
use std::net::IpAddr;
use tracing::debug;

/// Alias of the rule covering the network's own IPv4 subnet
pub const DEFAULT_RULE: &str = "default";
/// Alias of the rule covering the network's own IPv6 subnet
pub const DEFAULT_RULE_V6: &str = "default-v6";

/// Where matching packets go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTarget {
    /// Deliver inside the network with this VNI
    Network(u32),
    /// Forward to a next hop inside this network
    Gateway(IpAddr),
}

impl fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteTarget::Network(vni) => write!(f, "vni {}", vni),
            RouteTarget::Gateway(ip) => write!(f, "via {}", ip),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRule {
    pub alias: String,
    pub rule: Cidr,
    pub target: RouteTarget,
}

impl RouteRule {
    pub fn new(alias: impl Into<String>, rule: Cidr, target: RouteTarget) -> Self {
        Self {
            alias: alias.into(),
            rule,
            target,
        }
    }
}

impl fmt::Display for RouteRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} {}", self.alias, self.rule, self.target)
    }
}

#[derive(Debug)]
pub struct RouteTable {
    rules: AddressTable<RouteRule>,
    default_v4: RouteRule,
    default_v6: Option<RouteRule>,
}

impl RouteTable {
    /// Table with the default rules for the network's own subnets
    pub fn new(vni: u32, v4: Cidr, v6: Option<Cidr>) -> Self {
        let default_v4 = RouteRule::new(DEFAULT_RULE, v4, RouteTarget::Network(vni));
        let default_v6 = v6.map(|c| RouteRule::new(DEFAULT_RULE_V6, c, RouteTarget::Network(vni)));

        let mut rules = AddressTable::new();
        rules.add(default_v4.rule, default_v4.clone());
        if let Some(r) = &default_v6 {
            rules.add(r.rule, r.clone());
        }
        Self {
            rules,
            default_v4,
            default_v6,
        }
    }

    pub fn add_rule(&mut self, rule: RouteRule) -> Result<()> {
        if let Some((_, existing)) = self.rules.iter().find(|(_, r)| r.alias == rule.alias) {
            // re-adding an identical default rule is accepted
            if *existing == rule && self.is_default_rule(&rule) {
                return Ok(());
            }
            return Err(Error::already_exists("route", &rule.alias));
        }
        if let Some(existing) = self.rules.get(&rule.rule) {
            return Err(Error::AlreadyExists {
                kind: "route",
                name: format!("{} (network {} held by {})", rule.alias, rule.rule, existing.alias),
            });
        }
        if self.is_default_alias(&rule.alias) && !self.is_default_rule(&rule) {
            return Err(Error::InvalidArgument(format!(
                "route {} is reserved for the network's own subnet",
                rule.alias
            )));
        }
        if let RouteTarget::Gateway(ip) = rule.target {
            if ip.is_ipv6() && self.default_v6.is_none() {
                return Err(Error::InvalidArgument(
                    "this network does not support ipv6".into(),
                ));
            }
            let inside = self.default_v4.rule.contains(&ip)
                || self.default_v6.as_ref().is_some_and(|r| r.rule.contains(&ip));
            if !inside {
                return Err(Error::InvalidArgument(format!(
                    "gateway {} is outside the network",
                    ip
                )));
            }
        }

        debug!(%rule, "route added");
        self.rules.add(rule.rule, rule);
        Ok(())
    }

    pub fn del_rule(&mut self, alias: &str) -> Result<RouteRule> {
        let removed = self
            .rules
            .remove_by(|_, r| r.alias == alias)
            .ok_or_else(|| Error::not_found("route", alias))?;
        debug!(rule = %removed, "route removed");
        Ok(removed)
    }

    /// Longest-prefix match for a destination address
    pub fn lookup(&self, ip: &IpAddr) -> Option<&RouteRule> {
        self.rules.lookup(ip)
    }

    /// Rules ordered most specific first (IPv4 before IPv6)
    pub fn get_rules(&self) -> Vec<RouteRule> {
        self.rules.iter().map(|(_, r)| r.clone()).collect()
    }

    fn is_default_alias(&self, alias: &str) -> bool {
        alias == DEFAULT_RULE || (alias == DEFAULT_RULE_V6 && self.default_v6.is_some())
    }

    fn is_default_rule(&self, rule: &RouteRule) -> bool {
        *rule == self.default_v4 || self.default_v6.as_ref() == Some(rule)
    }
}
