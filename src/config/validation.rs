//! Configuration validation

use super::{Config, NetworkConfig};
use crate::dataplane::{Cidr, RouteTarget, SNatPool};
use crate::protocol::MacAddr;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn print_diagnostics(&self) {
        for warning in &self.warnings {
            println!("[WARN] {}", warning);
        }
        for error in &self.errors {
            println!("[ERROR] {}", error);
        }
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate configuration and return warnings/errors
pub fn validate(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    validate_switch(config, &mut result);
    let subnets = validate_networks(config, &mut result);
    validate_ports(config, &mut result);
    validate_nat_pools(config, &mut result);
    validate_rules(config, &subnets, &mut result);

    result
}

fn validate_switch(config: &Config, result: &mut ValidationResult) {
    let switch = &config.switch;
    for (name, value) in [
        ("mac_timeout", switch.mac_timeout),
        ("arp_timeout", switch.arp_timeout),
        ("ndp_timeout", switch.ndp_timeout),
    ] {
        match value {
            None => result.warn(format!("switch.{}: not specified, using default", name)),
            Some(0) => result.error(format!("switch.{}: must be greater than zero", name)),
            Some(_) => {}
        }
    }
    if switch.hop_limit == Some(0) {
        result.error("switch.hop_limit: must be greater than zero");
    }
}

/// Parsed subnets of a network
struct Subnets {
    v4: Cidr,
    v6: Option<Cidr>,
}

impl Subnets {
    fn contains(&self, ip: &std::net::IpAddr) -> bool {
        self.v4.contains(ip) || self.v6.is_some_and(|c| c.contains(ip))
    }
}

fn validate_networks(config: &Config, result: &mut ValidationResult) -> HashMap<u32, Subnets> {
    let mut subnets = HashMap::new();

    for net in &config.networks {
        if subnets.contains_key(&net.vni) {
            result.error(format!("networks.{}: duplicate vni", net.vni));
            continue;
        }
        let v4 = match net.v4_cidr() {
            Ok(c) => c,
            Err(e) => {
                result.error(format!("networks.{}: bad v4 cidr: {}", net.vni, e));
                continue;
            }
        };
        let v6 = match net.v6_cidr() {
            Ok(c) => c,
            Err(e) => {
                result.error(format!("networks.{}: bad v6 cidr: {}", net.vni, e));
                None
            }
        };
        subnets.insert(net.vni, Subnets { v4, v6 });
    }

    for net in &config.networks {
        let Some(own) = subnets.get(&net.vni) else {
            continue;
        };
        validate_bindings(net, own, result);
        validate_routes(net, own, &subnets, result);
    }
    subnets
}

fn validate_bindings(net: &NetworkConfig, own: &Subnets, result: &mut ValidationResult) {
    let mut seen = HashSet::new();
    for binding in &net.ips {
        if !seen.insert(binding.ip) {
            result.error(format!("networks.{}: duplicate ip {}", net.vni, binding.ip));
        }
        if !own.contains(&binding.ip) {
            result.error(format!(
                "networks.{}: ip {} is outside the network",
                net.vni, binding.ip
            ));
        }
        match binding.mac.parse::<MacAddr>() {
            Ok(mac) if !mac.is_unicast() => result.error(format!(
                "networks.{}: mac {} of {} is not unicast",
                net.vni, mac, binding.ip
            )),
            Ok(_) => {}
            Err(e) => result.error(format!(
                "networks.{}: bad mac for {}: {}",
                net.vni, binding.ip, e
            )),
        }
    }
}

fn validate_routes(
    net: &NetworkConfig,
    own: &Subnets,
    subnets: &HashMap<u32, Subnets>,
    result: &mut ValidationResult,
) {
    let mut aliases = HashSet::new();
    let mut cidrs = HashSet::new();
    for route in &net.routes {
        let rule = match route.to_rule() {
            Ok(rule) => rule,
            Err(e) => {
                result.error(format!("networks.{}: route {}: {}", net.vni, route.alias, e));
                continue;
            }
        };
        if !aliases.insert(rule.alias.clone()) {
            result.error(format!(
                "networks.{}: duplicate route alias {}",
                net.vni, rule.alias
            ));
        }
        if !cidrs.insert(rule.rule) {
            result.error(format!(
                "networks.{}: duplicate route cidr {}",
                net.vni, rule.rule
            ));
        }
        match rule.target {
            RouteTarget::Network(vni) if !subnets.contains_key(&vni) => result.error(format!(
                "networks.{}: route {} targets unknown vni {}",
                net.vni, rule.alias, vni
            )),
            RouteTarget::Gateway(gw) if !own.contains(&gw) => result.error(format!(
                "networks.{}: route {} gateway {} is outside the network",
                net.vni, rule.alias, gw
            )),
            _ => {}
        }
    }
}

fn validate_ports(config: &Config, result: &mut ValidationResult) {
    let vnis: HashSet<u32> = config.networks.iter().map(|n| n.vni).collect();
    let mut names = HashSet::new();
    for port in &config.ports {
        if !names.insert(port.name.as_str()) {
            result.error(format!("ports.{}: duplicate port name", port.name));
        }
        if !vnis.contains(&port.network) {
            result.error(format!(
                "ports.{}: network {} is not defined",
                port.name, port.network
            ));
        }
        match port.mtu {
            None => result.warn(format!(
                "ports.{}: mtu not specified, using default {}",
                port.name,
                port.mtu()
            )),
            Some(mtu) if mtu < 576 => {
                result.error(format!("ports.{}: mtu {} is too small", port.name, mtu))
            }
            Some(_) => {}
        }
    }
}

fn validate_nat_pools(config: &Config, result: &mut ValidationResult) {
    let mut names = HashSet::new();
    for pool in &config.nat_pools {
        if !names.insert(pool.name.as_str()) {
            result.error(format!("nat_pools.{}: duplicate pool name", pool.name));
        }
        if let Err(e) = pool.range.parse::<SNatPool>() {
            result.error(format!("nat_pools.{}: {}", pool.name, e));
        }
    }
}

fn validate_rules(config: &Config, subnets: &HashMap<u32, Subnets>, result: &mut ValidationResult) {
    let ports: HashSet<&str> = config.ports.iter().map(|p| p.name.as_str()).collect();
    for (i, rule) in config.rules.iter().enumerate() {
        if !ports.contains(rule.port.as_str()) {
            result.error(format!("rules[{}]: port {} is not defined", i, rule.port));
        }
        if let Some(to) = &rule.redirect_to {
            if !ports.contains(to.as_str()) {
                result.error(format!("rules[{}]: redirect target {} is not defined", i, to));
            }
        }
        if let Err(e) = rule.to_match_rule() {
            result.error(format!("rules[{}]: {}", i, e));
        }
    }
    if !config.rules.is_empty() && subnets.is_empty() {
        result.warn("rules are defined but no network is configured");
    }
}
