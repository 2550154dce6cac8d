//! Configuration types

use crate::dataplane::{
    Cidr, FilterResult, MatchRule, MssRewrite, NetworkTimeouts, RouteRule, RouteTarget,
    SwitchSettings, DEFAULT_HOP_LIMIT, DEFAULT_MTU,
};
use crate::protocol::{IpProtocol, MacAddr};
use crate::telemetry::{LogConfig, LogFormat};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// User-defined configuration (config.toml)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub switch: SwitchConfig,
    #[serde(default)]
    pub logging: Option<LogConfig>,
    #[serde(default)]
    pub networks: Vec<NetworkConfig>,
    #[serde(default)]
    pub ports: Vec<PortConfig>,
    #[serde(default)]
    pub nat_pools: Vec<NatPoolConfig>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SwitchConfig {
    /// MAC entry lifetime in seconds
    pub mac_timeout: Option<u64>,
    /// ARP entry lifetime in seconds
    pub arp_timeout: Option<u64>,
    /// NDP entry lifetime in seconds
    pub ndp_timeout: Option<u64>,
    pub hop_limit: Option<u8>,
    pub mss_rewrite: Option<MssRewrite>,
}

impl SwitchConfig {
    pub fn settings(&self) -> SwitchSettings {
        let defaults = NetworkTimeouts::default();
        let secs_or = |v: Option<u64>, d: Duration| v.map_or(d, Duration::from_secs);
        SwitchSettings {
            timeouts: NetworkTimeouts {
                mac: secs_or(self.mac_timeout, defaults.mac),
                arp: secs_or(self.arp_timeout, defaults.arp),
                ndp: secs_or(self.ndp_timeout, defaults.ndp),
            },
            hop_limit: self.hop_limit.unwrap_or(DEFAULT_HOP_LIMIT),
            mss_rewrite: self.mss_rewrite.unwrap_or_default(),
            ..SwitchSettings::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub vni: u32,
    pub v4: String,
    #[serde(default)]
    pub v6: Option<String>,
    #[serde(default)]
    pub ips: Vec<IpConfig>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

impl NetworkConfig {
    pub fn v4_cidr(&self) -> Result<Cidr> {
        let cidr: Cidr = self.v4.parse()?;
        if !cidr.is_ipv4() {
            return Err(Error::Config(format!(
                "networks.{}: v4 is not an IPv4 network",
                self.vni
            )));
        }
        Ok(cidr)
    }

    pub fn v6_cidr(&self) -> Result<Option<Cidr>> {
        let Some(v6) = &self.v6 else {
            return Ok(None);
        };
        let cidr: Cidr = v6.parse()?;
        if cidr.is_ipv4() {
            return Err(Error::Config(format!(
                "networks.{}: v6 is not an IPv6 network",
                self.vni
            )));
        }
        Ok(Some(cidr))
    }
}

/// Locally-owned address
#[derive(Debug, Clone, Deserialize)]
pub struct IpConfig {
    pub ip: IpAddr,
    pub mac: String,
}

impl IpConfig {
    pub fn parse(&self) -> Result<(IpAddr, MacAddr)> {
        let mac = self
            .mac
            .parse()
            .map_err(|e| Error::Config(format!("{}: {}", self.ip, e)))?;
        Ok((self.ip, mac))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    pub alias: String,
    pub cidr: String,
    #[serde(default)]
    pub vni: Option<u32>,
    #[serde(default)]
    pub gateway: Option<IpAddr>,
}

impl RouteConfig {
    pub fn to_rule(&self) -> Result<RouteRule> {
        let target = match (self.vni, self.gateway) {
            (Some(vni), None) => RouteTarget::Network(vni),
            (None, Some(gateway)) => RouteTarget::Gateway(gateway),
            _ => {
                return Err(Error::Config(format!(
                    "route {}: exactly one of vni or gateway is required",
                    self.alias
                )))
            }
        };
        Ok(RouteRule::new(&self.alias, self.cidr.parse()?, target))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortConfig {
    pub name: String,
    /// VNI of the network the port joins
    pub network: u32,
    #[serde(default)]
    pub mtu: Option<usize>,
    #[serde(flatten)]
    pub kind: PortKind,
}

impl PortConfig {
    pub fn mtu(&self) -> usize {
        self.mtu.unwrap_or(DEFAULT_MTU)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PortKind {
    /// Raw socket on a host interface
    AfPacket { interface: String },
    /// VXLAN tunnel to one remote VTEP
    Vxlan { bind: SocketAddr, remote: SocketAddr },
}

#[derive(Debug, Clone, Deserialize)]
pub struct NatPoolConfig {
    pub name: String,
    /// `ip:low-high`
    pub range: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Ingress,
    Egress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Pass,
    Drop,
    Redirect,
    L4Tx,
}

/// Match/action entry of a port's filter chain
#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
    pub port: String,
    #[serde(default)]
    pub direction: Direction,
    pub action: RuleAction,
    #[serde(default)]
    pub redirect_to: Option<String>,
    /// tcp, udp, icmp or icmpv6
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub src: Option<String>,
    #[serde(default)]
    pub dst: Option<String>,
    /// Single port or `low-high`
    #[serde(default)]
    pub src_port: Option<String>,
    #[serde(default)]
    pub dst_port: Option<String>,
}

impl RuleConfig {
    pub fn to_match_rule(&self) -> Result<MatchRule> {
        let action = match self.action {
            RuleAction::Pass => FilterResult::Pass,
            RuleAction::Drop => FilterResult::Drop,
            RuleAction::L4Tx => FilterResult::L4Tx,
            RuleAction::Redirect => match &self.redirect_to {
                Some(to) => FilterResult::Redirect(to.clone()),
                None => {
                    return Err(Error::Config(format!(
                        "rule on {}: redirect requires redirect_to",
                        self.port
                    )))
                }
            },
        };

        let mut rule = MatchRule::new(action);
        rule.protocol = self.protocol.as_deref().map(parse_protocol).transpose()?;
        rule.src = self.src.as_deref().map(str::parse).transpose()?;
        rule.dst = self.dst.as_deref().map(str::parse).transpose()?;
        rule.src_ports = self.src_port.as_deref().map(parse_port_range).transpose()?;
        rule.dst_ports = self.dst_port.as_deref().map(parse_port_range).transpose()?;
        Ok(rule)
    }
}

fn parse_protocol(s: &str) -> Result<IpProtocol> {
    match s.to_ascii_lowercase().as_str() {
        "tcp" => Ok(IpProtocol::Tcp),
        "udp" => Ok(IpProtocol::Udp),
        "icmp" => Ok(IpProtocol::Icmp),
        "icmpv6" => Ok(IpProtocol::Icmpv6),
        _ => Err(Error::Config(format!("unknown protocol: {}", s))),
    }
}

fn parse_port_range(s: &str) -> Result<(u16, u16)> {
    let bad = || Error::Config(format!("invalid port range: {}", s));
    let (low, high) = match s.split_once('-') {
        Some((low, high)) => (
            low.trim().parse().map_err(|_| bad())?,
            high.trim().parse().map_err(|_| bad())?,
        ),
        None => {
            let port = s.trim().parse().map_err(|_| bad())?;
            (port, port)
        }
    };
    if low > high {
        return Err(bad());
    }
    Ok((low, high))
}

// ============================================================================
// Lock file types (generated, includes all defaults)
// ============================================================================

/// Generated lock file with all defaults filled in
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigLock {
    pub generated_at: String,
    pub switch: SwitchLock,
    pub logging: LoggingLock,
    pub networks: Vec<NetworkLock>,
    pub ports: Vec<PortLock>,
    pub nat_pools: Vec<NatPoolLock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchLock {
    pub mac_timeout: u64,
    pub arp_timeout: u64,
    pub ndp_timeout: u64,
    pub hop_limit: u8,
    pub mss_rewrite: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingLock {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkLock {
    pub vni: u32,
    pub v4: String,
    pub v6: Option<String>,
    pub ips: Vec<(IpAddr, String)>,
    pub routes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortLock {
    pub name: String,
    pub network: u32,
    pub mtu: usize,
    #[serde(flatten)]
    pub kind: PortKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatPoolLock {
    pub name: String,
    pub range: String,
}

impl ConfigLock {
    pub fn from_config(config: &Config) -> Self {
        let settings = config.switch.settings();
        let switch = SwitchLock {
            mac_timeout: settings.timeouts.mac.as_secs(),
            arp_timeout: settings.timeouts.arp.as_secs(),
            ndp_timeout: settings.timeouts.ndp.as_secs(),
            hop_limit: settings.hop_limit,
            mss_rewrite: format!("{:?}", settings.mss_rewrite).to_lowercase(),
        };

        let logging = config.logging.clone().unwrap_or_else(LogConfig::new);
        let logging = LoggingLock {
            level: logging.level,
            format: logging.format,
        };

        let networks = config
            .networks
            .iter()
            .map(|net| {
                // the default rules are installed on every network
                let mut routes = vec![format!("default -> {} vni {}", net.v4, net.vni)];
                if let Some(v6) = &net.v6 {
                    routes.push(format!("default-v6 -> {} vni {}", v6, net.vni));
                }
                routes.extend(net.routes.iter().map(|r| match r.to_rule() {
                    Ok(rule) => rule.to_string(),
                    Err(e) => format!("{} (invalid: {})", r.alias, e),
                }));
                NetworkLock {
                    vni: net.vni,
                    v4: net.v4.clone(),
                    v6: net.v6.clone(),
                    ips: net.ips.iter().map(|b| (b.ip, b.mac.clone())).collect(),
                    routes,
                }
            })
            .collect();

        let ports = config
            .ports
            .iter()
            .map(|p| PortLock {
                name: p.name.clone(),
                network: p.network,
                mtu: p.mtu(),
                kind: p.kind.clone(),
            })
            .collect();

        let nat_pools = config
            .nat_pools
            .iter()
            .map(|p| NatPoolLock {
                name: p.name.clone(),
                range: p.range.clone(),
            })
            .collect();

        ConfigLock {
            generated_at: chrono::Utc::now().to_rfc3339(),
            switch,
            logging,
            networks,
            ports,
            nat_pools,
        }
    }
}
