//! Longest-prefix-match table over IPv4/IPv6 address space
//!
//! Rules are grouped by prefix length. Each group is a hash map keyed by
//! the masked network address, and groups are kept in descending
//! prefix-length order so a lookup probes at most one map per distinct
//! length, most specific first.

use crate::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Network prefix (address is always stored masked)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr {
    addr: IpAddr,
    prefix_len: u8,
}

fn mask_v4(addr: Ipv4Addr, prefix_len: u8) -> Ipv4Addr {
    let mask = if prefix_len == 0 {
        0
    } else {
        !0u32 << (32 - prefix_len)
    };
    Ipv4Addr::from(u32::from(addr) & mask)
}

fn mask_v6(addr: Ipv6Addr, prefix_len: u8) -> Ipv6Addr {
    let mask = if prefix_len == 0 {
        0
    } else {
        !0u128 << (128 - prefix_len)
    };
    Ipv6Addr::from(u128::from(addr) & mask)
}

fn mask(addr: IpAddr, prefix_len: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => IpAddr::V4(mask_v4(v4, prefix_len)),
        IpAddr::V6(v6) => IpAddr::V6(mask_v6(v6, prefix_len)),
    }
}

fn max_prefix(addr: &IpAddr) -> u8 {
    if addr.is_ipv4() { 32 } else { 128 }
}

impl Cidr {
    /// Network containing `addr`; host bits are cleared
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Self> {
        if prefix_len > max_prefix(&addr) {
            return Err(Error::Parse(format!(
                "prefix length {} too long for {}",
                prefix_len, addr
            )));
        }
        Ok(Self {
            addr: mask(addr, prefix_len),
            prefix_len,
        })
    }

    /// Single-address network (/32 or /128)
    pub fn host(addr: IpAddr) -> Self {
        Self {
            addr,
            prefix_len: max_prefix(&addr),
        }
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn is_ipv4(&self) -> bool {
        self.addr.is_ipv4()
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        ip.is_ipv4() == self.addr.is_ipv4() && mask(*ip, self.prefix_len) == self.addr
    }

    /// Whether `other` lies entirely within this network
    pub fn contains_cidr(&self, other: &Cidr) -> bool {
        other.prefix_len >= self.prefix_len && self.contains(&other.addr)
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl FromStr for Cidr {
    type Err = Error;

    /// "10.0.0.0/24", "fd00::/64"; a bare address is a host route
    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::Parse(format!("invalid CIDR: {:?}", s));
        match s.split_once('/') {
            Some((addr, len)) => {
                let addr: IpAddr = addr.trim().parse().map_err(|_| bad())?;
                let len: u8 = len.trim().parse().map_err(|_| bad())?;
                Cidr::new(addr, len)
            }
            None => Ok(Cidr::host(s.trim().parse().map_err(|_| bad())?)),
        }
    }
}

/// Rules sharing one prefix length
#[derive(Debug)]
struct Group<R> {
    prefix_len: u8,
    entries: HashMap<IpAddr, R>,
}

/// Longest-prefix-match container
#[derive(Debug)]
pub struct AddressTable<R> {
    v4: Vec<Group<R>>,
    v6: Vec<Group<R>>,
}

impl<R> Default for AddressTable<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> AddressTable<R> {
    pub fn new() -> Self {
        Self {
            v4: Vec::new(),
            v6: Vec::new(),
        }
    }

    fn groups(&self, v4: bool) -> &Vec<Group<R>> {
        if v4 { &self.v4 } else { &self.v6 }
    }

    fn groups_mut(&mut self, v4: bool) -> &mut Vec<Group<R>> {
        if v4 { &mut self.v4 } else { &mut self.v6 }
    }

    /// Insert a rule; an existing rule for the same network is replaced and returned
    pub fn add(&mut self, cidr: Cidr, rule: R) -> Option<R> {
        let groups = self.groups_mut(cidr.is_ipv4());
        // groups are few (one per distinct length), a linear scan is enough
        let pos = groups
            .iter()
            .position(|g| g.prefix_len <= cidr.prefix_len)
            .unwrap_or(groups.len());
        if groups.get(pos).is_none_or(|g| g.prefix_len != cidr.prefix_len) {
            groups.insert(
                pos,
                Group {
                    prefix_len: cidr.prefix_len,
                    entries: HashMap::new(),
                },
            );
        }
        groups[pos].entries.insert(cidr.addr, rule)
    }

    /// Remove the rule registered for exactly this network
    pub fn remove(&mut self, cidr: &Cidr) -> Option<R> {
        let groups = self.groups_mut(cidr.is_ipv4());
        let pos = groups.iter().position(|g| g.prefix_len == cidr.prefix_len)?;
        let removed = groups[pos].entries.remove(&cidr.addr);
        if groups[pos].entries.is_empty() {
            groups.remove(pos);
        }
        removed
    }

    /// Remove the first rule (most specific first) matching `pred`
    pub fn remove_by<F>(&mut self, mut pred: F) -> Option<R>
    where
        F: FnMut(&Cidr, &R) -> bool,
    {
        let cidr = self.iter().find(|(c, r)| pred(c, r)).map(|(c, _)| c)?;
        self.remove(&cidr)
    }

    /// Rule registered for exactly this network
    pub fn get(&self, cidr: &Cidr) -> Option<&R> {
        self.groups(cidr.is_ipv4())
            .iter()
            .find(|g| g.prefix_len == cidr.prefix_len)?
            .entries
            .get(&cidr.addr)
    }

    fn lookup_native(&self, ip: &IpAddr, max_len: u8) -> Option<&R> {
        self.groups(ip.is_ipv4())
            .iter()
            .filter(|g| g.prefix_len <= max_len)
            .find_map(|g| g.entries.get(&mask(*ip, g.prefix_len)))
    }

    /// Longest-prefix match for an address
    ///
    /// Falls back to the other family's form of the address (IPv4-mapped /
    /// IPv4-compatible) when nothing matches natively.
    pub fn lookup(&self, ip: &IpAddr) -> Option<&R> {
        if let Some(rule) = self.lookup_native(ip, max_prefix(ip)) {
            return Some(rule);
        }
        match ip {
            IpAddr::V4(v4) => {
                let mapped = IpAddr::V6(v4.to_ipv6_mapped());
                self.lookup_native(&mapped, 128).or_else(|| {
                    #[allow(deprecated)]
                    let compat = IpAddr::V6(v4.to_ipv6_compatible());
                    self.lookup_native(&compat, 128)
                })
            }
            IpAddr::V6(v6) => {
                let v4 = v6.to_ipv4_mapped().or_else(|| ipv4_compatible(v6))?;
                self.lookup_native(&IpAddr::V4(v4), 32)
            }
        }
    }

    /// Most specific rule whose network covers the whole of `cidr`
    pub fn lookup_cidr(&self, cidr: &Cidr) -> Option<&R> {
        self.lookup_native(&cidr.addr, cidr.prefix_len)
    }

    /// All rules, most specific first (IPv4 before IPv6)
    pub fn iter(&self) -> impl Iterator<Item = (Cidr, &R)> {
        self.v4.iter().chain(self.v6.iter()).flat_map(|g| {
            g.entries.iter().map(move |(addr, rule)| {
                (
                    Cidr {
                        addr: *addr,
                        prefix_len: g.prefix_len,
                    },
                    rule,
                )
            })
        })
    }

    pub fn len(&self) -> usize {
        self.v4
            .iter()
            .chain(self.v6.iter())
            .map(|g| g.entries.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }

    /// Number of prefix-length groups currently held
    pub fn group_count(&self) -> usize {
        self.v4.len() + self.v6.len()
    }
}

/// `::a.b.c.d` (deprecated IPv4-compatible form), excluding `::` and `::1`
fn ipv4_compatible(v6: &Ipv6Addr) -> Option<Ipv4Addr> {
    let o = v6.octets();
    if o[..12].iter().all(|b| *b == 0) && u32::from_be_bytes([o[12], o[13], o[14], o[15]]) > 1 {
        Some(Ipv4Addr::new(o[12], o[13], o[14], o[15]))
    } else {
        None
    }
}
