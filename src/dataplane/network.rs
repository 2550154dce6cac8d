//! A VNI-scoped broadcast domain
//!
//! Every table sits behind its own lock so workers serving different ports
//! of the same network only contend on the table they actually touch.

use super::address_table::Cidr;
use super::aging::AgingEntry;
use super::conntrack::Conntrack;
use super::mac_table::MacTable;
use super::neighbor_table::{ArpTable, NdpTable};
use super::route_table::{RouteRule, RouteTable};
use crate::protocol::MacAddr;
use crate::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info};

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

/// Table timeouts applied to a new network
#[derive(Debug, Clone, Copy)]
pub struct NetworkTimeouts {
    pub mac: Duration,
    pub arp: Duration,
    pub ndp: Duration,
}

impl Default for NetworkTimeouts {
    fn default() -> Self {
        Self {
            mac: super::mac_table::DEFAULT_MAC_TIMEOUT,
            arp: super::neighbor_table::DEFAULT_NEIGHBOR_TIMEOUT,
            ndp: super::neighbor_table::DEFAULT_NEIGHBOR_TIMEOUT,
        }
    }
}

#[derive(Debug)]
pub struct Network {
    vni: u32,
    v4: Cidr,
    v6: Option<Cidr>,
    macs: RwLock<MacTable>,
    arp: RwLock<ArpTable>,
    ndp: RwLock<NdpTable>,
    routes: RwLock<RouteTable>,
    conntrack: Mutex<Conntrack>,
    /// Addresses the switch answers ARP/NDP/ICMP for
    ips: RwLock<BTreeMap<IpAddr, MacAddr>>,
    ports: RwLock<BTreeSet<String>>,
}

impl Network {
    pub fn new(vni: u32, v4: Cidr, v6: Option<Cidr>, timeouts: NetworkTimeouts) -> Result<Self> {
        if !v4.is_ipv4() {
            return Err(Error::InvalidArgument(format!("{} is not an ipv4 network", v4)));
        }
        if let Some(v6) = v6 {
            if v6.is_ipv4() {
                return Err(Error::InvalidArgument(format!("{} is not an ipv6 network", v6)));
            }
        }
        Ok(Self {
            vni,
            v4,
            v6,
            macs: RwLock::new(MacTable::new(timeouts.mac)),
            arp: RwLock::new(ArpTable::new(timeouts.arp)),
            ndp: RwLock::new(NdpTable::new(timeouts.ndp)),
            routes: RwLock::new(RouteTable::new(vni, v4, v6)),
            conntrack: Mutex::new(Conntrack::new()),
            ips: RwLock::new(BTreeMap::new()),
            ports: RwLock::new(BTreeSet::new()),
        })
    }

    pub fn vni(&self) -> u32 {
        self.vni
    }

    pub fn v4(&self) -> Cidr {
        self.v4
    }

    pub fn v6(&self) -> Option<Cidr> {
        self.v6
    }

    /// Whether `ip` lies inside one of the network's subnets
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match ip {
            IpAddr::V4(_) => self.v4.contains(ip),
            IpAddr::V6(_) => self.v6.is_some_and(|c| c.contains(ip)),
        }
    }

    // ========================================
    // Local addresses
    // ========================================

    pub fn add_ip(&self, ip: IpAddr, mac: MacAddr) -> Result<()> {
        if !self.contains(&ip) {
            return Err(Error::InvalidArgument(format!(
                "{} is not inside network {}",
                ip, self.vni
            )));
        }
        if !mac.is_unicast() {
            return Err(Error::InvalidArgument(format!("{} is not a unicast mac", mac)));
        }
        let mut ips = write(&self.ips);
        if ips.contains_key(&ip) {
            return Err(Error::already_exists("ip", ip));
        }
        ips.insert(ip, mac);
        drop(ips);

        match ip {
            IpAddr::V4(v4) => write(&self.arp).insert_static(v4, mac),
            IpAddr::V6(v6) => write(&self.ndp).insert_static(v6, mac),
        }
        info!(vni = self.vni, %ip, %mac, "local ip added");
        Ok(())
    }

    pub fn del_ip(&self, ip: &IpAddr) -> Result<MacAddr> {
        let mac = write(&self.ips)
            .remove(ip)
            .ok_or_else(|| Error::not_found("ip", ip))?;
        match ip {
            IpAddr::V4(v4) => write(&self.arp).remove(v4),
            IpAddr::V6(v6) => write(&self.ndp).remove(v6),
        };
        info!(vni = self.vni, %ip, "local ip removed");
        Ok(mac)
    }

    /// MAC of a locally owned address
    pub fn local_mac(&self, ip: &IpAddr) -> Option<MacAddr> {
        read(&self.ips).get(ip).copied()
    }

    pub fn is_local_mac(&self, mac: &MacAddr) -> bool {
        read(&self.ips).values().any(|m| m == mac)
    }

    /// A local binding of the given family, used to source synthesized frames
    pub fn binding(&self, v6: bool) -> Option<(IpAddr, MacAddr)> {
        read(&self.ips)
            .iter()
            .find(|(ip, _)| ip.is_ipv6() == v6)
            .map(|(ip, mac)| (*ip, *mac))
    }

    pub fn ips(&self) -> Vec<(IpAddr, MacAddr)> {
        read(&self.ips).iter().map(|(ip, mac)| (*ip, *mac)).collect()
    }

    // ========================================
    // Ports
    // ========================================

    pub(crate) fn add_port(&self, name: &str) {
        write(&self.ports).insert(name.to_string());
    }

    pub(crate) fn remove_port(&self, name: &str) {
        write(&self.ports).remove(name);
        write(&self.macs).remove_port(name);
    }

    pub fn ports(&self) -> Vec<String> {
        read(&self.ports).iter().cloned().collect()
    }

    pub fn has_ports(&self) -> bool {
        !read(&self.ports).is_empty()
    }

    // ========================================
    // MAC and neighbor tables
    // ========================================

    pub fn learn_mac(&self, mac: MacAddr, port: &str, now: Instant) {
        write(&self.macs).record(mac, port, now);
    }

    pub fn lookup_mac(&self, mac: &MacAddr, now: Instant) -> Option<String> {
        read(&self.macs).lookup(mac, now).map(str::to_string)
    }

    pub fn mac_entries(&self, now: Instant) -> Vec<AgingEntry<MacAddr, String>> {
        read(&self.macs).entries(now)
    }

    pub fn record_neighbor(&self, ip: IpAddr, mac: MacAddr, now: Instant) {
        match ip {
            IpAddr::V4(v4) => write(&self.arp).record(v4, mac, now),
            IpAddr::V6(v6) => write(&self.ndp).record(v6, mac, now),
        }
    }

    pub fn lookup_neighbor(&self, ip: &IpAddr, now: Instant) -> Option<MacAddr> {
        match ip {
            IpAddr::V4(v4) => read(&self.arp).lookup(v4, now),
            IpAddr::V6(v6) => read(&self.ndp).lookup(v6, now),
        }
    }

    pub fn neighbor_entries(&self, now: Instant) -> Vec<AgingEntry<IpAddr, MacAddr>> {
        let v4 = read(&self.arp).entries(now).into_iter().map(|e| AgingEntry {
            key: IpAddr::V4(e.key),
            value: e.value,
            remaining: e.remaining,
        });
        let v6 = read(&self.ndp).entries(now).into_iter().map(|e| AgingEntry {
            key: IpAddr::V6(e.key),
            value: e.value,
            remaining: e.remaining,
        });
        v4.chain(v6).collect()
    }

    pub fn set_timeouts(&self, timeouts: NetworkTimeouts) {
        write(&self.macs).set_timeout(timeouts.mac);
        write(&self.arp).set_timeout(timeouts.arp);
        write(&self.ndp).set_timeout(timeouts.ndp);
    }

    /// Evict aged MAC and neighbor entries
    pub fn expire(&self, now: Instant) -> usize {
        let evicted = write(&self.macs).expire(now)
            + write(&self.arp).expire(now)
            + write(&self.ndp).expire(now);
        if evicted > 0 {
            debug!(vni = self.vni, evicted, "table entries aged out");
        }
        evicted
    }

    // ========================================
    // Routes and L4
    // ========================================

    pub fn add_route(&self, rule: RouteRule) -> Result<()> {
        write(&self.routes).add_rule(rule)
    }

    pub fn del_route(&self, alias: &str) -> Result<RouteRule> {
        write(&self.routes).del_rule(alias)
    }

    pub fn lookup_route(&self, ip: &IpAddr) -> Option<RouteRule> {
        read(&self.routes).lookup(ip).cloned()
    }

    pub fn routes(&self) -> Vec<RouteRule> {
        read(&self.routes).get_rules()
    }

    pub fn conntrack(&self) -> MutexGuard<'_, Conntrack> {
        self.conntrack.lock().unwrap_or_else(|e| e.into_inner())
    }
}
