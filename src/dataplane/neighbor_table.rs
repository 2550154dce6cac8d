//! Neighbor tables: ARP (IPv4 → MAC) and NDP (IPv6 → MAC)
//!
//! Learned entries age out; locally owned addresses are installed as
//! static entries and never expire.

use super::aging::{AgingEntry, AgingMap};
use crate::protocol::MacAddr;
use std::fmt::Display;
use std::hash::Hash;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::{Duration, Instant};
use tracing::debug;

/// Default neighbor aging time (4 hours)
pub const DEFAULT_NEIGHBOR_TIMEOUT: Duration = Duration::from_secs(4 * 3600);

#[derive(Debug)]
pub struct NeighborTable<A> {
    entries: AgingMap<A, MacAddr>,
}

/// IPv4 neighbor table
pub type ArpTable = NeighborTable<Ipv4Addr>;
/// IPv6 neighbor table
pub type NdpTable = NeighborTable<Ipv6Addr>;

impl<A> Default for NeighborTable<A>
where
    A: Hash + Eq + Ord + Copy + Display,
{
    fn default() -> Self {
        Self::new(DEFAULT_NEIGHBOR_TIMEOUT)
    }
}

impl<A> NeighborTable<A>
where
    A: Hash + Eq + Ord + Copy + Display,
{
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: AgingMap::new(timeout),
        }
    }

    /// Insert or refresh a learned binding
    pub fn record(&mut self, ip: A, mac: MacAddr, now: Instant) {
        if mac.is_multicast() {
            return;
        }
        if self.entries.record(ip, mac, now) != Some(mac) {
            debug!(%ip, %mac, "neighbor learned");
        }
    }

    /// Install a binding that never ages out (locally owned address)
    pub fn insert_static(&mut self, ip: A, mac: MacAddr) {
        self.entries.insert_static(ip, mac);
    }

    pub fn lookup(&self, ip: &A, now: Instant) -> Option<MacAddr> {
        self.entries.get(ip, now).copied()
    }

    pub fn is_static(&self, ip: &A) -> bool {
        self.entries.is_static(ip)
    }

    pub fn remove(&mut self, ip: &A) -> Option<MacAddr> {
        self.entries.remove(ip)
    }

    pub fn expire(&mut self, now: Instant) -> usize {
        let evicted = self.entries.expire(now);
        for (ip, mac) in &evicted {
            debug!(%ip, %mac, "neighbor aged out");
        }
        evicted.len()
    }

    pub fn timeout(&self) -> Duration {
        self.entries.timeout()
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.entries.set_timeout(timeout);
    }

    pub fn entries(&self, now: Instant) -> Vec<AgingEntry<A, MacAddr>> {
        self.entries.entries(now)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
