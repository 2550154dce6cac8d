//! Metrics collection for packet statistics.
//!
//! Lock-free counters for switch-wide events plus per-port traffic
//! statistics.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Atomic counter for thread-safe increment operations.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, val: u64) {
        self.0.fetch_add(val, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-port statistics.
#[derive(Debug, Default)]
pub struct PortStats {
    pub rx_packets: Counter,
    pub rx_bytes: Counter,
    pub tx_packets: Counter,
    pub tx_bytes: Counter,
    /// Frames received but not processed (no network, malformed)
    pub rx_drops: Counter,
    pub tx_errors: Counter,
}

impl PortStats {
    pub fn record_rx(&self, bytes: usize) {
        self.rx_packets.inc();
        self.rx_bytes.add(bytes as u64);
    }

    pub fn record_tx(&self, bytes: usize) {
        self.tx_packets.inc();
        self.tx_bytes.add(bytes as u64);
    }

    fn snapshot(&self) -> PortStatsSnapshot {
        PortStatsSnapshot {
            rx_packets: self.rx_packets.get(),
            rx_bytes: self.rx_bytes.get(),
            tx_packets: self.tx_packets.get(),
            tx_bytes: self.tx_bytes.get(),
            rx_drops: self.rx_drops.get(),
            tx_errors: self.tx_errors.get(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortStatsSnapshot {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub rx_drops: u64,
    pub tx_errors: u64,
}

/// Switch-wide metrics registry.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    ports: RwLock<HashMap<String, Arc<PortStats>>>,

    pub frames_received: Counter,
    pub frames_dropped: Counter,
    pub floods: Counter,

    pub arp_requests_sent: Counter,
    pub arp_replies_sent: Counter,
    pub ndp_solicitations_sent: Counter,
    pub ndp_advertisements_sent: Counter,

    pub icmp_echo_replies: Counter,
    pub icmp_port_unreachable: Counter,
    pub icmp_time_exceeded: Counter,
    pub tcp_resets_sent: Counter,

    pub packets_routed: Counter,

    pub nat_sessions_created: Counter,
    pub nat_allocation_failures: Counter,

    pub filter_dropped: Counter,
    pub filter_redirected: Counter,
    pub filter_tx_back: Counter,
}

/// Point-in-time copy of every counter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub floods: u64,
    pub arp_requests_sent: u64,
    pub arp_replies_sent: u64,
    pub ndp_solicitations_sent: u64,
    pub ndp_advertisements_sent: u64,
    pub icmp_echo_replies: u64,
    pub icmp_port_unreachable: u64,
    pub icmp_time_exceeded: u64,
    pub tcp_resets_sent: u64,
    pub packets_routed: u64,
    pub nat_sessions_created: u64,
    pub nat_allocation_failures: u64,
    pub filter_dropped: u64,
    pub filter_redirected: u64,
    pub filter_tx_back: u64,
    pub ports: BTreeMap<String, PortStatsSnapshot>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stats handle for a port, created on first use
    pub fn port(&self, name: &str) -> Arc<PortStats> {
        if let Some(stats) = self
            .ports
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
        {
            return stats.clone();
        }
        self.ports
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    pub fn remove_port(&self, name: &str) {
        self.ports
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let ports = self
            .ports
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(name, stats)| (name.clone(), stats.snapshot()))
            .collect();
        MetricsSnapshot {
            frames_received: self.frames_received.get(),
            frames_dropped: self.frames_dropped.get(),
            floods: self.floods.get(),
            arp_requests_sent: self.arp_requests_sent.get(),
            arp_replies_sent: self.arp_replies_sent.get(),
            ndp_solicitations_sent: self.ndp_solicitations_sent.get(),
            ndp_advertisements_sent: self.ndp_advertisements_sent.get(),
            icmp_echo_replies: self.icmp_echo_replies.get(),
            icmp_port_unreachable: self.icmp_port_unreachable.get(),
            icmp_time_exceeded: self.icmp_time_exceeded.get(),
            tcp_resets_sent: self.tcp_resets_sent.get(),
            packets_routed: self.packets_routed.get(),
            nat_sessions_created: self.nat_sessions_created.get(),
            nat_allocation_failures: self.nat_allocation_failures.get(),
            filter_dropped: self.filter_dropped.get(),
            filter_redirected: self.filter_redirected.get(),
            filter_tx_back: self.filter_tx_back.get(),
            ports,
        }
    }
}
