//! Packet codec
//!
//! Owned, closed sum types per layer (Ethernet → ARP/IP → TCP/UDP/ICMP)
//! plus a zero-copy header view for the ingress fast path.

pub mod arp;
pub mod checksum;
pub mod ethernet;
pub mod icmp;
pub mod icmpv6;
pub mod ip;
pub mod ipv4;
pub mod ipv6;
pub mod tcp;
pub mod types;
pub mod udp;
pub mod vxlan;

pub use types::*;
