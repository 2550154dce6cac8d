//! Address-family independent view over IPv4/IPv6 packets

use super::icmp::IcmpPacket;
use super::ipv4::Ipv4Packet;
use super::ipv6::Ipv6Packet;
use super::tcp::TcpPacket;
use super::udp::UdpPacket;
use super::IpProtocol;
use crate::{Error, Result};
use std::net::IpAddr;

/// Decoded transport payload of an IP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpPayload {
    Tcp(TcpPacket),
    Udp(UdpPacket),
    Icmp(IcmpPacket),
    Unknown { protocol: u8, data: Vec<u8> },
}

impl IpPayload {
    pub(crate) fn parse(protocol: u8, data: &[u8], v6: bool) -> Result<Self> {
        match (IpProtocol::from_u8(protocol), v6) {
            (Some(IpProtocol::Tcp), _) => Ok(IpPayload::Tcp(TcpPacket::parse(data)?)),
            (Some(IpProtocol::Udp), _) => Ok(IpPayload::Udp(UdpPacket::parse(data)?)),
            (Some(IpProtocol::Icmp), false) => {
                Ok(IpPayload::Icmp(IcmpPacket::parse(data, false)?))
            }
            (Some(IpProtocol::Icmpv6), true) => {
                Ok(IpPayload::Icmp(IcmpPacket::parse(data, true)?))
            }
            _ => Ok(IpPayload::Unknown {
                protocol,
                data: data.to_vec(),
            }),
        }
    }

    /// Protocol number written into the enclosing IP header
    pub fn protocol(&self, v6: bool) -> u8 {
        match self {
            IpPayload::Tcp(_) => IpProtocol::Tcp as u8,
            IpPayload::Udp(_) => IpProtocol::Udp as u8,
            IpPayload::Icmp(_) if v6 => IpProtocol::Icmpv6 as u8,
            IpPayload::Icmp(_) => IpProtocol::Icmp as u8,
            IpPayload::Unknown { protocol, .. } => *protocol,
        }
    }

    pub(crate) fn to_bytes(&self, src: IpAddr, dst: IpAddr) -> Vec<u8> {
        match self {
            IpPayload::Tcp(tcp) => tcp.to_bytes(src, dst),
            IpPayload::Udp(udp) => udp.to_bytes(src, dst),
            IpPayload::Icmp(icmp) => icmp.to_bytes(src, dst),
            IpPayload::Unknown { data, .. } => data.clone(),
        }
    }
}

/// IPv4 or IPv6 packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpPacket {
    V4(Ipv4Packet),
    V6(Ipv6Packet),
}

impl IpPacket {
    /// Build a packet with default TTL; both addresses must share a family
    pub fn new(src: IpAddr, dst: IpAddr, payload: IpPayload) -> Result<Self> {
        match (src, dst) {
            (IpAddr::V4(s), IpAddr::V4(d)) => Ok(IpPacket::V4(Ipv4Packet::new(s, d, payload))),
            (IpAddr::V6(s), IpAddr::V6(d)) => Ok(IpPacket::V6(Ipv6Packet::new(s, d, payload))),
            _ => Err(Error::InvalidArgument(format!(
                "address family mismatch: {} -> {}",
                src, dst
            ))),
        }
    }

    /// Parse by the version nibble
    pub fn parse(buffer: &[u8]) -> Result<Self> {
        match buffer.first().map(|b| b >> 4) {
            Some(4) => Ok(IpPacket::V4(Ipv4Packet::parse(buffer)?)),
            Some(6) => Ok(IpPacket::V6(Ipv6Packet::parse(buffer)?)),
            _ => Err(Error::Parse("unknown IP version".into())),
        }
    }

    pub fn is_v6(&self) -> bool {
        matches!(self, IpPacket::V6(_))
    }

    pub fn src(&self) -> IpAddr {
        match self {
            IpPacket::V4(p) => IpAddr::V4(p.src),
            IpPacket::V6(p) => IpAddr::V6(p.src),
        }
    }

    pub fn dst(&self) -> IpAddr {
        match self {
            IpPacket::V4(p) => IpAddr::V4(p.dst),
            IpPacket::V6(p) => IpAddr::V6(p.dst),
        }
    }

    pub fn set_src(&mut self, ip: IpAddr) -> Result<()> {
        match (self, ip) {
            (IpPacket::V4(p), IpAddr::V4(ip)) => p.src = ip,
            (IpPacket::V6(p), IpAddr::V6(ip)) => p.src = ip,
            _ => return Err(Error::InvalidArgument(format!("address family mismatch: {}", ip))),
        }
        Ok(())
    }

    pub fn set_dst(&mut self, ip: IpAddr) -> Result<()> {
        match (self, ip) {
            (IpPacket::V4(p), IpAddr::V4(ip)) => p.dst = ip,
            (IpPacket::V6(p), IpAddr::V6(ip)) => p.dst = ip,
            _ => return Err(Error::InvalidArgument(format!("address family mismatch: {}", ip))),
        }
        Ok(())
    }

    /// TTL (v4) or hop limit (v6)
    pub fn ttl(&self) -> u8 {
        match self {
            IpPacket::V4(p) => p.ttl,
            IpPacket::V6(p) => p.hop_limit,
        }
    }

    pub fn set_ttl(&mut self, ttl: u8) {
        match self {
            IpPacket::V4(p) => p.ttl = ttl,
            IpPacket::V6(p) => p.hop_limit = ttl,
        }
    }

    pub fn protocol(&self) -> u8 {
        self.payload().protocol(self.is_v6())
    }

    pub fn payload(&self) -> &IpPayload {
        match self {
            IpPacket::V4(p) => &p.payload,
            IpPacket::V6(p) => &p.payload,
        }
    }

    pub fn payload_mut(&mut self) -> &mut IpPayload {
        match self {
            IpPacket::V4(p) => &mut p.payload,
            IpPacket::V6(p) => &mut p.payload,
        }
    }

    pub fn tcp(&self) -> Option<&TcpPacket> {
        match self.payload() {
            IpPayload::Tcp(tcp) => Some(tcp),
            _ => None,
        }
    }

    pub fn udp(&self) -> Option<&UdpPacket> {
        match self.payload() {
            IpPayload::Udp(udp) => Some(udp),
            _ => None,
        }
    }

    pub fn icmp(&self) -> Option<&IcmpPacket> {
        match self.payload() {
            IpPayload::Icmp(icmp) => Some(icmp),
            _ => None,
        }
    }

    /// Source and destination transport ports for TCP/UDP
    pub fn ports(&self) -> Option<(u16, u16)> {
        match self.payload() {
            IpPayload::Tcp(tcp) => Some((tcp.src_port, tcp.dst_port)),
            IpPayload::Udp(udp) => Some((udp.src_port, udp.dst_port)),
            _ => None,
        }
    }

    pub fn set_src_port(&mut self, port: u16) {
        match self.payload_mut() {
            IpPayload::Tcp(tcp) => tcp.src_port = port,
            IpPayload::Udp(udp) => udp.src_port = port,
            _ => {}
        }
    }

    pub fn set_dst_port(&mut self, port: u16) {
        match self.payload_mut() {
            IpPayload::Tcp(tcp) => tcp.dst_port = port,
            IpPayload::Udp(udp) => udp.dst_port = port,
            _ => {}
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            IpPacket::V4(p) => p.to_bytes(),
            IpPacket::V6(p) => p.to_bytes(),
        }
    }
}
