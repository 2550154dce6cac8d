//! IPv6 protocol - RFC 8200
//!
//! Extension headers are not decoded; a packet carrying one keeps the rest
//! of its payload as opaque bytes.

use super::ip::IpPayload;
use crate::{Error, Result};
use std::net::{IpAddr, Ipv6Addr};

/// IPv6 fixed header size
pub const HEADER_SIZE: usize = 40;
/// Default hop limit for locally generated packets
pub const DEFAULT_HOP_LIMIT: u8 = 64;

/// Decoded IPv6 packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv6Packet {
    pub traffic_class: u8,
    pub flow_label: u32,
    pub hop_limit: u8,
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
    pub payload: IpPayload,
}

fn ipv6_at(buffer: &[u8], offset: usize) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&buffer[offset..offset + 16]);
    Ipv6Addr::from(octets)
}

impl Ipv6Packet {
    pub fn new(src: Ipv6Addr, dst: Ipv6Addr, payload: IpPayload) -> Self {
        Self {
            traffic_class: 0,
            flow_label: 0,
            hop_limit: DEFAULT_HOP_LIMIT,
            src,
            dst,
            payload,
        }
    }

    pub fn parse(buffer: &[u8]) -> Result<Self> {
        if buffer.len() < HEADER_SIZE {
            return Err(Error::Parse("IPv6 header too short".into()));
        }
        if buffer[0] >> 4 != 6 {
            return Err(Error::Parse("not an IPv6 packet".into()));
        }

        let payload_len = u16::from_be_bytes([buffer[4], buffer[5]]) as usize;
        if buffer.len() < HEADER_SIZE + payload_len {
            return Err(Error::Parse("IPv6 payload truncated".into()));
        }

        let data = &buffer[HEADER_SIZE..HEADER_SIZE + payload_len];
        Ok(Self {
            traffic_class: (buffer[0] << 4) | (buffer[1] >> 4),
            flow_label: u32::from_be_bytes([0, buffer[1] & 0x0F, buffer[2], buffer[3]]),
            hop_limit: buffer[7],
            src: ipv6_at(buffer, 8),
            dst: ipv6_at(buffer, 24),
            payload: IpPayload::parse(buffer[6], data, true)?,
        })
    }

    /// Serialize header and payload, recomputing every checksum
    pub fn to_bytes(&self) -> Vec<u8> {
        let payload = self
            .payload
            .to_bytes(IpAddr::V6(self.src), IpAddr::V6(self.dst));

        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
        let first = 0x6000_0000u32 | ((self.traffic_class as u32) << 20) | (self.flow_label & 0x000F_FFFF);
        buf.extend_from_slice(&first.to_be_bytes());
        buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        buf.push(self.payload.protocol(true));
        buf.push(self.hop_limit);
        buf.extend_from_slice(&self.src.octets());
        buf.extend_from_slice(&self.dst.octets());
        buf.extend_from_slice(&payload);
        buf
    }
}

/// Solicited-node multicast address for `ip` (RFC 4291 section 2.7.1)
pub fn solicited_node(ip: &Ipv6Addr) -> Ipv6Addr {
    let o = ip.octets();
    Ipv6Addr::new(
        0xff02,
        0,
        0,
        0,
        0,
        1,
        0xff00 | o[13] as u16,
        u16::from_be_bytes([o[14], o[15]]),
    )
}
