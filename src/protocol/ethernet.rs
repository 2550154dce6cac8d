//! Ethernet frame parsing and construction

use super::arp::ArpPacket;
use super::ip::IpPacket;
use super::{EtherType, MacAddr};
use crate::{Error, Result};

/// Ethernet header size (no VLAN tag)
pub const HEADER_SIZE: usize = 14;
/// Maximum Ethernet frame size (without FCS)
pub const MAX_FRAME_SIZE: usize = 1518;

/// Parsed Ethernet header (zero-copy reference)
///
/// Reads addresses and the ether type without decoding the payload.
#[derive(Debug)]
pub struct Frame<'a> {
    buffer: &'a [u8],
}

impl<'a> Frame<'a> {
    /// Parse an Ethernet frame from a buffer
    pub fn parse(buffer: &'a [u8]) -> Result<Self> {
        if buffer.len() < HEADER_SIZE {
            return Err(Error::Parse("frame too short".into()));
        }
        Ok(Self { buffer })
    }

    pub fn dst_mac(&self) -> MacAddr {
        MacAddr([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
            self.buffer[4],
            self.buffer[5],
        ])
    }

    pub fn src_mac(&self) -> MacAddr {
        MacAddr([
            self.buffer[6],
            self.buffer[7],
            self.buffer[8],
            self.buffer[9],
            self.buffer[10],
            self.buffer[11],
        ])
    }

    pub fn ethertype(&self) -> u16 {
        u16::from_be_bytes([self.buffer[12], self.buffer[13]])
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer[HEADER_SIZE..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.buffer
    }
}

/// Decoded Ethernet payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EthPayload {
    Arp(ArpPacket),
    Ip(IpPacket),
    Unknown { ether_type: u16, data: Vec<u8> },
}

impl EthPayload {
    pub fn ether_type(&self) -> u16 {
        match self {
            EthPayload::Arp(_) => EtherType::Arp as u16,
            EthPayload::Ip(IpPacket::V4(_)) => EtherType::Ipv4 as u16,
            EthPayload::Ip(IpPacket::V6(_)) => EtherType::Ipv6 as u16,
            EthPayload::Unknown { ether_type, .. } => *ether_type,
        }
    }

    fn parse(ether_type: u16, data: &[u8]) -> Result<Self> {
        match EtherType::from_u16(ether_type) {
            Some(EtherType::Arp) => Ok(EthPayload::Arp(ArpPacket::parse(data)?)),
            Some(EtherType::Ipv4) | Some(EtherType::Ipv6) => {
                Ok(EthPayload::Ip(IpPacket::parse(data)?))
            }
            None => Ok(EthPayload::Unknown {
                ether_type,
                data: data.to_vec(),
            }),
        }
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        match self {
            EthPayload::Arp(arp) => buf.extend_from_slice(&arp.to_bytes()),
            EthPayload::Ip(ip) => buf.extend_from_slice(&ip.to_bytes()),
            EthPayload::Unknown { data, .. } => buf.extend_from_slice(data),
        }
    }
}

/// Fully decoded Ethernet frame
///
/// A frame parsed from the wire keeps its original bytes until it is mutated,
/// so frames forwarded unchanged leave the switch byte-for-byte identical.
#[derive(Debug, Clone)]
pub struct EthernetPacket {
    dst: MacAddr,
    src: MacAddr,
    payload: EthPayload,
    raw: Option<Vec<u8>>,
}

impl PartialEq for EthernetPacket {
    fn eq(&self, other: &Self) -> bool {
        self.dst == other.dst && self.src == other.src && self.payload == other.payload
    }
}

impl Eq for EthernetPacket {}

impl EthernetPacket {
    pub fn new(dst: MacAddr, src: MacAddr, payload: EthPayload) -> Self {
        Self {
            dst,
            src,
            payload,
            raw: None,
        }
    }

    pub fn parse(buffer: &[u8]) -> Result<Self> {
        let frame = Frame::parse(buffer)?;
        let payload = EthPayload::parse(frame.ethertype(), frame.payload())?;
        Ok(Self {
            dst: frame.dst_mac(),
            src: frame.src_mac(),
            payload,
            raw: Some(buffer.to_vec()),
        })
    }

    pub fn dst(&self) -> MacAddr {
        self.dst
    }

    pub fn src(&self) -> MacAddr {
        self.src
    }

    pub fn set_dst(&mut self, mac: MacAddr) {
        self.dst = mac;
        self.raw = None;
    }

    pub fn set_src(&mut self, mac: MacAddr) {
        self.src = mac;
        self.raw = None;
    }

    pub fn ether_type(&self) -> u16 {
        self.payload.ether_type()
    }

    pub fn payload(&self) -> &EthPayload {
        &self.payload
    }

    /// Mutable access to the payload; drops the cached wire bytes
    pub fn payload_mut(&mut self) -> &mut EthPayload {
        self.raw = None;
        &mut self.payload
    }

    pub fn into_payload(self) -> EthPayload {
        self.payload
    }

    pub fn set_payload(&mut self, payload: EthPayload) {
        self.payload = payload;
        self.raw = None;
    }

    pub fn ip(&self) -> Option<&IpPacket> {
        match &self.payload {
            EthPayload::Ip(ip) => Some(ip),
            _ => None,
        }
    }

    pub fn ip_mut(&mut self) -> Option<&mut IpPacket> {
        match self.payload_mut() {
            EthPayload::Ip(ip) => Some(ip),
            _ => None,
        }
    }

    pub fn arp(&self) -> Option<&ArpPacket> {
        match &self.payload {
            EthPayload::Arp(arp) => Some(arp),
            _ => None,
        }
    }

    /// Whether the cached wire bytes are still valid
    pub fn has_cached_bytes(&self) -> bool {
        self.raw.is_some()
    }

    /// Serialized wire bytes, rebuilding them if the frame was mutated
    pub fn bytes(&mut self) -> &[u8] {
        let raw = match self.raw.take() {
            Some(raw) => raw,
            None => self.serialize(),
        };
        self.raw.insert(raw)
    }

    /// Serialized wire bytes without touching the cache
    pub fn to_bytes(&self) -> Vec<u8> {
        match &self.raw {
            Some(raw) => raw.clone(),
            None => self.serialize(),
        }
    }

    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MAX_FRAME_SIZE);
        buf.extend_from_slice(&self.dst.0);
        buf.extend_from_slice(&self.src.0);
        buf.extend_from_slice(&self.payload.ether_type().to_be_bytes());
        self.payload.write_to(&mut buf);
        buf
    }
}
