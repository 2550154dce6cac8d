//! IPv4 protocol - RFC 791

use super::checksum::internet_checksum;
use super::ip::IpPayload;
use crate::{Error, Result};
use std::net::{IpAddr, Ipv4Addr};

/// Minimum IPv4 header size (without options)
pub const MIN_HEADER_SIZE: usize = 20;
/// Default TTL for locally generated packets
pub const DEFAULT_TTL: u8 = 64;

/// Fragment flags
pub mod flags {
    /// Don't Fragment
    pub const DF: u16 = 0x4000;
    /// More Fragments
    pub const MF: u16 = 0x2000;
    /// Fragment offset mask
    pub const OFFSET_MASK: u16 = 0x1FFF;
}

/// Decoded IPv4 packet
///
/// Fragments keep their payload undecoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Packet {
    pub tos: u8,
    pub identification: u16,
    /// Flags and fragment offset as carried on the wire
    pub flags_fragment: u16,
    pub ttl: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub options: Vec<u8>,
    pub payload: IpPayload,
}

impl Ipv4Packet {
    pub fn new(src: Ipv4Addr, dst: Ipv4Addr, payload: IpPayload) -> Self {
        Self {
            tos: 0,
            identification: 0,
            flags_fragment: flags::DF,
            ttl: DEFAULT_TTL,
            src,
            dst,
            options: Vec::new(),
            payload,
        }
    }

    pub fn parse(buffer: &[u8]) -> Result<Self> {
        if buffer.len() < MIN_HEADER_SIZE {
            return Err(Error::Parse("IPv4 header too short".into()));
        }
        if buffer[0] >> 4 != 4 {
            return Err(Error::Parse("not an IPv4 packet".into()));
        }

        let header_len = ((buffer[0] & 0x0F) as usize) * 4;
        if header_len < MIN_HEADER_SIZE || buffer.len() < header_len {
            return Err(Error::Parse("IPv4 header truncated".into()));
        }

        let total_len = u16::from_be_bytes([buffer[2], buffer[3]]) as usize;
        if total_len < header_len || buffer.len() < total_len {
            return Err(Error::Parse("IPv4 total length mismatch".into()));
        }

        let flags_fragment = u16::from_be_bytes([buffer[6], buffer[7]]);
        let protocol = buffer[9];
        let data = &buffer[header_len..total_len];
        let is_fragment = flags_fragment & (flags::MF | flags::OFFSET_MASK) != 0;
        let payload = if is_fragment {
            IpPayload::Unknown {
                protocol,
                data: data.to_vec(),
            }
        } else {
            IpPayload::parse(protocol, data, false)?
        };

        Ok(Self {
            tos: buffer[1],
            identification: u16::from_be_bytes([buffer[4], buffer[5]]),
            flags_fragment,
            ttl: buffer[8],
            src: Ipv4Addr::new(buffer[12], buffer[13], buffer[14], buffer[15]),
            dst: Ipv4Addr::new(buffer[16], buffer[17], buffer[18], buffer[19]),
            options: buffer[MIN_HEADER_SIZE..header_len].to_vec(),
            payload,
        })
    }

    pub fn header_len(&self) -> usize {
        MIN_HEADER_SIZE + self.options.len().div_ceil(4) * 4
    }

    pub fn is_fragment(&self) -> bool {
        self.flags_fragment & (flags::MF | flags::OFFSET_MASK) != 0
    }

    /// Serialize header and payload, recomputing every checksum
    pub fn to_bytes(&self) -> Vec<u8> {
        let payload = self
            .payload
            .to_bytes(IpAddr::V4(self.src), IpAddr::V4(self.dst));
        let header_len = self.header_len();
        let total_len = header_len + payload.len();

        let mut buf = Vec::with_capacity(total_len);
        buf.push(0x40 | (header_len / 4) as u8);
        buf.push(self.tos);
        buf.extend_from_slice(&(total_len as u16).to_be_bytes());
        buf.extend_from_slice(&self.identification.to_be_bytes());
        buf.extend_from_slice(&self.flags_fragment.to_be_bytes());
        buf.push(self.ttl);
        buf.push(self.payload.protocol(false));
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&self.src.octets());
        buf.extend_from_slice(&self.dst.octets());
        buf.extend_from_slice(&self.options);
        buf.resize(header_len, 0);

        let checksum = internet_checksum(&buf[..header_len]);
        buf[10..12].copy_from_slice(&checksum.to_be_bytes());
        buf.extend_from_slice(&payload);
        buf
    }
}
