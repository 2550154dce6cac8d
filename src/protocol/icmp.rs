//! ICMP (RFC 792) and ICMPv6 (RFC 4443) messages
//!
//! Both families share one message layout: type, code, checksum, four
//! type-specific bytes, then the body. Only the checksum differs (ICMPv6
//! covers the pseudo-header).

use super::checksum::{internet_checksum, transport_checksum};
use super::IpProtocol;
use crate::{Error, Result};
use std::net::IpAddr;

/// ICMP header size (type, code, checksum, rest-of-header)
pub const ICMP_HEADER_SIZE: usize = 8;
/// Bytes of the offending datagram's payload quoted in error messages
pub const QUOTED_PAYLOAD_LEN: usize = 64;

/// ICMPv4 message types
pub mod v4 {
    pub const ECHO_REPLY: u8 = 0;
    pub const DESTINATION_UNREACHABLE: u8 = 3;
    pub const ECHO_REQUEST: u8 = 8;
    pub const TIME_EXCEEDED: u8 = 11;

    /// Destination Unreachable codes
    pub const NET_UNREACHABLE: u8 = 0;
    pub const HOST_UNREACHABLE: u8 = 1;
    pub const PORT_UNREACHABLE: u8 = 3;
}

/// ICMPv6 message types
pub mod v6 {
    pub const DESTINATION_UNREACHABLE: u8 = 1;
    pub const TIME_EXCEEDED: u8 = 3;
    pub const ECHO_REQUEST: u8 = 128;
    pub const ECHO_REPLY: u8 = 129;
    pub const NEIGHBOR_SOLICITATION: u8 = 135;
    pub const NEIGHBOR_ADVERTISEMENT: u8 = 136;

    /// Destination Unreachable codes
    pub const NO_ROUTE: u8 = 0;
    pub const ADDRESS_UNREACHABLE: u8 = 3;
    pub const PORT_UNREACHABLE: u8 = 4;
}

/// ICMP or ICMPv6 message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpPacket {
    pub v6: bool,
    pub icmp_type: u8,
    pub code: u8,
    /// Type-specific header word (echo id/sequence, NA flags, unused)
    pub rest: [u8; 4],
    pub body: Vec<u8>,
}

impl IcmpPacket {
    pub fn new(v6: bool, icmp_type: u8, code: u8, rest: [u8; 4], body: Vec<u8>) -> Self {
        Self {
            v6,
            icmp_type,
            code,
            rest,
            body,
        }
    }

    pub fn parse(buffer: &[u8], v6: bool) -> Result<Self> {
        if buffer.len() < ICMP_HEADER_SIZE {
            return Err(Error::Parse("ICMP message too short".into()));
        }
        Ok(Self {
            v6,
            icmp_type: buffer[0],
            code: buffer[1],
            rest: [buffer[4], buffer[5], buffer[6], buffer[7]],
            body: buffer[ICMP_HEADER_SIZE..].to_vec(),
        })
    }

    pub fn is_echo_request(&self) -> bool {
        let t = if self.v6 { v6::ECHO_REQUEST } else { v4::ECHO_REQUEST };
        self.icmp_type == t && self.code == 0
    }

    pub fn is_echo_reply(&self) -> bool {
        let t = if self.v6 { v6::ECHO_REPLY } else { v4::ECHO_REPLY };
        self.icmp_type == t && self.code == 0
    }

    pub fn echo_request(v6: bool, id: u16, seq: u16, data: Vec<u8>) -> Self {
        let t = if v6 { v6::ECHO_REQUEST } else { v4::ECHO_REQUEST };
        Self::new(v6, t, 0, echo_rest(id, seq), data)
    }

    /// Echo reply carrying this request's identifier, sequence and data
    pub fn echo_reply(&self) -> Self {
        let t = if self.v6 { v6::ECHO_REPLY } else { v4::ECHO_REPLY };
        Self::new(self.v6, t, 0, self.rest, self.body.clone())
    }

    pub fn echo_id(&self) -> u16 {
        u16::from_be_bytes([self.rest[0], self.rest[1]])
    }

    pub fn echo_seq(&self) -> u16 {
        u16::from_be_bytes([self.rest[2], self.rest[3]])
    }

    /// Port unreachable quoting the offending datagram (`original` is its
    /// serialized IP packet)
    pub fn port_unreachable(v6: bool, original: &[u8]) -> Self {
        if v6 {
            Self::error(true, v6::DESTINATION_UNREACHABLE, v6::PORT_UNREACHABLE, original)
        } else {
            Self::error(false, v4::DESTINATION_UNREACHABLE, v4::PORT_UNREACHABLE, original)
        }
    }

    /// Host/address unreachable, used when no route exists
    pub fn host_unreachable(v6: bool, original: &[u8]) -> Self {
        if v6 {
            Self::error(true, v6::DESTINATION_UNREACHABLE, v6::ADDRESS_UNREACHABLE, original)
        } else {
            Self::error(false, v4::DESTINATION_UNREACHABLE, v4::HOST_UNREACHABLE, original)
        }
    }

    /// TTL / hop limit exceeded in transit
    pub fn time_exceeded(v6: bool, original: &[u8]) -> Self {
        let t = if v6 { v6::TIME_EXCEEDED } else { v4::TIME_EXCEEDED };
        Self::error(v6, t, 0, original)
    }

    fn error(v6: bool, icmp_type: u8, code: u8, original: &[u8]) -> Self {
        let header_len = quoted_header_len(original, v6);
        let quoted_len = original.len().min(header_len + QUOTED_PAYLOAD_LEN);
        Self::new(v6, icmp_type, code, [0; 4], original[..quoted_len].to_vec())
    }

    /// Serialize; `src`/`dst` feed the ICMPv6 pseudo-header and are ignored for v4
    pub fn to_bytes(&self, src: IpAddr, dst: IpAddr) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ICMP_HEADER_SIZE + self.body.len());
        buf.push(self.icmp_type);
        buf.push(self.code);
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&self.rest);
        buf.extend_from_slice(&self.body);

        let checksum = if self.v6 {
            transport_checksum(src, dst, IpProtocol::Icmpv6 as u8, &buf)
        } else {
            internet_checksum(&buf)
        };
        buf[2..4].copy_from_slice(&checksum.to_be_bytes());
        buf
    }
}

fn echo_rest(id: u16, seq: u16) -> [u8; 4] {
    let id = id.to_be_bytes();
    let seq = seq.to_be_bytes();
    [id[0], id[1], seq[0], seq[1]]
}

fn quoted_header_len(original: &[u8], v6: bool) -> usize {
    if v6 {
        super::ipv6::HEADER_SIZE
    } else {
        original
            .first()
            .map(|b| ((b & 0x0F) as usize) * 4)
            .unwrap_or(super::ipv4::MIN_HEADER_SIZE)
    }
}
