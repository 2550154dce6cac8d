//! UDP protocol - RFC 768

use super::checksum::transport_checksum;
use super::IpProtocol;
use crate::{Error, Result};
use std::net::IpAddr;

/// UDP header size
pub const HEADER_SIZE: usize = 8;

/// Decoded UDP datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpPacket {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: Vec<u8>,
}

impl UdpPacket {
    pub fn new(src_port: u16, dst_port: u16, payload: Vec<u8>) -> Self {
        Self {
            src_port,
            dst_port,
            payload,
        }
    }

    pub fn parse(buffer: &[u8]) -> Result<Self> {
        if buffer.len() < HEADER_SIZE {
            return Err(Error::Parse("UDP header too short".into()));
        }
        let length = u16::from_be_bytes([buffer[4], buffer[5]]) as usize;
        if length < HEADER_SIZE || buffer.len() < length {
            return Err(Error::Parse("invalid UDP length".into()));
        }
        Ok(Self {
            src_port: u16::from_be_bytes([buffer[0], buffer[1]]),
            dst_port: u16::from_be_bytes([buffer[2], buffer[3]]),
            payload: buffer[HEADER_SIZE..length].to_vec(),
        })
    }

    /// Serialize with the checksum computed over the v4/v6 pseudo-header
    pub fn to_bytes(&self, src: IpAddr, dst: IpAddr) -> Vec<u8> {
        let length = HEADER_SIZE + self.payload.len();
        let mut buf = Vec::with_capacity(length);
        buf.extend_from_slice(&self.src_port.to_be_bytes());
        buf.extend_from_slice(&self.dst_port.to_be_bytes());
        buf.extend_from_slice(&(length as u16).to_be_bytes());
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&self.payload);

        let mut checksum = transport_checksum(src, dst, IpProtocol::Udp as u8, &buf);
        if checksum == 0 {
            // zero means "no checksum" on the wire
            checksum = 0xFFFF;
        }
        buf[6..8].copy_from_slice(&checksum.to_be_bytes());
        buf
    }
}
