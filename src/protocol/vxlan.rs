//! VXLAN header (RFC 7348)

use crate::{Error, Result};

pub const HEADER_SIZE: usize = 8;
/// IANA-assigned UDP port
pub const DEFAULT_PORT: u16 = 4789;
/// Largest 24-bit network identifier
pub const MAX_VNI: u32 = 0x00ff_ffff;

/// "VNI present" flag
const FLAG_I: u8 = 0x08;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VxlanHeader {
    pub vni: u32,
}

impl VxlanHeader {
    pub fn new(vni: u32) -> Result<Self> {
        if vni > MAX_VNI {
            return Err(Error::InvalidArgument(format!("vni {} exceeds 24 bits", vni)));
        }
        Ok(Self { vni })
    }

    /// Parse the header, returning it with the inner Ethernet frame
    pub fn parse(buffer: &[u8]) -> Result<(Self, &[u8])> {
        if buffer.len() < HEADER_SIZE {
            return Err(Error::Parse("vxlan packet too short".into()));
        }
        if buffer[0] & FLAG_I == 0 {
            return Err(Error::Parse("vxlan header without vni flag".into()));
        }
        let vni = u32::from_be_bytes([0, buffer[4], buffer[5], buffer[6]]);
        Ok((Self { vni }, &buffer[HEADER_SIZE..]))
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        let vni = self.vni.to_be_bytes();
        buf.extend_from_slice(&[FLAG_I, 0, 0, 0, vni[1], vni[2], vni[3], 0]);
    }

    /// Header followed by `frame`
    pub fn encapsulate(&self, frame: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + frame.len());
        self.write_to(&mut buf);
        buf.extend_from_slice(frame);
        buf
    }
}
