//! TCP protocol - RFC 9293
//!
//! Segment codec with option decoding (MSS, window scale) used by the
//! switch's L4 responder and NAT.

use super::checksum::transport_checksum;
use super::IpProtocol;
use crate::{Error, Result};
use std::net::IpAddr;

/// Minimum TCP header size (without options)
pub const MIN_HEADER_SIZE: usize = 20;

/// TCP flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
    pub ece: bool,
    pub cwr: bool,
}

impl TcpFlags {
    pub const SYN: TcpFlags = TcpFlags::empty().with_syn();
    pub const ACK: TcpFlags = TcpFlags::empty().with_ack();
    pub const SYN_ACK: TcpFlags = TcpFlags::empty().with_syn().with_ack();
    pub const RST_ACK: TcpFlags = TcpFlags::empty().with_rst().with_ack();
    pub const FIN_ACK: TcpFlags = TcpFlags::empty().with_fin().with_ack();
    pub const PSH_ACK: TcpFlags = TcpFlags::empty().with_psh().with_ack();

    pub const fn empty() -> Self {
        Self {
            fin: false,
            syn: false,
            rst: false,
            psh: false,
            ack: false,
            urg: false,
            ece: false,
            cwr: false,
        }
    }

    const fn with_syn(mut self) -> Self {
        self.syn = true;
        self
    }

    const fn with_ack(mut self) -> Self {
        self.ack = true;
        self
    }

    const fn with_rst(mut self) -> Self {
        self.rst = true;
        self
    }

    const fn with_fin(mut self) -> Self {
        self.fin = true;
        self
    }

    const fn with_psh(mut self) -> Self {
        self.psh = true;
        self
    }

    /// Parse flags from the 13th byte of TCP header
    pub fn from_byte(byte: u8) -> Self {
        Self {
            fin: (byte & 0x01) != 0,
            syn: (byte & 0x02) != 0,
            rst: (byte & 0x04) != 0,
            psh: (byte & 0x08) != 0,
            ack: (byte & 0x10) != 0,
            urg: (byte & 0x20) != 0,
            ece: (byte & 0x40) != 0,
            cwr: (byte & 0x80) != 0,
        }
    }

    pub fn to_byte(&self) -> u8 {
        [
            self.fin, self.syn, self.rst, self.psh, self.ack, self.urg, self.ece, self.cwr,
        ]
        .iter()
        .enumerate()
        .filter(|(_, set)| **set)
        .fold(0u8, |byte, (bit, _)| byte | (1 << bit))
    }

    /// SYN without ACK
    pub fn is_syn_only(&self) -> bool {
        self.syn && !self.ack
    }

    pub fn is_syn_ack(&self) -> bool {
        self.syn && self.ack
    }
}

/// Decoded TCP option
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TcpOption {
    Mss(u16),
    WindowScale(u8),
    SackPermitted,
    Timestamps(u32, u32),
    Unknown { kind: u8, data: Vec<u8> },
}

mod option_kind {
    pub const END: u8 = 0;
    pub const NOP: u8 = 1;
    pub const MSS: u8 = 2;
    pub const WINDOW_SCALE: u8 = 3;
    pub const SACK_PERMITTED: u8 = 4;
    pub const TIMESTAMPS: u8 = 8;
}

impl TcpOption {
    fn parse_all(mut buffer: &[u8]) -> Result<Vec<TcpOption>> {
        let mut options = Vec::new();
        while let Some(&kind) = buffer.first() {
            match kind {
                option_kind::END => break,
                option_kind::NOP => {
                    buffer = &buffer[1..];
                    continue;
                }
                _ => {}
            }
            let len = *buffer
                .get(1)
                .ok_or_else(|| Error::Parse("TCP option truncated".into()))?
                as usize;
            if len < 2 || buffer.len() < len {
                return Err(Error::Parse("invalid TCP option length".into()));
            }
            let data = &buffer[2..len];
            let option = match (kind, data.len()) {
                (option_kind::MSS, 2) => TcpOption::Mss(u16::from_be_bytes([data[0], data[1]])),
                (option_kind::WINDOW_SCALE, 1) => TcpOption::WindowScale(data[0]),
                (option_kind::SACK_PERMITTED, 0) => TcpOption::SackPermitted,
                (option_kind::TIMESTAMPS, 8) => TcpOption::Timestamps(
                    u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
                    u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
                ),
                _ => TcpOption::Unknown {
                    kind,
                    data: data.to_vec(),
                },
            };
            options.push(option);
            buffer = &buffer[len..];
        }
        Ok(options)
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        match self {
            TcpOption::Mss(mss) => {
                buf.extend_from_slice(&[option_kind::MSS, 4]);
                buf.extend_from_slice(&mss.to_be_bytes());
            }
            TcpOption::WindowScale(shift) => {
                // NOP keeps the following option aligned
                buf.extend_from_slice(&[option_kind::NOP, option_kind::WINDOW_SCALE, 3, *shift]);
            }
            TcpOption::SackPermitted => {
                buf.extend_from_slice(&[option_kind::NOP, option_kind::NOP]);
                buf.extend_from_slice(&[option_kind::SACK_PERMITTED, 2]);
            }
            TcpOption::Timestamps(val, echo) => {
                buf.extend_from_slice(&[option_kind::NOP, option_kind::NOP]);
                buf.extend_from_slice(&[option_kind::TIMESTAMPS, 10]);
                buf.extend_from_slice(&val.to_be_bytes());
                buf.extend_from_slice(&echo.to_be_bytes());
            }
            TcpOption::Unknown { kind, data } => {
                buf.push(*kind);
                buf.push((data.len() + 2) as u8);
                buf.extend_from_slice(data);
            }
        }
    }
}

/// Decoded TCP segment
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TcpPacket {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub urgent: u16,
    pub options: Vec<TcpOption>,
    pub payload: Vec<u8>,
}

impl TcpPacket {
    pub fn new(src_port: u16, dst_port: u16, seq: u32, ack: u32, flags: TcpFlags) -> Self {
        Self {
            src_port,
            dst_port,
            seq,
            ack,
            flags,
            ..Default::default()
        }
    }

    pub fn parse(buffer: &[u8]) -> Result<Self> {
        if buffer.len() < MIN_HEADER_SIZE {
            return Err(Error::Parse("TCP header too short".into()));
        }
        let header_len = ((buffer[12] >> 4) as usize) * 4;
        if header_len < MIN_HEADER_SIZE || buffer.len() < header_len {
            return Err(Error::Parse("invalid TCP data offset".into()));
        }

        Ok(Self {
            src_port: u16::from_be_bytes([buffer[0], buffer[1]]),
            dst_port: u16::from_be_bytes([buffer[2], buffer[3]]),
            seq: u32::from_be_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]),
            ack: u32::from_be_bytes([buffer[8], buffer[9], buffer[10], buffer[11]]),
            flags: TcpFlags::from_byte(buffer[13]),
            window: u16::from_be_bytes([buffer[14], buffer[15]]),
            urgent: u16::from_be_bytes([buffer[18], buffer[19]]),
            options: TcpOption::parse_all(&buffer[MIN_HEADER_SIZE..header_len])?,
            payload: buffer[header_len..].to_vec(),
        })
    }

    pub fn mss(&self) -> Option<u16> {
        self.options.iter().find_map(|o| match o {
            TcpOption::Mss(mss) => Some(*mss),
            _ => None,
        })
    }

    pub fn window_scale(&self) -> Option<u8> {
        self.options.iter().find_map(|o| match o {
            TcpOption::WindowScale(shift) => Some(*shift),
            _ => None,
        })
    }

    /// Lower the MSS option to at most `limit`; returns true if it changed
    pub fn clamp_mss(&mut self, limit: u16) -> bool {
        for option in &mut self.options {
            if let TcpOption::Mss(mss) = option
                && *mss > limit
            {
                *mss = limit;
                return true;
            }
        }
        false
    }

    /// Sequence space consumed by this segment (payload plus SYN and FIN)
    pub fn seq_len(&self) -> u32 {
        self.payload.len() as u32 + self.flags.syn as u32 + self.flags.fin as u32
    }

    /// Serialize with the checksum computed over the v4/v6 pseudo-header
    pub fn to_bytes(&self, src: IpAddr, dst: IpAddr) -> Vec<u8> {
        let mut options = Vec::new();
        for option in &self.options {
            option.write_to(&mut options);
        }
        options.resize(options.len().div_ceil(4) * 4, option_kind::END);
        let header_len = MIN_HEADER_SIZE + options.len();

        let mut buf = Vec::with_capacity(header_len + self.payload.len());
        buf.extend_from_slice(&self.src_port.to_be_bytes());
        buf.extend_from_slice(&self.dst_port.to_be_bytes());
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&self.ack.to_be_bytes());
        buf.push(((header_len / 4) as u8) << 4);
        buf.push(self.flags.to_byte());
        buf.extend_from_slice(&self.window.to_be_bytes());
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&self.urgent.to_be_bytes());
        buf.extend_from_slice(&options);
        buf.extend_from_slice(&self.payload);

        let checksum = transport_checksum(src, dst, IpProtocol::Tcp as u8, &buf);
        buf[16..18].copy_from_slice(&checksum.to_be_bytes());
        buf
    }
}
