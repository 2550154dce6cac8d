//! NDP (Neighbor Discovery Protocol) - RFC 4861
//!
//! Neighbor Solicitation / Advertisement bodies carried in ICMPv6 messages.

use super::icmp::{v6, IcmpPacket};
use super::MacAddr;
use crate::{Error, Result};
use std::net::Ipv6Addr;

/// NDP option types
mod option_type {
    pub const SOURCE_LINK_LAYER: u8 = 1;
    pub const TARGET_LINK_LAYER: u8 = 2;
}

/// NA flag bits in the first byte after the checksum
mod na_flags {
    pub const ROUTER: u8 = 0x80;
    pub const SOLICITED: u8 = 0x40;
    pub const OVERRIDE: u8 = 0x20;
}

/// RFC 4861 requires hop limit 255 on every ND message
pub const NDP_HOP_LIMIT: u8 = 255;

/// Neighbor Solicitation (type 135)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborSolicitation {
    pub target: Ipv6Addr,
    pub source_link_layer: Option<MacAddr>,
}

/// Neighbor Advertisement (type 136)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborAdvertisement {
    pub router: bool,
    pub solicited: bool,
    pub override_flag: bool,
    pub target: Ipv6Addr,
    pub target_link_layer: Option<MacAddr>,
}

fn target_from(body: &[u8]) -> Result<Ipv6Addr> {
    let octets: [u8; 16] = body
        .get(..16)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| Error::Parse("NDP target truncated".into()))?;
    Ok(Ipv6Addr::from(octets))
}

/// Find a link-layer address option of `kind` in the option area
fn find_link_layer(mut options: &[u8], kind: u8) -> Result<Option<MacAddr>> {
    while options.len() >= 2 {
        let len = options[1] as usize * 8;
        if len == 0 || options.len() < len {
            return Err(Error::Parse("invalid NDP option length".into()));
        }
        if options[0] == kind && len >= 8 {
            return Ok(MacAddr::from_slice(&options[2..8]));
        }
        options = &options[len..];
    }
    Ok(None)
}

fn link_layer_option(kind: u8, mac: MacAddr) -> [u8; 8] {
    let mut opt = [0u8; 8];
    opt[0] = kind;
    opt[1] = 1;
    opt[2..8].copy_from_slice(&mac.0);
    opt
}

impl NeighborSolicitation {
    pub fn new(target: Ipv6Addr, source_link_layer: Option<MacAddr>) -> Self {
        Self {
            target,
            source_link_layer,
        }
    }

    /// Decode from an ICMPv6 message; `None` if it is not an NS
    pub fn from_icmp(icmp: &IcmpPacket) -> Result<Option<Self>> {
        if !icmp.v6 || icmp.icmp_type != v6::NEIGHBOR_SOLICITATION || icmp.code != 0 {
            return Ok(None);
        }
        let target = target_from(&icmp.body)?;
        let source_link_layer =
            find_link_layer(&icmp.body[16..], option_type::SOURCE_LINK_LAYER)?;
        Ok(Some(Self {
            target,
            source_link_layer,
        }))
    }

    pub fn to_icmp(&self) -> IcmpPacket {
        let mut body = self.target.octets().to_vec();
        if let Some(mac) = self.source_link_layer {
            body.extend_from_slice(&link_layer_option(option_type::SOURCE_LINK_LAYER, mac));
        }
        IcmpPacket::new(true, v6::NEIGHBOR_SOLICITATION, 0, [0; 4], body)
    }
}

impl NeighborAdvertisement {
    /// Solicited advertisement answering for `target` with `mac`
    pub fn solicited(target: Ipv6Addr, mac: MacAddr) -> Self {
        Self {
            router: false,
            solicited: true,
            override_flag: true,
            target,
            target_link_layer: Some(mac),
        }
    }

    /// Decode from an ICMPv6 message; `None` if it is not an NA
    pub fn from_icmp(icmp: &IcmpPacket) -> Result<Option<Self>> {
        if !icmp.v6 || icmp.icmp_type != v6::NEIGHBOR_ADVERTISEMENT || icmp.code != 0 {
            return Ok(None);
        }
        let target = target_from(&icmp.body)?;
        let target_link_layer =
            find_link_layer(&icmp.body[16..], option_type::TARGET_LINK_LAYER)?;
        let flags = icmp.rest[0];
        Ok(Some(Self {
            router: flags & na_flags::ROUTER != 0,
            solicited: flags & na_flags::SOLICITED != 0,
            override_flag: flags & na_flags::OVERRIDE != 0,
            target,
            target_link_layer,
        }))
    }

    pub fn to_icmp(&self) -> IcmpPacket {
        let mut flags = 0u8;
        if self.router {
            flags |= na_flags::ROUTER;
        }
        if self.solicited {
            flags |= na_flags::SOLICITED;
        }
        if self.override_flag {
            flags |= na_flags::OVERRIDE;
        }
        let mut body = self.target.octets().to_vec();
        if let Some(mac) = self.target_link_layer {
            body.extend_from_slice(&link_layer_option(option_type::TARGET_LINK_LAYER, mac));
        }
        IcmpPacket::new(true, v6::NEIGHBOR_ADVERTISEMENT, 0, [flags, 0, 0, 0], body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn mac() -> MacAddr {
        MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x01])
    }

    fn reparse(icmp: &IcmpPacket) -> IcmpPacket {
        let src = IpAddr::V6("fe80::1".parse().unwrap());
        let dst = IpAddr::V6("ff02::1".parse().unwrap());
        IcmpPacket::parse(&icmp.to_bytes(src, dst), true).unwrap()
    }

    #[test]
    fn test_ns_roundtrip() {
        let ns = NeighborSolicitation::new("fd00::2".parse().unwrap(), Some(mac()));
        let icmp = reparse(&ns.to_icmp());
        assert_eq!(icmp.icmp_type, 135);
        assert_eq!(icmp.body.len(), 24);
        assert_eq!(NeighborSolicitation::from_icmp(&icmp).unwrap(), Some(ns));
    }

    #[test]
    fn test_ns_without_option() {
        let ns = NeighborSolicitation::new("fd00::2".parse().unwrap(), None);
        let icmp = reparse(&ns.to_icmp());
        let parsed = NeighborSolicitation::from_icmp(&icmp).unwrap().unwrap();
        assert_eq!(parsed.source_link_layer, None);
    }

    #[test]
    fn test_na_roundtrip() {
        let na = NeighborAdvertisement::solicited("fd00::1".parse().unwrap(), mac());
        let icmp = reparse(&na.to_icmp());
        assert_eq!(icmp.rest[0], 0x60);
        let parsed = NeighborAdvertisement::from_icmp(&icmp).unwrap().unwrap();
        assert!(parsed.solicited);
        assert!(parsed.override_flag);
        assert!(!parsed.router);
        assert_eq!(parsed.target_link_layer, Some(mac()));
    }

    #[test]
    fn test_other_types_ignored() {
        let echo = IcmpPacket::echo_request(true, 1, 1, vec![]);
        assert_eq!(NeighborSolicitation::from_icmp(&echo).unwrap(), None);
        assert_eq!(NeighborAdvertisement::from_icmp(&echo).unwrap(), None);
    }

    #[test]
    fn test_truncated_target() {
        let icmp = IcmpPacket::new(true, 135, 0, [0; 4], vec![0; 8]);
        assert!(NeighborSolicitation::from_icmp(&icmp).is_err());
    }

    #[test]
    fn test_zero_length_option() {
        let mut body = vec![0u8; 16];
        body.extend_from_slice(&[1, 0, 0, 0, 0, 0, 0, 0]);
        let icmp = IcmpPacket::new(true, 135, 0, [0; 4], body);
        assert!(NeighborSolicitation::from_icmp(&icmp).is_err());
    }
}
