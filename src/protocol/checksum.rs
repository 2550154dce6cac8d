//! Internet checksum (RFC 1071) and transport pseudo-headers

use std::net::IpAddr;

/// Sum 16-bit big-endian words, padding an odd trailing byte with zero
fn sum_words(data: &[u8], mut sum: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([chunk[0], chunk[1]]) as u32);
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add(u16::from_be_bytes([*last, 0]) as u32);
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Checksum over a byte range (IPv4 header, ICMPv4 message)
pub fn internet_checksum(data: &[u8]) -> u16 {
    fold(sum_words(data, 0))
}

/// Partial sum of the v4 or v6 pseudo-header
///
/// Mixed address families yield the sum of the native encodings and are
/// never produced by the codec.
fn pseudo_header_sum(src: IpAddr, dst: IpAddr, protocol: u8, length: u32) -> u32 {
    let mut sum = match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => sum_words(&d.octets(), sum_words(&s.octets(), 0)),
        (s, d) => {
            let s = match s {
                IpAddr::V4(v4) => v4.to_ipv6_mapped(),
                IpAddr::V6(v6) => v6,
            };
            let d = match d {
                IpAddr::V4(v4) => v4.to_ipv6_mapped(),
                IpAddr::V6(v6) => v6,
            };
            sum_words(&d.octets(), sum_words(&s.octets(), 0))
        }
    };
    sum = sum.wrapping_add(protocol as u32);
    sum = sum.wrapping_add(length >> 16);
    sum.wrapping_add(length & 0xFFFF)
}

/// Checksum of a TCP/UDP/ICMPv6 message including its pseudo-header
///
/// The checksum field inside `segment` must be zero.
pub fn transport_checksum(src: IpAddr, dst: IpAddr, protocol: u8, segment: &[u8]) -> u16 {
    let sum = pseudo_header_sum(src, dst, protocol, segment.len() as u32);
    fold(sum_words(segment, sum))
}

/// Verify a message whose checksum field is filled in
pub fn verify_transport(src: IpAddr, dst: IpAddr, protocol: u8, segment: &[u8]) -> bool {
    transport_checksum(src, dst, protocol, segment) == 0
}
