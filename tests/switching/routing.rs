//! ICMP answers, refusals and routing between networks

use super::harness::*;
use vswitch::dataplane::{RouteRule, RouteTarget};
use vswitch::protocol::icmp::v4 as icmpv4;
use vswitch::protocol::tcp::TcpFlags;

const HOST_A: &str = "10.0.0.10";
const HOST_B: &str = "10.0.2.20";

/// Network 1 (10.0.0.0/24, p1) and network 2 (10.0.2.0/24, q1) routed to
/// each other; host A on p1 and host B on q1 have resolved their gateways
fn lab() -> Lab {
    let mut lab = Lab::new();
    lab.network(1, "10.0.0.0/24", Some("fd00::/64"));
    lab.ip(1, "10.0.0.1", mac(1));
    lab.ip(1, "fd00::1", mac(1));
    lab.network(2, "10.0.2.0/24", None);
    lab.ip(2, "10.0.2.1", mac(2));
    lab.port("p1", 1);
    lab.port("q1", 2);

    let to_2 = RouteRule::new("to-2", "10.0.2.0/24".parse().unwrap(), RouteTarget::Network(2));
    let to_1 = RouteRule::new("to-1", "10.0.0.0/24".parse().unwrap(), RouteTarget::Network(1));
    lab.switch.add_route(1, to_2).unwrap();
    lab.switch.add_route(2, to_1).unwrap();

    lab.send("p1", &arp_request(mac(10), HOST_A, "10.0.0.1"));
    lab.send("q1", &arp_request(mac(20), HOST_B, "10.0.2.1"));
    lab.clear();
    lab
}

#[test]
fn test_echo_request_answered() {
    let lab = lab();
    lab.send("p1", &echo_request(mac(10), mac(1), HOST_A, "10.0.0.1"));

    let out = lab.take("p1");
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].dst(), mac(10));
    assert_eq!(out[0].src(), mac(1));
    let icmp = icmp_of(&out[0]);
    assert!(icmp.is_echo_reply());
    assert_eq!(icmp.echo_id(), 0x1234);
    assert_eq!(icmp.body, b"ping");
    assert_eq!(lab.switch.metrics().snapshot().icmp_echo_replies, 1);
}

#[test]
fn test_echo_request_v6_answered() {
    let lab = lab();
    lab.send("p1", &neighbor_solicitation(mac(10), "fd00::10", "fd00::1"));
    lab.clear();

    lab.send("p1", &echo_request(mac(10), mac(1), "fd00::10", "fd00::1"));
    let out = lab.take("p1");
    assert_eq!(out.len(), 1);
    let icmp = icmp_of(&out[0]);
    assert!(icmp.v6);
    assert!(icmp.is_echo_reply());
}

#[test]
fn test_closed_udp_port_unreachable() {
    let lab = lab();
    let datagram = udp(mac(10), mac(1), "10.0.0.10:5000", "10.0.0.1:9", b"x");
    lab.send("p1", &datagram);

    let out = lab.take("p1");
    assert_eq!(out.len(), 1);
    let icmp = icmp_of(&out[0]);
    assert_eq!(icmp.icmp_type, icmpv4::DESTINATION_UNREACHABLE);
    assert_eq!(icmp.code, icmpv4::PORT_UNREACHABLE);
    // quotes the offending datagram starting with its IP header
    let original = datagram.ip().unwrap().to_bytes();
    assert_eq!(&icmp.body[..20], &original[..20]);
    assert_eq!(lab.switch.metrics().snapshot().icmp_port_unreachable, 1);
}

#[test]
fn test_closed_tcp_port_reset() {
    let lab = lab();
    let syn = tcp_segment(sock("10.0.0.10:40000"), sock("10.0.0.1:22"), 5000, 0, TcpFlags::SYN);
    lab.send("p1", &tcp(mac(10), mac(1), syn, HOST_A, "10.0.0.1"));

    let out = lab.take("p1");
    assert_eq!(out.len(), 1);
    let rst = tcp_of(&out[0]);
    assert!(rst.flags.rst && rst.flags.ack);
    assert_eq!(rst.ack, 5001);
    assert_eq!(rst.src_port, 22);
    assert_eq!(rst.dst_port, 40000);
}

#[test]
fn test_routed_between_networks() {
    let lab = lab();
    let frame = udp(mac(10), mac(1), "10.0.0.10:5000", "10.0.2.20:53", b"query");
    lab.send("p1", &frame);

    assert!(lab.take("p1").is_empty());
    let out = lab.take("q1");
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].src(), mac(2));
    assert_eq!(out[0].dst(), mac(20));
    let ip = out[0].ip().unwrap();
    assert_eq!(ip.ttl(), frame.ip().unwrap().ttl() - 1);
    assert_eq!(udp_of(&out[0]).payload, b"query");
    assert_eq!(lab.switch.metrics().snapshot().packets_routed, 1);

    // and back
    lab.send("q1", &udp(mac(20), mac(2), "10.0.2.20:53", "10.0.0.10:5000", b"answer"));
    let back = lab.take("p1");
    assert_eq!(back.len(), 1);
    assert_eq!(back[0].src(), mac(1));
    assert_eq!(back[0].dst(), mac(10));
}

#[test]
fn test_unresolved_destination_solicited_and_dropped() {
    let lab = lab();
    lab.send("p1", &udp(mac(10), mac(1), "10.0.0.10:5000", "10.0.2.30:53", b"query"));

    let out = lab.take("q1");
    assert_eq!(out.len(), 1);
    let arp = out[0].arp().expect("ARP request in the target network");
    assert_eq!(arp.sender_ip, v4("10.0.2.1"));
    assert_eq!(arp.target_ip, v4("10.0.2.30"));

    // once the host answers, the next packet gets through
    lab.send("q1", &arp_request(mac(30), "10.0.2.30", "10.0.2.1"));
    lab.clear();
    lab.send("p1", &udp(mac(10), mac(1), "10.0.0.10:5000", "10.0.2.30:53", b"query"));
    let out = lab.take("q1");
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].dst(), mac(30));
}

#[test]
fn test_ttl_expiry_answered_with_time_exceeded() {
    let lab = lab();
    let mut frame = udp(mac(10), mac(1), "10.0.0.10:5000", "10.0.2.20:53", b"query");
    frame.ip_mut().unwrap().set_ttl(1);
    lab.send("p1", &frame);

    assert!(lab.take("q1").is_empty());
    let out = lab.take("p1");
    assert_eq!(out.len(), 1);
    let icmp = icmp_of(&out[0]);
    assert_eq!(icmp.icmp_type, icmpv4::TIME_EXCEEDED);
    assert_eq!(icmp.code, 0);
    assert_eq!(out[0].ip().unwrap().src(), "10.0.0.1".parse::<std::net::IpAddr>().unwrap());
}

#[test]
fn test_no_route_refused() {
    let lab = lab();
    lab.send("p1", &udp(mac(10), mac(1), "10.0.0.10:5000", "172.16.0.1:53", b"q"));
    let out = lab.take("p1");
    assert_eq!(out.len(), 1);
    assert_eq!(icmp_of(&out[0]).code, icmpv4::PORT_UNREACHABLE);

    let syn = tcp_segment(sock("10.0.0.10:40000"), sock("172.16.0.1:443"), 1, 0, TcpFlags::SYN);
    lab.send("p1", &tcp(mac(10), mac(1), syn, HOST_A, "172.16.0.1"));
    let out = lab.take("p1");
    assert_eq!(out.len(), 1);
    assert!(tcp_of(&out[0]).flags.rst);
}

#[test]
fn test_gateway_route() {
    let lab = lab();
    let upstream = RouteRule::new(
        "upstream",
        "0.0.0.0/0".parse().unwrap(),
        RouteTarget::Gateway("10.0.0.254".parse().unwrap()),
    );
    lab.switch.add_route(1, upstream).unwrap();

    // gateway unknown: ARP for it, packet dropped
    lab.send("p1", &udp(mac(10), mac(1), "10.0.0.10:5000", "8.8.8.8:53", b"q"));
    let out = lab.take("p1");
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].arp().unwrap().target_ip, v4("10.0.0.254"));

    lab.send("p1", &arp_request(mac(50), "10.0.0.254", "10.0.0.1"));
    lab.clear();

    lab.send("p1", &udp(mac(10), mac(1), "10.0.0.10:5000", "8.8.8.8:53", b"q"));
    let out = lab.take("p1");
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].dst(), mac(50));
    assert_eq!(out[0].src(), mac(1));
    assert_eq!(
        out[0].ip().unwrap().dst(),
        "8.8.8.8".parse::<std::net::IpAddr>().unwrap()
    );
}

#[test]
fn test_route_management() {
    let lab = lab();
    let routes = lab.switch.routes(1).unwrap();
    let aliases: Vec<_> = routes.iter().map(|r| r.alias.as_str()).collect();
    assert!(aliases.contains(&"default"));
    assert!(aliases.contains(&"default-v6"));
    assert!(aliases.contains(&"to-2"));

    lab.switch.del_route(1, "to-2").unwrap();
    assert!(lab.switch.del_route(1, "to-2").is_err());

    // without the rule the destination is unroutable
    lab.send("p1", &udp(mac(10), mac(1), "10.0.0.10:5000", "10.0.2.20:53", b"q"));
    assert!(lab.take("q1").is_empty());
    assert!(icmp_of(&lab.take("p1")[0]).icmp_type == icmpv4::DESTINATION_UNREACHABLE);
}
