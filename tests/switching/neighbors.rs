//! ARP and NDP answers and neighbor learning

use super::harness::*;
use std::net::IpAddr;
use std::time::Instant;
use vswitch::protocol::icmpv6::{NeighborAdvertisement, NDP_HOP_LIMIT};
use vswitch::protocol::MacAddr;

fn lab() -> Lab {
    let mut lab = Lab::new();
    lab.network(1, "10.0.0.0/24", Some("fd00::/64"));
    lab.ip(1, "10.0.0.1", mac(1));
    lab.ip(1, "fd00::1", mac(1));
    lab.port("p1", 1);
    lab.port("p2", 1);
    lab
}

fn neighbor(lab: &Lab, ip: &str) -> Option<MacAddr> {
    let ip: IpAddr = ip.parse().unwrap();
    lab.switch
        .neighbor_entries(1, Instant::now())
        .unwrap()
        .into_iter()
        .find(|e| e.key == ip)
        .map(|e| e.value)
}

#[test]
fn test_arp_request_for_local_ip_answered() {
    let lab = lab();
    lab.send("p1", &arp_request(mac(10), "10.0.0.10", "10.0.0.1"));

    let out = lab.take("p1");
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].dst(), mac(10));
    assert_eq!(out[0].src(), mac(1));
    let reply = out[0].arp().unwrap();
    assert!(reply.is_reply());
    assert_eq!(reply.sender_mac, mac(1));
    assert_eq!(reply.sender_ip, v4("10.0.0.1"));
    assert_eq!(reply.target_mac, mac(10));
    assert_eq!(reply.target_ip, v4("10.0.0.10"));

    // the request itself is still flooded
    assert!(lab.take("p2")[0].arp().unwrap().is_request());
    assert_eq!(lab.switch.metrics().snapshot().arp_replies_sent, 1);
}

#[test]
fn test_arp_sender_learned() {
    let lab = lab();
    lab.send("p1", &arp_request(mac(10), "10.0.0.10", "10.0.0.99"));
    assert_eq!(neighbor(&lab, "10.0.0.10"), Some(mac(10)));
    // nobody owns 10.0.0.99
    assert!(lab.take("p1").is_empty());
}

#[test]
fn test_arp_sender_outside_subnet_ignored() {
    let lab = lab();
    lab.send("p1", &arp_request(mac(10), "192.168.5.5", "10.0.0.1"));
    assert_eq!(neighbor(&lab, "192.168.5.5"), None);
}

#[test]
fn test_local_bindings_are_static_neighbors() {
    let lab = lab();
    let entries = lab.switch.neighbor_entries(1, Instant::now()).unwrap();
    let local = entries
        .iter()
        .find(|e| e.key == "10.0.0.1".parse::<IpAddr>().unwrap())
        .unwrap();
    assert_eq!(local.value, mac(1));
    assert!(local.remaining.is_none());
}

#[test]
fn test_removed_ip_no_longer_answered() {
    let lab = lab();
    lab.switch
        .del_ip(1, &"10.0.0.1".parse().unwrap())
        .unwrap();
    lab.send("p1", &arp_request(mac(10), "10.0.0.10", "10.0.0.1"));
    assert!(lab.take("p1").is_empty());
}

#[test]
fn test_neighbor_solicitation_answered() {
    let lab = lab();
    lab.send("p1", &neighbor_solicitation(mac(10), "fd00::10", "fd00::1"));

    let out = lab.take("p1");
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].dst(), mac(10));
    assert_eq!(out[0].src(), mac(1));
    let ip = out[0].ip().unwrap();
    assert_eq!(ip.src(), "fd00::1".parse::<IpAddr>().unwrap());
    assert_eq!(ip.dst(), "fd00::10".parse::<IpAddr>().unwrap());
    assert_eq!(ip.ttl(), NDP_HOP_LIMIT);

    let na = NeighborAdvertisement::from_icmp(icmp_of(&out[0]))
        .unwrap()
        .expect("neighbor advertisement");
    assert_eq!(na.target, v6("fd00::1"));
    assert_eq!(na.target_link_layer, Some(mac(1)));
    assert!(na.solicited);

    assert_eq!(lab.take("p2").len(), 1);
    assert_eq!(neighbor(&lab, "fd00::10"), Some(mac(10)));
    assert_eq!(lab.switch.metrics().snapshot().ndp_advertisements_sent, 1);
}

#[test]
fn test_duplicate_address_probe_answered_to_all_nodes() {
    let lab = lab();
    lab.send("p1", &neighbor_solicitation(mac(10), "::", "fd00::1"));

    let out = lab.take("p1");
    assert_eq!(out.len(), 1);
    let all_nodes = v6("ff02::1");
    assert_eq!(out[0].dst(), MacAddr::ipv6_multicast(&all_nodes));
    assert_eq!(out[0].ip().unwrap().dst(), IpAddr::V6(all_nodes));
    let na = NeighborAdvertisement::from_icmp(icmp_of(&out[0]))
        .unwrap()
        .unwrap();
    assert!(!na.solicited);
    // an unspecified sender teaches nothing
    assert_eq!(neighbor(&lab, "::"), None);
}

#[test]
fn test_solicitation_for_foreign_target_only_flooded() {
    let lab = lab();
    lab.send("p1", &neighbor_solicitation(mac(10), "fd00::10", "fd00::20"));
    assert!(lab.take("p1").is_empty());
    assert_eq!(lab.take("p2").len(), 1);
}
