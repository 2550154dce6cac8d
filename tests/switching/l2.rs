//! Flooding, MAC learning and aging

use super::harness::*;
use std::time::{Duration, Instant};

/// Network 1 (10.0.0.0/24, switch at .1) with ports p1..p3
fn lab() -> Lab {
    let mut lab = Lab::new();
    lab.network(1, "10.0.0.0/24", None);
    lab.ip(1, "10.0.0.1", mac(1));
    lab.port("p1", 1);
    lab.port("p2", 1);
    lab.port("p3", 1);
    lab
}

#[test]
fn test_broadcast_floods_to_other_ports() {
    let lab = lab();
    let frame = arp_request(mac(10), "10.0.0.10", "10.0.0.20");
    lab.send("p1", &frame);

    assert!(lab.take("p1").is_empty());
    for port in ["p2", "p3"] {
        let out = lab.take(port);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to_bytes(), frame.to_bytes());
    }
    assert_eq!(lab.switch.metrics().snapshot().floods, 1);
}

#[test]
fn test_learned_unicast_goes_to_one_port() {
    let lab = lab();
    lab.send("p1", &arp_request(mac(10), "10.0.0.10", "10.0.0.1"));
    lab.send("p2", &arp_request(mac(20), "10.0.0.20", "10.0.0.1"));
    lab.clear();

    let frame = udp(mac(20), mac(10), "10.0.0.20:7000", "10.0.0.10:7000", b"hi");
    lab.send("p2", &frame);

    let out = lab.take("p1");
    assert_eq!(out.len(), 1);
    // forwarded untouched
    assert_eq!(out[0].to_bytes(), frame.to_bytes());
    assert!(lab.take("p2").is_empty());
    assert!(lab.take("p3").is_empty());
}

#[test]
fn test_unknown_unicast_floods_and_solicits() {
    let lab = lab();
    let frame = udp(mac(10), mac(30), "10.0.0.10:7000", "10.0.0.30:7000", b"hi");
    lab.send("p1", &frame);

    let out = lab.take("p2");
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].to_bytes(), frame.to_bytes());
    let arp = out[1].arp().expect("ARP request for the unknown host");
    assert!(arp.is_request());
    assert_eq!(arp.sender_ip, v4("10.0.0.1"));
    assert_eq!(arp.target_ip, v4("10.0.0.30"));
    assert_eq!(out[1].src(), mac(1));

    // the solicitation also goes out the arrival port
    let back = lab.take("p1");
    assert_eq!(back.len(), 1);
    assert!(back[0].arp().is_some());
}

#[test]
fn test_destination_on_arrival_port_dropped() {
    let lab = lab();
    lab.send("p1", &arp_request(mac(20), "10.0.0.20", "10.0.0.1"));
    lab.clear();

    lab.send("p1", &udp(mac(10), mac(20), "10.0.0.10:1", "10.0.0.20:1", b""));
    for port in ["p1", "p2", "p3"] {
        assert!(lab.take(port).is_empty(), "{} got a frame", port);
    }
}

#[test]
fn test_station_move_follows_latest_port() {
    let lab = lab();
    lab.send("p1", &arp_request(mac(10), "10.0.0.10", "10.0.0.1"));
    lab.send("p2", &arp_request(mac(10), "10.0.0.10", "10.0.0.1"));
    lab.clear();

    lab.send("p3", &udp(mac(30), mac(10), "10.0.0.30:1", "10.0.0.10:1", b""));
    assert_eq!(lab.take("p2").len(), 1);
    assert!(lab.take("p1").is_empty());
}

#[test]
fn test_same_source_and_destination_dropped() {
    let lab = lab();
    lab.send("p1", &udp(mac(10), mac(10), "10.0.0.10:1", "10.0.0.11:1", b""));
    for port in ["p1", "p2", "p3"] {
        assert!(lab.take(port).is_empty());
    }
    assert!(lab.switch.mac_entries(1, Instant::now()).unwrap().is_empty());
    let stats = lab.switch.metrics().snapshot();
    assert_eq!(stats.frames_dropped, 1);
    assert_eq!(stats.ports["p1"].rx_drops, 1);
}

#[test]
fn test_networks_are_isolated() {
    let mut lab = lab();
    lab.network(2, "10.0.2.0/24", None);
    lab.port("q1", 2);

    lab.send("p1", &arp_request(mac(10), "10.0.0.10", "10.0.0.20"));
    assert!(lab.take("q1").is_empty());
    assert_eq!(lab.take("p2").len(), 1);
    assert!(lab.switch.mac_entries(2, Instant::now()).unwrap().is_empty());
}

#[test]
fn test_mac_entries_age_out() {
    let lab = lab();
    lab.switch.set_mac_timeout(Duration::from_secs(1));
    lab.send("p1", &arp_request(mac(10), "10.0.0.10", "10.0.0.1"));
    assert_eq!(lab.switch.mac_entries(1, Instant::now()).unwrap().len(), 1);

    lab.switch.tick(Instant::now() + Duration::from_secs(2));
    assert!(lab.switch.mac_entries(1, Instant::now()).unwrap().is_empty());
    lab.clear();

    // unknown again: flooded, followed by an ARP request for 10.0.0.10
    lab.send("p2", &udp(mac(20), mac(10), "10.0.0.20:1", "10.0.0.10:1", b""));
    for port in ["p1", "p3"] {
        let out = lab.take(port);
        assert_eq!(out.len(), 2);
        assert!(out[0].ip().is_some());
        assert!(out[1].arp().is_some());
    }
}

#[test]
fn test_detach_forgets_learned_macs() {
    let lab = lab();
    lab.send("p1", &arp_request(mac(10), "10.0.0.10", "10.0.0.1"));
    lab.switch.detach_port("p1").unwrap();

    assert!(lab.switch.mac_entries(1, Instant::now()).unwrap().is_empty());
    assert_eq!(lab.switch.ports().len(), 2);
    lab.clear();

    // frames for the detached port's hosts flood to the remaining ports
    lab.send("p2", &udp(mac(20), mac(10), "10.0.0.20:1", "10.0.0.10:1", b""));
    assert_eq!(lab.take("p3")[0].dst(), mac(10));
    assert!(lab.take("p1").is_empty());
}

#[test]
fn test_port_counters() {
    let lab = lab();
    let frame = arp_request(mac(10), "10.0.0.10", "10.0.0.20");
    lab.send("p1", &frame);

    let stats = lab.switch.metrics().snapshot();
    assert_eq!(stats.frames_received, 1);
    assert_eq!(stats.ports["p1"].rx_packets, 1);
    assert_eq!(stats.ports["p1"].rx_bytes, frame.to_bytes().len() as u64);
    assert_eq!(stats.ports["p2"].tx_packets, 1);
    assert_eq!(stats.ports["p3"].tx_packets, 1);
}
