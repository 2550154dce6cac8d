//! In-memory ports and frame builders
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use vswitch::dataplane::{Port, Switch, SwitchSettings, DEFAULT_MTU};
use vswitch::protocol::arp::ArpPacket;
use vswitch::protocol::ethernet::{EthPayload, EthernetPacket};
use vswitch::protocol::icmp::IcmpPacket;
use vswitch::protocol::icmpv6::{NeighborSolicitation, NDP_HOP_LIMIT};
use vswitch::protocol::ip::{IpPacket, IpPayload};
use vswitch::protocol::ipv6::solicited_node;
use vswitch::protocol::tcp::{TcpFlags, TcpPacket};
use vswitch::protocol::udp::UdpPacket;
use vswitch::protocol::MacAddr;

/// Port that records every transmitted frame
pub struct MemoryPort {
    name: String,
    mtu: usize,
    sent: Mutex<Vec<Vec<u8>>>,
}

impl MemoryPort {
    pub fn new(name: &str, mtu: usize) -> Self {
        Self {
            name: name.to_string(),
            mtu,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn take(&self) -> Vec<EthernetPacket> {
        std::mem::take(&mut *self.sent.lock().unwrap())
            .iter()
            .map(|b| EthernetPacket::parse(b).expect("switch sent a malformed frame"))
            .collect()
    }
}

impl Port for MemoryPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn transmit(&self, frame: &[u8]) -> vswitch::Result<()> {
        self.sent.lock().unwrap().push(frame.to_vec());
        Ok(())
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}

/// A switch with in-memory ports
pub struct Lab {
    pub switch: Arc<Switch>,
    ports: HashMap<String, Arc<MemoryPort>>,
}

impl Lab {
    pub fn new() -> Self {
        Self::with_settings(SwitchSettings::default())
    }

    pub fn with_settings(settings: SwitchSettings) -> Self {
        Self {
            switch: Arc::new(Switch::new(settings)),
            ports: HashMap::new(),
        }
    }

    pub fn network(&self, vni: u32, v4: &str, v6: Option<&str>) {
        self.switch
            .add_network(vni, v4.parse().unwrap(), v6.map(|c| c.parse().unwrap()))
            .unwrap();
    }

    pub fn ip(&self, vni: u32, ip: &str, mac: MacAddr) {
        self.switch.add_ip(vni, ip.parse().unwrap(), mac).unwrap();
    }

    pub fn port(&mut self, name: &str, vni: u32) -> Arc<MemoryPort> {
        self.port_with_mtu(name, vni, DEFAULT_MTU)
    }

    pub fn port_with_mtu(&mut self, name: &str, vni: u32, mtu: usize) -> Arc<MemoryPort> {
        let port = Arc::new(MemoryPort::new(name, mtu));
        self.switch.attach_port(port.clone(), vni).unwrap();
        self.ports.insert(name.to_string(), port.clone());
        port
    }

    pub fn send(&self, port: &str, frame: &EthernetPacket) {
        self.switch.on_frame_received(port, &frame.to_bytes());
    }

    pub fn take(&self, port: &str) -> Vec<EthernetPacket> {
        self.ports[port].take()
    }

    pub fn clear(&self) {
        for port in self.ports.values() {
            port.take();
        }
    }
}

pub fn mac(last: u8) -> MacAddr {
    MacAddr([0x02, 0, 0, 0, 0, last])
}

pub fn v4(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

pub fn v6(s: &str) -> Ipv6Addr {
    s.parse().unwrap()
}

pub fn sock(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

pub fn arp_request(src: MacAddr, sender: &str, target: &str) -> EthernetPacket {
    let arp = ArpPacket::request(src, v4(sender), v4(target));
    EthernetPacket::new(MacAddr::BROADCAST, src, EthPayload::Arp(arp))
}

pub fn neighbor_solicitation(src: MacAddr, sender: &str, target: &str) -> EthernetPacket {
    let target = v6(target);
    let group = solicited_node(&target);
    let ns = NeighborSolicitation::new(target, Some(src));
    let mut ip = IpPacket::new(
        IpAddr::V6(v6(sender)),
        IpAddr::V6(group),
        IpPayload::Icmp(ns.to_icmp()),
    )
    .unwrap();
    ip.set_ttl(NDP_HOP_LIMIT);
    EthernetPacket::new(MacAddr::ipv6_multicast(&group), src, EthPayload::Ip(ip))
}

pub fn ip_frame(src_mac: MacAddr, dst_mac: MacAddr, src: &str, dst: &str, payload: IpPayload) -> EthernetPacket {
    let ip = IpPacket::new(src.parse().unwrap(), dst.parse().unwrap(), payload).unwrap();
    EthernetPacket::new(dst_mac, src_mac, EthPayload::Ip(ip))
}

pub fn udp(src_mac: MacAddr, dst_mac: MacAddr, src: &str, dst: &str, data: &[u8]) -> EthernetPacket {
    let (src, dst) = (sock(src), sock(dst));
    let payload = IpPayload::Udp(UdpPacket::new(src.port(), dst.port(), data.to_vec()));
    ip_frame(src_mac, dst_mac, &src.ip().to_string(), &dst.ip().to_string(), payload)
}

pub fn tcp_segment(src: SocketAddr, dst: SocketAddr, seq: u32, ack: u32, flags: TcpFlags) -> TcpPacket {
    let mut tcp = TcpPacket::new(src.port(), dst.port(), seq, ack, flags);
    tcp.window = 65535;
    tcp
}

pub fn tcp(src_mac: MacAddr, dst_mac: MacAddr, tcp: TcpPacket, src: &str, dst: &str) -> EthernetPacket {
    ip_frame(src_mac, dst_mac, src, dst, IpPayload::Tcp(tcp))
}

pub fn echo_request(src_mac: MacAddr, dst_mac: MacAddr, src: &str, dst: &str) -> EthernetPacket {
    let v6 = src.contains(':');
    let icmp = IcmpPacket::echo_request(v6, 0x1234, 1, b"ping".to_vec());
    ip_frame(src_mac, dst_mac, src, dst, IpPayload::Icmp(icmp))
}

pub fn tcp_of(frame: &EthernetPacket) -> &TcpPacket {
    frame.ip().and_then(IpPacket::tcp).expect("not a TCP frame")
}

pub fn udp_of(frame: &EthernetPacket) -> &UdpPacket {
    frame.ip().and_then(IpPacket::udp).expect("not a UDP frame")
}

pub fn icmp_of(frame: &EthernetPacket) -> &IcmpPacket {
    frame.ip().and_then(IpPacket::icmp).expect("not an ICMP frame")
}
