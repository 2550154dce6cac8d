//! Source NAT between a private and a public network

use super::harness::*;
use std::sync::Arc;
use vswitch::dataplane::{
    Cidr, FilterHelper, FilterResult, MssRewrite, PacketContext, PacketFilter, RouteRule,
    RouteTarget, SNatPool, SwitchSettings,
};
use vswitch::protocol::tcp::{TcpFlags, TcpOption};

const PUBLIC: &str = "192.0.2.1";
const SERVER: &str = "192.0.2.50";

/// SNAT everything leaving the private subnet through `pool`
struct Masquerade {
    private: Cidr,
    pool: &'static str,
}

impl PacketFilter for Masquerade {
    fn handle(&self, helper: &FilterHelper<'_>, ctx: &mut PacketContext) -> FilterResult {
        let outbound = ctx
            .packet
            .ip()
            .is_some_and(|ip| ip.ports().is_some() && !self.private.contains(&ip.dst()));
        if !outbound || helper.execute_nat(ctx) {
            return FilterResult::Pass;
        }
        match helper.execute_snat(ctx, self.pool) {
            Ok(()) => FilterResult::Pass,
            Err(_) => FilterResult::Drop,
        }
    }
}

/// Translate replies of existing sessions
struct Untranslate;

impl PacketFilter for Untranslate {
    fn handle(&self, helper: &FilterHelper<'_>, ctx: &mut PacketContext) -> FilterResult {
        helper.execute_nat(ctx);
        FilterResult::Pass
    }
}

/// Private network 1 behind port "inside", public network 2 on "outside"
fn lab_with(settings: SwitchSettings, inside_mtu: usize, outside_mtu: usize, pool: &str) -> Lab {
    let mut lab = Lab::with_settings(settings);
    lab.network(1, "10.0.0.0/24", None);
    lab.ip(1, "10.0.0.1", mac(1));
    lab.network(2, "192.0.2.0/24", None);
    lab.ip(2, PUBLIC, mac(2));
    lab.port_with_mtu("inside", 1, inside_mtu);
    lab.port_with_mtu("outside", 2, outside_mtu);

    let switch = &lab.switch;
    switch
        .add_route(1, RouteRule::new("public", "192.0.2.0/24".parse().unwrap(), RouteTarget::Network(2)))
        .unwrap();
    switch
        .add_route(2, RouteRule::new("private", "10.0.0.0/24".parse().unwrap(), RouteTarget::Network(1)))
        .unwrap();
    switch.add_nat_pool("public", pool.parse::<SNatPool>().unwrap()).unwrap();

    let masquerade: Arc<dyn PacketFilter> = Arc::new(Masquerade {
        private: "10.0.0.0/24".parse().unwrap(),
        pool: "public",
    });
    switch.add_ingress_filter("inside", masquerade).unwrap();
    switch.add_ingress_filter("outside", Arc::new(Untranslate)).unwrap();

    lab.send("inside", &arp_request(mac(10), "10.0.0.10", "10.0.0.1"));
    lab.send("outside", &arp_request(mac(50), SERVER, PUBLIC));
    lab.clear();
    lab
}

fn lab() -> Lab {
    lab_with(SwitchSettings::default(), 1500, 1500, "192.0.2.1:20000-20099")
}

fn syn_with_mss(mss: u16) -> vswitch::protocol::ethernet::EthernetPacket {
    let mut syn = tcp_segment(sock("10.0.0.10:40000"), sock("192.0.2.50:80"), 100, 0, TcpFlags::SYN);
    syn.options.push(TcpOption::Mss(mss));
    tcp(mac(10), mac(1), syn, "10.0.0.10", SERVER)
}

#[test]
fn test_outbound_source_translated() {
    let lab = lab();
    lab.send("inside", &udp(mac(10), mac(1), "10.0.0.10:5000", "192.0.2.50:53", b"query"));

    let out = lab.take("outside");
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].src(), mac(2));
    assert_eq!(out[0].dst(), mac(50));
    let ip = out[0].ip().unwrap();
    assert_eq!(ip.src().to_string(), PUBLIC);
    assert_eq!(ip.dst().to_string(), SERVER);
    assert_eq!(udp_of(&out[0]).src_port, 20000);
    assert_eq!(udp_of(&out[0]).dst_port, 53);

    let sessions = lab.switch.nat_sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].original().src, sock("10.0.0.10:5000"));
    assert_eq!(sessions[0].translated().src, sock("192.0.2.1:20000"));
    assert_eq!(lab.switch.metrics().snapshot().nat_sessions_created, 1);
}

#[test]
fn test_reply_translated_back() {
    let lab = lab();
    lab.send("inside", &udp(mac(10), mac(1), "10.0.0.10:5000", "192.0.2.50:53", b"query"));
    lab.clear();

    lab.send("outside", &udp(mac(50), mac(2), "192.0.2.50:53", "192.0.2.1:20000", b"answer"));
    assert!(lab.take("outside").is_empty());
    let out = lab.take("inside");
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].dst(), mac(10));
    let ip = out[0].ip().unwrap();
    assert_eq!(ip.src().to_string(), SERVER);
    assert_eq!(ip.dst().to_string(), "10.0.0.10");
    let datagram = udp_of(&out[0]);
    assert_eq!(datagram.dst_port, 5000);
    assert_eq!(datagram.payload, b"answer");

    // the same flow keeps its session
    lab.send("inside", &udp(mac(10), mac(1), "10.0.0.10:5000", "192.0.2.50:53", b"again"));
    assert_eq!(udp_of(&lab.take("outside")[0]).src_port, 20000);
    assert_eq!(lab.switch.nat_sessions().len(), 1);
}

#[test]
fn test_unsolicited_inbound_not_translated() {
    let lab = lab();
    lab.send("outside", &udp(mac(50), mac(2), "192.0.2.50:53", "192.0.2.1:20000", b"x"));
    // addressed to the switch itself with nothing listening
    assert!(lab.take("inside").is_empty());
    assert_eq!(lab.switch.metrics().snapshot().icmp_port_unreachable, 1);
}

#[test]
fn test_pool_exhaustion_drops_new_flows() {
    let lab = lab_with(SwitchSettings::default(), 1500, 1500, "192.0.2.1:20000-20000");
    lab.send("inside", &udp(mac(10), mac(1), "10.0.0.10:5000", "192.0.2.50:53", b"a"));
    assert_eq!(lab.take("outside").len(), 1);

    lab.send("inside", &udp(mac(10), mac(1), "10.0.0.10:5001", "192.0.2.50:53", b"b"));
    assert!(lab.take("outside").is_empty());

    let stats = lab.switch.metrics().snapshot();
    assert_eq!(stats.nat_allocation_failures, 1);
    assert_eq!(stats.filter_dropped, 1);
    assert_eq!(lab.switch.nat_sessions().len(), 1);

    // another destination can still reuse the port
    lab.send("outside", &arp_request(mac(51), "192.0.2.51", PUBLIC));
    lab.clear();
    lab.send("inside", &udp(mac(10), mac(1), "10.0.0.10:5001", "192.0.2.51:53", b"c"));
    assert_eq!(udp_of(&lab.take("outside")[0]).src_port, 20000);
}

#[test]
fn test_syn_mss_clamped_on_egress() {
    let lab = lab_with(SwitchSettings::default(), 1500, 1300, "192.0.2.1:20000-20099");
    lab.send("inside", &syn_with_mss(1460));

    let out = lab.take("outside");
    assert_eq!(out.len(), 1);
    let syn = tcp_of(&out[0]);
    assert_eq!(syn.mss(), Some(1260));
    assert_eq!(syn.src_port, 20000);
}

#[test]
fn test_immediate_mss_rewrite_uses_arrival_port() {
    let settings = SwitchSettings {
        mss_rewrite: MssRewrite::Immediate,
        ..SwitchSettings::default()
    };
    let lab = lab_with(settings, 1400, 1500, "192.0.2.1:20000-20099");
    lab.send("inside", &syn_with_mss(1460));
    assert_eq!(tcp_of(&lab.take("outside")[0]).mss(), Some(1360));
}

#[test]
fn test_deferred_mss_rewrite_ignores_arrival_port() {
    let lab = lab_with(SwitchSettings::default(), 1400, 1500, "192.0.2.1:20000-20099");
    lab.send("inside", &syn_with_mss(1460));
    assert_eq!(tcp_of(&lab.take("outside")[0]).mss(), Some(1460));
}

#[test]
fn test_nat_pool_management() {
    let lab = lab();
    assert!(lab
        .switch
        .add_nat_pool("public", "192.0.2.1:30000-30099".parse().unwrap())
        .is_err());
    assert_eq!(lab.switch.nat_pool("public").unwrap().range(), (20000, 20099));
    lab.switch.del_nat_pool("public").unwrap();
    assert!(lab.switch.nat_pool("public").is_none());

    // without the pool new flows cannot be translated
    lab.send("inside", &udp(mac(10), mac(1), "10.0.0.10:5000", "192.0.2.50:53", b"q"));
    assert!(lab.take("outside").is_empty());
}
