//! Ingress and egress filter chains

use super::harness::*;
use std::sync::Arc;
use std::time::Instant;
use vswitch::dataplane::{
    FilterHelper, FilterResult, MatchRule, PacketContext, PacketFilter, RuleFilter,
};
use vswitch::protocol::IpProtocol;

fn lab() -> Lab {
    let mut lab = Lab::new();
    lab.network(1, "10.0.0.0/24", None);
    lab.ip(1, "10.0.0.1", mac(1));
    lab.port("p1", 1);
    lab.port("p2", 1);
    lab.port("p3", 1);
    lab.send("p1", &arp_request(mac(10), "10.0.0.10", "10.0.0.1"));
    lab.send("p2", &arp_request(mac(20), "10.0.0.20", "10.0.0.1"));
    lab.clear();
    lab
}

fn rules(rules: Vec<MatchRule>) -> Arc<dyn PacketFilter> {
    let mut filter = RuleFilter::new();
    for rule in rules {
        filter.add_rule(rule);
    }
    Arc::new(filter)
}

fn dns_rule(action: FilterResult) -> MatchRule {
    let mut rule = MatchRule::new(action);
    rule.protocol = Some(IpProtocol::Udp);
    rule.dst_ports = Some((53, 53));
    rule
}

/// Bounce every frame back to its sender
struct Reflector;

impl PacketFilter for Reflector {
    fn handle(&self, _helper: &FilterHelper<'_>, ctx: &mut PacketContext) -> FilterResult {
        let (src, dst) = (ctx.packet.src(), ctx.packet.dst());
        ctx.packet.set_src(dst);
        ctx.packet.set_dst(src);
        FilterResult::L4Tx
    }
}

/// Copy every frame to a monitor port
struct Mirror {
    to: &'static str,
    bypass_egress: bool,
}

impl PacketFilter for Mirror {
    fn handle(&self, helper: &FilterHelper<'_>, ctx: &mut PacketContext) -> FilterResult {
        if self.bypass_egress {
            helper.redirect(self.to, ctx.packet.clone());
        } else {
            helper.send_packet(self.to, ctx.packet.clone());
        }
        FilterResult::Pass
    }
}

#[test]
fn test_rule_filter_drops_matching_frames() {
    let lab = lab();
    lab.switch.add_ingress_filter("p1", rules(vec![dns_rule(FilterResult::Drop)])).unwrap();

    lab.send("p1", &udp(mac(10), mac(20), "10.0.0.10:5000", "10.0.0.20:53", b"q"));
    assert!(lab.take("p2").is_empty());
    assert_eq!(lab.switch.metrics().snapshot().filter_dropped, 1);

    lab.send("p1", &udp(mac(10), mac(20), "10.0.0.10:5000", "10.0.0.20:54", b"q"));
    assert_eq!(lab.take("p2").len(), 1);
}

#[test]
fn test_ingress_drop_skips_learning() {
    let lab = lab();
    lab.switch
        .add_ingress_filter("p3", rules(vec![MatchRule::new(FilterResult::Drop)]))
        .unwrap();
    lab.send("p3", &arp_request(mac(30), "10.0.0.30", "10.0.0.1"));

    let learned = lab.switch.mac_entries(1, Instant::now()).unwrap();
    assert!(learned.iter().all(|e| e.key != mac(30)));
    for port in ["p1", "p2", "p3"] {
        assert!(lab.take(port).is_empty());
    }
}

#[test]
fn test_redirect_bypasses_pipeline() {
    let lab = lab();
    let mut to_p3 = MatchRule::new(FilterResult::Redirect("p3".into()));
    to_p3.dst = Some("10.0.0.20/32".parse().unwrap());
    lab.switch.add_ingress_filter("p1", rules(vec![to_p3])).unwrap();
    // redirected frames skip p3's egress chain
    lab.switch
        .add_egress_filter("p3", rules(vec![MatchRule::new(FilterResult::Drop)]))
        .unwrap();

    let frame = udp(mac(10), mac(20), "10.0.0.10:5000", "10.0.0.20:53", b"q");
    lab.send("p1", &frame);
    assert!(lab.take("p2").is_empty());
    let out = lab.take("p3");
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].to_bytes(), frame.to_bytes());
    assert_eq!(lab.switch.metrics().snapshot().filter_redirected, 1);
}

#[test]
fn test_l4tx_returns_frame_to_arrival_port() {
    let lab = lab();
    lab.switch.add_ingress_filter("p1", Arc::new(Reflector)).unwrap();

    lab.send("p1", &udp(mac(10), mac(20), "10.0.0.10:5000", "10.0.0.20:7", b"echo"));
    assert!(lab.take("p2").is_empty());
    let out = lab.take("p1");
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].src(), mac(20));
    assert_eq!(out[0].dst(), mac(10));
    assert_eq!(udp_of(&out[0]).payload, b"echo");
    assert_eq!(lab.switch.metrics().snapshot().filter_tx_back, 1);
}

#[test]
fn test_first_decisive_filter_wins() {
    let lab = lab();
    lab.switch
        .add_ingress_filter("p1", rules(vec![dns_rule(FilterResult::Pass)]))
        .unwrap();
    lab.switch
        .add_ingress_filter("p1", rules(vec![dns_rule(FilterResult::Drop)]))
        .unwrap();
    lab.switch.add_ingress_filter("p1", Arc::new(Reflector)).unwrap();

    lab.send("p1", &udp(mac(10), mac(20), "10.0.0.10:5000", "10.0.0.20:53", b"q"));
    assert!(lab.take("p1").is_empty());
    assert!(lab.take("p2").is_empty());
}

#[test]
fn test_egress_filter_drops_per_port() {
    let lab = lab();
    let mut udp_only = MatchRule::new(FilterResult::Drop);
    udp_only.protocol = Some(IpProtocol::Udp);
    lab.switch.add_egress_filter("p2", rules(vec![udp_only])).unwrap();

    lab.send("p1", &udp(mac(10), mac(20), "10.0.0.10:5000", "10.0.0.20:53", b"q"));
    assert!(lab.take("p2").is_empty());
    assert_eq!(lab.switch.metrics().snapshot().filter_dropped, 1);

    // ARP carries no protocol, so it still floods through
    lab.send("p1", &arp_request(mac(10), "10.0.0.10", "10.0.0.99"));
    assert_eq!(lab.take("p2").len(), 1);
    assert_eq!(lab.take("p3").len(), 1);
}

#[test]
fn test_extra_frames_from_filters() {
    let lab = lab();
    lab.switch
        .add_ingress_filter("p1", Arc::new(Mirror { to: "p3", bypass_egress: false }))
        .unwrap();

    let frame = udp(mac(10), mac(20), "10.0.0.10:5000", "10.0.0.20:53", b"q");
    lab.send("p1", &frame);
    assert_eq!(lab.take("p2").len(), 1);
    let copy = lab.take("p3");
    assert_eq!(copy.len(), 1);
    assert_eq!(copy[0].to_bytes(), frame.to_bytes());

    // send_packet honours the target's egress chain, redirect does not
    lab.switch
        .add_egress_filter("p3", rules(vec![MatchRule::new(FilterResult::Drop)]))
        .unwrap();
    lab.send("p1", &frame);
    assert!(lab.take("p3").is_empty());

    lab.switch
        .add_ingress_filter("p2", Arc::new(Mirror { to: "p3", bypass_egress: true }))
        .unwrap();
    lab.send("p2", &udp(mac(20), mac(10), "10.0.0.20:53", "10.0.0.10:5000", b"a"));
    assert_eq!(lab.take("p3").len(), 1);
}

#[test]
fn test_filter_on_unknown_port_rejected() {
    let lab = lab();
    assert!(lab.switch.add_ingress_filter("nope", Arc::new(Reflector)).is_err());
    assert!(lab.switch.add_egress_filter("nope", Arc::new(Reflector)).is_err());
}
