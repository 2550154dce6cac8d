//! Packet filter hooks
//!
//! Each port carries an ingress and an egress chain of [`PacketFilter`]s.
//! A filter sees the decoded frame and a [`FilterHelper`] exposing the NAT
//! operations and send/redirect primitives, and returns a [`FilterResult`].
//! The first result other than `Pass` decides the frame's fate.
//!
//! [`RuleFilter`] is a small match/action filter usable as a chain member.

use super::address_table::Cidr;
use super::nat::{new_pooled_session, FiveTuple, NatDirection, NatSession, NatTable, SNatPool};
use super::switch::{Outgoing, Switch};
use crate::protocol::ethernet::EthernetPacket;
use crate::protocol::ip::{IpPacket, IpPayload};
use crate::protocol::IpProtocol;
use crate::{Error, Result};
use serde::Deserialize;
use std::cell::RefCell;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::trace;

/// IPv4 + TCP header bytes subtracted from the MTU to get the MSS
const MSS_OVERHEAD_V4: usize = 40;
/// IPv6 + TCP header bytes subtracted from the MTU to get the MSS
const MSS_OVERHEAD_V6: usize = 60;

/// Decision of a filter
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FilterResult {
    /// Continue with the next filter, then the default pipeline
    #[default]
    Pass,
    /// Silently drop the frame
    Drop,
    /// Transmit the frame out the named port, skipping the default pipeline
    Redirect(String),
    /// Transmit the (possibly rewritten) frame back out the port it came from
    L4Tx,
}

/// When NAT'd TCP SYNs get their MSS option rewritten
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MssRewrite {
    /// Clamp on egress, when the frame is serialized for its output port
    #[default]
    Deferred,
    /// Clamp and re-serialize inside the NAT step
    Immediate,
}

/// Frame being filtered and where it is
#[derive(Debug)]
pub struct PacketContext {
    pub packet: EthernetPacket,
    port: String,
    vni: u32,
    now: Instant,
}

impl PacketContext {
    pub fn new(packet: EthernetPacket, port: impl Into<String>, vni: u32, now: Instant) -> Self {
        Self {
            packet,
            port: port.into(),
            vni,
            now,
        }
    }

    /// Port the frame arrived on (ingress) or is about to leave by (egress)
    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn vni(&self) -> u32 {
        self.vni
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn into_packet(self) -> EthernetPacket {
        self.packet
    }
}

pub trait PacketFilter: Send + Sync {
    fn handle(&self, helper: &FilterHelper<'_>, ctx: &mut PacketContext) -> FilterResult;
}

/// Operations available to filters
pub struct FilterHelper<'a> {
    switch: &'a Switch,
    outbox: RefCell<Vec<Outgoing>>,
}

impl<'a> FilterHelper<'a> {
    pub(crate) fn new(switch: &'a Switch) -> Self {
        Self {
            switch,
            outbox: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn take_outbox(&self) -> Vec<Outgoing> {
        self.outbox.take()
    }

    /// Queue an extra frame for `port`; it passes that port's egress filters
    pub fn send_packet(&self, port: &str, packet: EthernetPacket) {
        self.outbox.borrow_mut().push(Outgoing::new(port, packet));
    }

    /// Queue an extra frame for `port`, bypassing its egress filters
    pub fn redirect(&self, port: &str, packet: EthernetPacket) {
        self.outbox.borrow_mut().push(Outgoing::direct(port, packet));
    }

    /// Whether the frame belongs to an existing NAT session
    pub fn is_nat_tracked(&self, ctx: &PacketContext) -> bool {
        ctx.packet
            .ip()
            .and_then(FiveTuple::of)
            .is_some_and(|tuple| self.switch.nat_table().lookup(&tuple).is_some())
    }

    /// Translate through an existing session in whichever direction the
    /// frame matches; false if it matches none
    pub fn execute_nat(&self, ctx: &mut PacketContext) -> bool {
        self.translate(ctx, |_, tuple| {
            Err(Error::not_found("nat session", tuple))
        })
        .is_ok()
    }

    /// Source NAT through `pool`, creating a session on first use
    pub fn execute_snat(&self, ctx: &mut PacketContext, pool: &str) -> Result<()> {
        let pool = self.pool(pool)?;
        let now = ctx.now();
        self.translate(ctx, |nat, original| {
            new_pooled_session(nat, original, &pool, original.dst, now)
        })
    }

    /// Destination NAT to `dst`, keeping the source
    pub fn execute_dnat(&self, ctx: &mut PacketContext, dst: SocketAddr) -> Result<()> {
        let now = ctx.now();
        self.translate(ctx, |nat, original| {
            let translated = FiveTuple::new(original.protocol, original.src, dst);
            nat.create(original, translated, None, now)
        })
    }

    /// Full NAT: source from `pool`, destination rewritten to `dst`
    pub fn execute_fnat(&self, ctx: &mut PacketContext, pool: &str, dst: SocketAddr) -> Result<()> {
        let pool = self.pool(pool)?;
        let now = ctx.now();
        self.translate(ctx, |nat, original| {
            new_pooled_session(nat, original, &pool, dst, now)
        })
    }

    /// Session with an explicit translated source and destination
    pub fn new_nat(&self, ctx: &mut PacketContext, src: SocketAddr, dst: SocketAddr) -> Result<()> {
        let now = ctx.now();
        self.translate(ctx, |nat, original| {
            let translated = FiveTuple::new(original.protocol, src, dst);
            nat.create(original, translated, None, now)
        })
    }

    fn pool(&self, name: &str) -> Result<Arc<SNatPool>> {
        self.switch
            .nat_pool(name)
            .ok_or_else(|| Error::not_found("nat pool", name))
    }

    fn translate<F>(&self, ctx: &mut PacketContext, create: F) -> Result<()>
    where
        F: FnOnce(&NatTable, FiveTuple) -> Result<Arc<NatSession>>,
    {
        let tuple = ctx
            .packet
            .ip()
            .and_then(FiveTuple::of)
            .ok_or_else(|| Error::InvalidArgument("not a TCP or UDP packet".into()))?;
        let now = ctx.now();
        let metrics = self.switch.metrics();
        {
            let nat = self.switch.nat_table();
            let (session, dir) = match nat.lookup(&tuple) {
                Some(found) => found,
                None => match create(nat, tuple) {
                    Ok(session) => {
                        metrics.nat_sessions_created.inc();
                        (session, NatDirection::Forward)
                    }
                    Err(e) => match nat.lookup(&tuple) {
                        // another port created it first
                        Some(found) => found,
                        None => {
                            if matches!(e, Error::PoolExhausted { .. }) {
                                metrics.nat_allocation_failures.inc();
                            }
                            return Err(e);
                        }
                    },
                },
            };
            let Some(ip) = ctx.packet.ip_mut() else {
                return Err(Error::InvalidArgument("not an IP packet".into()));
            };
            nat.apply(&session, dir, ip, now)?;
            trace!(%tuple, ?dir, "nat applied");
        }

        if self.switch.mss_rewrite() == MssRewrite::Immediate {
            if let Some(mtu) = self.switch.port_mtu(ctx.port()) {
                clamp_syn_mss(&mut ctx.packet, mtu);
            }
            ctx.packet.bytes();
        }
        Ok(())
    }
}

/// Lower a SYN's MSS option to fit `mtu`; true if the frame changed
pub fn clamp_syn_mss(packet: &mut EthernetPacket, mtu: usize) -> bool {
    let Some(ip) = packet.ip() else {
        return false;
    };
    let overhead = if ip.is_v6() {
        MSS_OVERHEAD_V6
    } else {
        MSS_OVERHEAD_V4
    };
    let limit = mtu.saturating_sub(overhead).min(u16::MAX as usize) as u16;
    let oversized = ip
        .tcp()
        .is_some_and(|t| t.flags.syn && t.mss().is_some_and(|mss| mss > limit));
    if !oversized {
        return false;
    }
    match packet.ip_mut().map(IpPacket::payload_mut) {
        Some(IpPayload::Tcp(tcp)) => tcp.clamp_mss(limit),
        _ => false,
    }
}

/// Match conditions of a [`RuleFilter`] entry; unset fields match anything
#[derive(Debug, Clone)]
pub struct MatchRule {
    pub protocol: Option<IpProtocol>,
    pub src: Option<Cidr>,
    pub dst: Option<Cidr>,
    pub src_ports: Option<(u16, u16)>,
    pub dst_ports: Option<(u16, u16)>,
    pub action: FilterResult,
}

impl MatchRule {
    pub fn new(action: FilterResult) -> Self {
        Self {
            protocol: None,
            src: None,
            dst: None,
            src_ports: None,
            dst_ports: None,
            action,
        }
    }

    pub fn matches(&self, packet: &EthernetPacket) -> bool {
        let Some(ip) = packet.ip() else {
            // non-IP frames only match rules without IP conditions
            return self.protocol.is_none()
                && self.src.is_none()
                && self.dst.is_none()
                && self.src_ports.is_none()
                && self.dst_ports.is_none();
        };

        if let Some(proto) = self.protocol {
            if proto as u8 != ip.protocol() {
                return false;
            }
        }
        if let Some(cidr) = &self.src {
            if !cidr.contains(&ip.src()) {
                return false;
            }
        }
        if let Some(cidr) = &self.dst {
            if !cidr.contains(&ip.dst()) {
                return false;
            }
        }

        let ports = ip.ports();
        if let Some((low, high)) = self.src_ports {
            match ports {
                Some((sport, _)) if (low..=high).contains(&sport) => {}
                _ => return false,
            }
        }
        if let Some((low, high)) = self.dst_ports {
            match ports {
                Some((_, dport)) if (low..=high).contains(&dport) => {}
                _ => return false,
            }
        }
        true
    }
}

/// Ordered match/action list; the first matching rule decides
#[derive(Debug, Clone, Default)]
pub struct RuleFilter {
    rules: Vec<MatchRule>,
}

impl RuleFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rule(&mut self, rule: MatchRule) {
        self.rules.push(rule);
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

impl PacketFilter for RuleFilter {
    fn handle(&self, _helper: &FilterHelper<'_>, ctx: &mut PacketContext) -> FilterResult {
        self.rules
            .iter()
            .find(|r| r.matches(&ctx.packet))
            .map(|r| r.action.clone())
            .unwrap_or_default()
    }
}
