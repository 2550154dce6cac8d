//! The switch: ports, networks and the per-frame pipeline
//!
//! A frame arriving on a port is resolved to the port's network, passed
//! through the port's ingress filters, learned, and then switched:
//! unicast to a learned port, flooded, or delivered to the switch's own
//! addresses (ARP/NDP/ICMP answers, the L4 stack, routing). Everything the
//! pipeline wants to send is collected first and passes the egress filters
//! of its output port before being serialized.

use super::aging::AgingEntry;
use super::address_table::Cidr;
use super::conntrack::{l4, FlowKey, L4Input};
use super::filter::{
    clamp_syn_mss, FilterHelper, FilterResult, MssRewrite, PacketContext, PacketFilter,
};
use super::nat::{NatSession, NatTable, NatTimeouts, SNatPool};
use super::network::{Network, NetworkTimeouts};
use super::port::Port;
use super::route_table::{RouteRule, RouteTarget};
use crate::config::Config;
use crate::protocol::arp::ArpPacket;
use crate::protocol::ethernet::{EthPayload, EthernetPacket, Frame};
use crate::protocol::icmp::IcmpPacket;
use crate::protocol::icmpv6::{NeighborAdvertisement, NeighborSolicitation, NDP_HOP_LIMIT};
use crate::protocol::ip::{IpPacket, IpPayload};
use crate::protocol::ipv6::solicited_node;
use crate::protocol::MacAddr;
use crate::telemetry::{MetricsRegistry, PortStats};
use crate::{Error, Result};
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Networks a routed packet may cross before it is dropped
pub const DEFAULT_HOP_LIMIT: u8 = 8;

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Clone)]
pub struct SwitchSettings {
    pub timeouts: NetworkTimeouts,
    pub nat: NatTimeouts,
    pub hop_limit: u8,
    pub mss_rewrite: MssRewrite,
}

impl Default for SwitchSettings {
    fn default() -> Self {
        Self {
            timeouts: NetworkTimeouts::default(),
            nat: NatTimeouts::default(),
            hop_limit: DEFAULT_HOP_LIMIT,
            mss_rewrite: MssRewrite::default(),
        }
    }
}

/// A frame queued for a port
#[derive(Debug)]
pub(crate) struct Outgoing {
    port: String,
    packet: EthernetPacket,
    /// Skip the port's egress filters
    direct: bool,
}

impl Outgoing {
    pub(crate) fn new(port: &str, packet: EthernetPacket) -> Self {
        Self {
            port: port.to_string(),
            packet,
            direct: false,
        }
    }

    pub(crate) fn direct(port: &str, packet: EthernetPacket) -> Self {
        Self {
            port: port.to_string(),
            packet,
            direct: true,
        }
    }
}

type FilterChain = Vec<Arc<dyn PacketFilter>>;

struct AttachedPort {
    port: Arc<dyn Port>,
    vni: u32,
    stats: Arc<PortStats>,
    ingress: RwLock<FilterChain>,
    egress: RwLock<FilterChain>,
}

pub struct Switch {
    networks: RwLock<HashMap<u32, Arc<Network>>>,
    ports: RwLock<HashMap<String, Arc<AttachedPort>>>,
    pools: RwLock<HashMap<String, Arc<SNatPool>>>,
    nat: NatTable,
    settings: RwLock<SwitchSettings>,
    metrics: Arc<MetricsRegistry>,
}

impl Switch {
    pub fn new(settings: SwitchSettings) -> Self {
        Self::with_metrics(settings, Arc::new(MetricsRegistry::new()))
    }

    pub fn with_metrics(settings: SwitchSettings, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            networks: RwLock::new(HashMap::new()),
            ports: RwLock::new(HashMap::new()),
            pools: RwLock::new(HashMap::new()),
            nat: NatTable::new(settings.nat.clone()),
            settings: RwLock::new(settings),
            metrics,
        }
    }

    /// Build networks, local addresses, routes and NAT pools from a
    /// validated configuration; ports are attached by the caller
    pub fn from_config(config: &Config) -> Result<Self> {
        let report = crate::config::validate(config);
        if report.has_errors() {
            return Err(Error::Config(report.errors.join("; ")));
        }

        let switch = Self::new(config.switch.settings());
        for net in &config.networks {
            switch.add_network(net.vni, net.v4_cidr()?, net.v6_cidr()?)?;
            for binding in &net.ips {
                let (ip, mac) = binding.parse()?;
                switch.add_ip(net.vni, ip, mac)?;
            }
        }
        // routes may target any network, so they go in once all exist
        for net in &config.networks {
            for route in &net.routes {
                switch.add_route(net.vni, route.to_rule()?)?;
            }
        }
        for pool in &config.nat_pools {
            switch.add_nat_pool(&pool.name, pool.range.parse()?)?;
        }
        Ok(switch)
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn settings(&self) -> SwitchSettings {
        read(&self.settings).clone()
    }

    pub(crate) fn mss_rewrite(&self) -> MssRewrite {
        read(&self.settings).mss_rewrite
    }

    fn hop_limit(&self) -> u8 {
        read(&self.settings).hop_limit
    }

    pub(crate) fn nat_table(&self) -> &NatTable {
        &self.nat
    }

    pub(crate) fn port_mtu(&self, name: &str) -> Option<usize> {
        self.attached(name).map(|p| p.port.mtu())
    }

    fn attached(&self, name: &str) -> Option<Arc<AttachedPort>> {
        read(&self.ports).get(name).cloned()
    }

    // ========================================
    // Networks
    // ========================================

    pub fn add_network(&self, vni: u32, v4: Cidr, v6: Option<Cidr>) -> Result<Arc<Network>> {
        let timeouts = read(&self.settings).timeouts;
        let mut networks = write(&self.networks);
        if networks.contains_key(&vni) {
            return Err(Error::already_exists("network", vni));
        }
        let network = Arc::new(Network::new(vni, v4, v6, timeouts)?);
        networks.insert(vni, network.clone());
        info!(vni, %v4, v6 = ?v6, "network added");
        Ok(network)
    }

    /// Remove a network; its ports must be detached first
    pub fn del_network(&self, vni: u32) -> Result<()> {
        let mut networks = write(&self.networks);
        let network = networks
            .get(&vni)
            .ok_or_else(|| Error::not_found("network", vni))?;
        if network.has_ports() {
            return Err(Error::InvalidArgument(format!(
                "network {} still has ports attached",
                vni
            )));
        }
        networks.remove(&vni);
        info!(vni, "network removed");
        Ok(())
    }

    pub fn network(&self, vni: u32) -> Option<Arc<Network>> {
        read(&self.networks).get(&vni).cloned()
    }

    /// All networks, ordered by VNI
    pub fn networks(&self) -> Vec<Arc<Network>> {
        let mut networks: Vec<_> = read(&self.networks).values().cloned().collect();
        networks.sort_by_key(|n| n.vni());
        networks
    }

    fn require_network(&self, vni: u32) -> Result<Arc<Network>> {
        self.network(vni)
            .ok_or_else(|| Error::not_found("network", vni))
    }

    // ========================================
    // Ports
    // ========================================

    pub fn attach_port(&self, port: Arc<dyn Port>, vni: u32) -> Result<()> {
        let network = self.require_network(vni)?;
        let name = port.name().to_string();
        let mut ports = write(&self.ports);
        if ports.contains_key(&name) {
            return Err(Error::already_exists("port", &name));
        }
        ports.insert(
            name.clone(),
            Arc::new(AttachedPort {
                port,
                vni,
                stats: self.metrics.port(&name),
                ingress: RwLock::new(Vec::new()),
                egress: RwLock::new(Vec::new()),
            }),
        );
        network.add_port(&name);
        info!(port = %name, vni, "port attached");
        Ok(())
    }

    pub fn detach_port(&self, name: &str) -> Result<Arc<dyn Port>> {
        let attached = write(&self.ports)
            .remove(name)
            .ok_or_else(|| Error::not_found("port", name))?;
        if let Some(network) = self.network(attached.vni) {
            network.remove_port(name);
        }
        self.metrics.remove_port(name);
        info!(port = name, vni = attached.vni, "port detached");
        Ok(attached.port.clone())
    }

    /// Port names with the VNI each is attached to, ordered by name
    pub fn ports(&self) -> Vec<(String, u32)> {
        let mut ports: Vec<_> = read(&self.ports)
            .iter()
            .map(|(name, p)| (name.clone(), p.vni))
            .collect();
        ports.sort();
        ports
    }

    pub fn add_ingress_filter(&self, port: &str, filter: Arc<dyn PacketFilter>) -> Result<()> {
        let attached = self
            .attached(port)
            .ok_or_else(|| Error::not_found("port", port))?;
        write(&attached.ingress).push(filter);
        Ok(())
    }

    pub fn add_egress_filter(&self, port: &str, filter: Arc<dyn PacketFilter>) -> Result<()> {
        let attached = self
            .attached(port)
            .ok_or_else(|| Error::not_found("port", port))?;
        write(&attached.egress).push(filter);
        Ok(())
    }

    // ========================================
    // Addresses and routes
    // ========================================

    pub fn add_ip(&self, vni: u32, ip: IpAddr, mac: MacAddr) -> Result<()> {
        self.require_network(vni)?.add_ip(ip, mac)
    }

    pub fn del_ip(&self, vni: u32, ip: &IpAddr) -> Result<()> {
        self.require_network(vni)?.del_ip(ip).map(|_| ())
    }

    pub fn add_route(&self, vni: u32, rule: RouteRule) -> Result<()> {
        let network = self.require_network(vni)?;
        if let RouteTarget::Network(target) = rule.target {
            if target != vni && self.network(target).is_none() {
                return Err(Error::not_found("network", target));
            }
        }
        network.add_route(rule)
    }

    pub fn del_route(&self, vni: u32, alias: &str) -> Result<RouteRule> {
        self.require_network(vni)?.del_route(alias)
    }

    pub fn routes(&self, vni: u32) -> Result<Vec<RouteRule>> {
        Ok(self.require_network(vni)?.routes())
    }

    // ========================================
    // NAT
    // ========================================

    pub fn add_nat_pool(&self, name: &str, pool: SNatPool) -> Result<()> {
        let mut pools = write(&self.pools);
        if pools.contains_key(name) {
            return Err(Error::already_exists("nat pool", name));
        }
        info!(name, %pool, "nat pool added");
        pools.insert(name.to_string(), Arc::new(pool));
        Ok(())
    }

    /// Remove a pool; live sessions keep their allocation until reclaimed
    pub fn del_nat_pool(&self, name: &str) -> Result<()> {
        write(&self.pools)
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("nat pool", name))
    }

    pub fn nat_pool(&self, name: &str) -> Option<Arc<SNatPool>> {
        read(&self.pools).get(name).cloned()
    }

    pub fn nat_sessions(&self) -> Vec<Arc<NatSession>> {
        self.nat_table().sessions()
    }

    pub fn set_nat_timeouts(&self, timeouts: NatTimeouts) {
        self.nat_table().set_timeouts(timeouts.clone());
        write(&self.settings).nat = timeouts;
    }

    // ========================================
    // Table timeouts and listings
    // ========================================

    pub fn set_mac_timeout(&self, timeout: Duration) {
        self.update_timeouts(|t| t.mac = timeout);
    }

    /// ARP and NDP entry lifetime
    pub fn set_neighbor_timeout(&self, timeout: Duration) {
        self.update_timeouts(|t| {
            t.arp = timeout;
            t.ndp = timeout;
        });
    }

    fn update_timeouts(&self, update: impl FnOnce(&mut NetworkTimeouts)) {
        let timeouts = {
            let mut settings = write(&self.settings);
            update(&mut settings.timeouts);
            settings.timeouts
        };
        for network in self.networks() {
            network.set_timeouts(timeouts);
        }
        debug!(?timeouts, "table timeouts updated");
    }

    pub fn mac_entries(&self, vni: u32, now: Instant) -> Result<Vec<AgingEntry<MacAddr, String>>> {
        Ok(self.require_network(vni)?.mac_entries(now))
    }

    pub fn neighbor_entries(
        &self,
        vni: u32,
        now: Instant,
    ) -> Result<Vec<AgingEntry<IpAddr, MacAddr>>> {
        Ok(self.require_network(vni)?.neighbor_entries(now))
    }

    // ========================================
    // L4 endpoints on local addresses
    // ========================================

    fn require_local(network: &Network, addr: &SocketAddr) -> Result<()> {
        if addr.ip().is_unspecified() || network.local_mac(&addr.ip()).is_some() {
            Ok(())
        } else {
            Err(Error::InvalidArgument(format!(
                "{} is not a local address of network {}",
                addr.ip(),
                network.vni()
            )))
        }
    }

    pub fn listen_tcp(&self, vni: u32, local: SocketAddr) -> Result<()> {
        let network = self.require_network(vni)?;
        Self::require_local(&network, &local)?;
        network.conntrack().listen_tcp(local)
    }

    pub fn unlisten_tcp(&self, vni: u32, local: SocketAddr) -> Result<()> {
        self.require_network(vni)?
            .conntrack()
            .unlisten_tcp(local)
            .map(|_| ())
    }

    /// Next established connection of a listener
    pub fn accept(&self, vni: u32, listener: SocketAddr) -> Result<Option<FlowKey>> {
        self.require_network(vni)?.conntrack().accept(&listener)
    }

    /// Queue bytes on a connection; returns how many were accepted
    pub fn tcp_write(&self, vni: u32, key: &FlowKey, data: &[u8]) -> Result<usize> {
        let network = self.require_network(vni)?;
        let now = Instant::now();
        let (n, packets) = l4::tcp_write(&mut network.conntrack(), key, data, now)?;
        self.emit_l4(&network, packets, now);
        Ok(n)
    }

    pub fn tcp_read(&self, vni: u32, key: &FlowKey, max_len: usize) -> Result<Vec<u8>> {
        l4::tcp_read(&mut self.require_network(vni)?.conntrack(), key, max_len)
    }

    pub fn tcp_close(&self, vni: u32, key: &FlowKey) -> Result<()> {
        let network = self.require_network(vni)?;
        let now = Instant::now();
        let packets = l4::tcp_close(&mut network.conntrack(), key, now)?;
        self.emit_l4(&network, packets, now);
        Ok(())
    }

    pub fn listen_udp(&self, vni: u32, local: SocketAddr) -> Result<()> {
        let network = self.require_network(vni)?;
        Self::require_local(&network, &local)?;
        network.conntrack().listen_udp(local)
    }

    pub fn unlisten_udp(&self, vni: u32, local: SocketAddr) -> Result<()> {
        self.require_network(vni)?.conntrack().unlisten_udp(local)
    }

    /// Oldest queued datagram as (sender, payload)
    pub fn udp_recv(&self, vni: u32, local: &SocketAddr) -> Result<Option<(SocketAddr, Vec<u8>)>> {
        self.require_network(vni)?.conntrack().recv_udp(local)
    }

    pub fn udp_send_to(
        &self,
        vni: u32,
        local: SocketAddr,
        remote: SocketAddr,
        data: Vec<u8>,
    ) -> Result<()> {
        let network = self.require_network(vni)?;
        let packet = l4::udp_send_to(&network.conntrack(), local, remote, data)?;
        self.emit_l4(&network, vec![packet], Instant::now());
        Ok(())
    }

    fn emit_l4(&self, network: &Arc<Network>, packets: Vec<IpPacket>, now: Instant) {
        let mut pipeline = Pipeline::new(self, now);
        pipeline.send_l4(network, packets, 0, None);
        let frames = pipeline.finish();
        self.transmit(frames);
    }

    // ========================================
    // Data path
    // ========================================

    /// Ingress entry point for port drivers
    pub fn on_frame_received(&self, port: &str, bytes: &[u8]) {
        let frames = self.process_frame(port, bytes, Instant::now());
        self.transmit(frames);
    }

    /// Run one frame through the pipeline
    ///
    /// Returns a list of (port_name, frame) to send
    pub fn process_frame(&self, in_port: &str, bytes: &[u8], now: Instant) -> Vec<(String, Vec<u8>)> {
        self.metrics.frames_received.inc();

        let Some(attached) = self.attached(in_port) else {
            trace!(port = in_port, "frame on unknown port dropped");
            self.metrics.frames_dropped.inc();
            return Vec::new();
        };
        attached.stats.record_rx(bytes.len());

        let Some(network) = self.network(attached.vni) else {
            trace!(port = in_port, vni = attached.vni, "port has no network, dropped");
            self.drop_rx(&attached);
            return Vec::new();
        };

        match Frame::parse(bytes) {
            Ok(header) if header.src_mac() == header.dst_mac() => {
                trace!(port = in_port, mac = %header.src_mac(), "source equals destination, dropped");
                self.drop_rx(&attached);
                return Vec::new();
            }
            Ok(_) => {}
            Err(e) => {
                trace!(port = in_port, error = %e, "runt frame dropped");
                self.drop_rx(&attached);
                return Vec::new();
            }
        }
        let packet = match EthernetPacket::parse(bytes) {
            Ok(p) => p,
            Err(e) => {
                trace!(port = in_port, error = %e, "malformed frame dropped");
                self.drop_rx(&attached);
                return Vec::new();
            }
        };

        let mut pipeline = Pipeline::new(self, now);
        let filters = read(&attached.ingress).clone();
        let packet = if filters.is_empty() {
            packet
        } else {
            let mut ctx = PacketContext::new(packet, in_port, network.vni(), now);
            let helper = FilterHelper::new(self);
            let result = run_filters(&filters, &helper, &mut ctx);
            pipeline.out.extend(helper.take_outbox());
            let packet = ctx.into_packet();
            match result {
                FilterResult::Pass => packet,
                FilterResult::Drop => {
                    trace!(port = in_port, "dropped by ingress filter");
                    self.metrics.filter_dropped.inc();
                    return pipeline.finish();
                }
                FilterResult::Redirect(to) => {
                    trace!(port = in_port, to = %to, "redirected by ingress filter");
                    self.metrics.filter_redirected.inc();
                    pipeline.out.push(Outgoing::direct(&to, packet));
                    return pipeline.finish();
                }
                FilterResult::L4Tx => {
                    self.metrics.filter_tx_back.inc();
                    pipeline.out.push(Outgoing::direct(in_port, packet));
                    return pipeline.finish();
                }
            }
        };

        pipeline.handle_l2(&network, Some(in_port), packet, 0);
        pipeline.finish()
    }

    fn drop_rx(&self, attached: &AttachedPort) {
        attached.stats.rx_drops.inc();
        self.metrics.frames_dropped.inc();
    }

    /// Age tables, reclaim NAT sessions and fire TCP timers
    pub fn tick(&self, now: Instant) {
        let mut pipeline = Pipeline::new(self, now);
        for network in self.networks() {
            network.expire(now);
            let packets = l4::tick(&mut network.conntrack(), now);
            pipeline.send_l4(&network, packets, 0, None);
        }
        let reclaimed = self.nat_table().expire(now);
        if reclaimed > 0 {
            debug!(reclaimed, "nat sessions reclaimed");
        }
        let frames = pipeline.finish();
        self.transmit(frames);
    }

    fn transmit(&self, frames: Vec<(String, Vec<u8>)>) {
        for (name, frame) in frames {
            let Some(attached) = self.attached(&name) else {
                trace!(port = %name, "egress port vanished, frame dropped");
                continue;
            };
            match attached.port.transmit(&frame) {
                Ok(()) => attached.stats.record_tx(frame.len()),
                Err(e) => {
                    attached.stats.tx_errors.inc();
                    warn!(port = %name, error = %e, "transmit failed");
                }
            }
        }
    }
}

/// First non-`Pass` result of the chain
fn run_filters(
    filters: &[Arc<dyn PacketFilter>],
    helper: &FilterHelper<'_>,
    ctx: &mut PacketContext,
) -> FilterResult {
    for filter in filters {
        let result = filter.handle(helper, ctx);
        if result != FilterResult::Pass {
            return result;
        }
    }
    FilterResult::Pass
}

/// Sender of a frame that arrived on a port, answerable without a
/// neighbor lookup
#[derive(Debug, Clone, Copy)]
struct Peer {
    vni: u32,
    ip: IpAddr,
    mac: MacAddr,
}

/// State of one pipeline run: the clock and the frames queued so far
struct Pipeline<'s> {
    switch: &'s Switch,
    now: Instant,
    out: Vec<Outgoing>,
}

impl<'s> Pipeline<'s> {
    fn new(switch: &'s Switch, now: Instant) -> Self {
        Self {
            switch,
            now,
            out: Vec::new(),
        }
    }

    fn metrics(&self) -> &MetricsRegistry {
        &self.switch.metrics
    }

    fn emit(&mut self, port: &str, packet: EthernetPacket) {
        self.out.push(Outgoing::new(port, packet));
    }

    /// Copy to every member port except `in_port`
    fn flood(&mut self, network: &Network, in_port: Option<&str>, packet: &EthernetPacket) {
        let ports: Vec<String> = network
            .ports()
            .into_iter()
            .filter(|p| Some(p.as_str()) != in_port)
            .collect();
        if ports.is_empty() {
            return;
        }
        self.metrics().floods.inc();
        trace!(vni = network.vni(), dst = %packet.dst(), count = ports.len(), "flooding");
        for port in ports {
            self.emit(&port, packet.clone());
        }
    }

    /// Send a frame the switch built itself
    fn send_l2(&mut self, network: &Network, packet: EthernetPacket) {
        if packet.dst().is_unicast() {
            if let Some(port) = network.lookup_mac(&packet.dst(), self.now) {
                self.emit(&port, packet);
                return;
            }
        }
        self.flood(network, None, &packet);
    }

    /// Answer on the arrival port, or by MAC lookup for routed frames
    fn reply(&mut self, network: &Network, in_port: Option<&str>, packet: EthernetPacket) {
        match in_port {
            Some(port) => self.emit(port, packet),
            None => self.send_l2(network, packet),
        }
    }

    fn handle_l2(
        &mut self,
        network: &Arc<Network>,
        in_port: Option<&str>,
        packet: EthernetPacket,
        hops: u8,
    ) {
        let src = packet.src();
        let dst = packet.dst();
        if let Some(port) = in_port {
            network.learn_mac(src, port, self.now);
        }
        self.learn_neighbors(network, &packet);

        if !dst.is_unicast() {
            self.flood(network, in_port, &packet);
            if !network.is_local_mac(&src) {
                self.deliver_local(network, in_port, packet, hops);
            }
            return;
        }

        if network.is_local_mac(&dst) {
            self.deliver_local(network, in_port, packet, hops);
            return;
        }

        if let Some(port) = network.lookup_mac(&dst, self.now) {
            if Some(port.as_str()) == in_port {
                trace!(port = %port, %dst, "destination is on the arrival port, dropped");
                return;
            }
            self.emit(&port, packet);
            return;
        }

        let target = packet
            .ip()
            .map(IpPacket::dst)
            .filter(|ip| network.contains(ip) && network.local_mac(ip).is_none());
        self.flood(network, in_port, &packet);
        if let Some(target) = target {
            self.solicit(network, target);
        }
    }

    /// Record IP → MAC bindings announced by ARP and NDP traffic
    fn learn_neighbors(&self, network: &Network, packet: &EthernetPacket) {
        match packet.payload() {
            EthPayload::Arp(arp) => {
                if arp.sender_ip.is_unspecified() {
                    return;
                }
                let ip = IpAddr::V4(arp.sender_ip);
                let unicast_reply = arp.is_reply() && packet.dst().is_unicast();
                if network.contains(&ip) || unicast_reply {
                    network.record_neighbor(ip, packet.src(), self.now);
                }
            }
            EthPayload::Ip(ip) => {
                let Some(icmp) = ip.icmp().filter(|i| i.v6) else {
                    return;
                };
                if let Ok(Some(ns)) = NeighborSolicitation::from_icmp(icmp) {
                    if let Some(mac) = ns.source_link_layer {
                        if !ip.src().is_unspecified() {
                            network.record_neighbor(ip.src(), mac, self.now);
                        }
                    }
                } else if let Ok(Some(na)) = NeighborAdvertisement::from_icmp(icmp) {
                    if let Some(mac) = na.target_link_layer {
                        let target = IpAddr::V6(na.target);
                        if network.contains(&target) || packet.dst().is_unicast() {
                            network.record_neighbor(target, mac, self.now);
                        }
                    }
                }
            }
            EthPayload::Unknown { .. } => {}
        }
    }

    /// Frame for one of the switch's own MACs (or broadcast)
    fn deliver_local(
        &mut self,
        network: &Arc<Network>,
        in_port: Option<&str>,
        packet: EthernetPacket,
        hops: u8,
    ) {
        match packet.payload() {
            EthPayload::Arp(arp) => {
                if !arp.is_request() {
                    return;
                }
                let Some(mac) = network.local_mac(&IpAddr::V4(arp.target_ip)) else {
                    return;
                };
                debug!(vni = network.vni(), ip = %arp.target_ip, requester = %arp.sender_ip, "answering arp request");
                let reply = EthernetPacket::new(packet.src(), mac, EthPayload::Arp(arp.reply_to(mac)));
                self.metrics().arp_replies_sent.inc();
                self.reply(network, in_port, reply);
            }
            EthPayload::Ip(_) => self.handle_ip(network, in_port, packet, hops),
            EthPayload::Unknown { ether_type, .. } => {
                trace!(ether_type = format_args!("0x{:04x}", ether_type), "unsupported ether type");
            }
        }
    }

    fn handle_ip(
        &mut self,
        network: &Arc<Network>,
        in_port: Option<&str>,
        packet: EthernetPacket,
        hops: u8,
    ) {
        let Some(ip) = packet.ip() else {
            return;
        };
        if let Some(icmp) = ip.icmp().filter(|i| i.v6) {
            if let Ok(Some(ns)) = NeighborSolicitation::from_icmp(icmp) {
                self.answer_solicitation(network, in_port, &packet, ip, &ns);
                return;
            }
            if matches!(NeighborAdvertisement::from_icmp(icmp), Ok(Some(_))) {
                return;
            }
        }

        let routable = packet.dst().is_unicast();
        let peer = in_port
            .filter(|_| packet.src().is_unicast() && !ip.src().is_unspecified())
            .map(|_| Peer {
                vni: network.vni(),
                ip: ip.src(),
                mac: packet.src(),
            });
        let EthPayload::Ip(ip) = packet.into_payload() else {
            return;
        };
        if network.local_mac(&ip.dst()).is_some() {
            self.handle_local(network, ip, hops, peer);
        } else if routable {
            self.forward(network, ip, hops, true, peer);
        }
    }

    fn answer_solicitation(
        &mut self,
        network: &Network,
        in_port: Option<&str>,
        packet: &EthernetPacket,
        ip: &IpPacket,
        ns: &NeighborSolicitation,
    ) {
        let target = IpAddr::V6(ns.target);
        let Some(mac) = network.local_mac(&target) else {
            return;
        };
        let mut na = NeighborAdvertisement::solicited(ns.target, mac);
        let (dst_ip, dst_mac) = if ip.src().is_unspecified() {
            // duplicate address detection probe: answer all nodes
            na.solicited = false;
            let all_nodes = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);
            (IpAddr::V6(all_nodes), MacAddr::ipv6_multicast(&all_nodes))
        } else {
            (ip.src(), ns.source_link_layer.unwrap_or(packet.src()))
        };
        let Ok(mut reply) = IpPacket::new(target, dst_ip, IpPayload::Icmp(na.to_icmp())) else {
            return;
        };
        reply.set_ttl(NDP_HOP_LIMIT);
        debug!(vni = network.vni(), %target, requester = %ip.src(), "answering neighbor solicitation");
        self.metrics().ndp_advertisements_sent.inc();
        self.reply(network, in_port, EthernetPacket::new(dst_mac, mac, EthPayload::Ip(reply)));
    }

    /// IP packet addressed to a local address
    fn handle_local(&mut self, network: &Arc<Network>, ip: IpPacket, hops: u8, peer: Option<Peer>) {
        if let Some(icmp) = ip.icmp() {
            if icmp.is_echo_request() {
                if let Ok(reply) = IpPacket::new(ip.dst(), ip.src(), IpPayload::Icmp(icmp.echo_reply())) {
                    trace!(vni = network.vni(), from = %ip.src(), "echo reply");
                    self.metrics().icmp_echo_replies.inc();
                    self.forward(network, reply, hops, false, peer);
                }
            }
            return;
        }

        let input = l4::input(&mut network.conntrack(), &ip, self.now);
        match input {
            L4Input::Handled(packets) => self.send_l4(network, packets, hops, peer),
            L4Input::NotHandled => self.refuse(network, &ip, ip.dst(), hops, peer),
        }
    }

    /// Route packets produced by the L4 stack
    fn send_l4(
        &mut self,
        network: &Arc<Network>,
        packets: Vec<IpPacket>,
        hops: u8,
        peer: Option<Peer>,
    ) {
        for packet in packets {
            if packet.tcp().is_some_and(|t| t.flags.rst) {
                self.metrics().tcp_resets_sent.inc();
            }
            self.forward(network, packet, hops, false, peer);
        }
    }

    /// Connection refused: RST for TCP, port unreachable (from `from`) for UDP
    fn refuse(
        &mut self,
        network: &Arc<Network>,
        ip: &IpPacket,
        from: IpAddr,
        hops: u8,
        peer: Option<Peer>,
    ) {
        match ip.payload() {
            IpPayload::Tcp(_) => {
                if let Some(rst) = l4::reset_for(ip) {
                    trace!(vni = network.vni(), dst = %ip.dst(), "refusing tcp");
                    self.metrics().tcp_resets_sent.inc();
                    self.forward(network, rst, hops, false, peer);
                }
            }
            IpPayload::Udp(_) => {
                let icmp = IcmpPacket::port_unreachable(ip.is_v6(), &ip.to_bytes());
                if let Ok(reply) = IpPacket::new(from, ip.src(), IpPayload::Icmp(icmp)) {
                    trace!(vni = network.vni(), dst = %ip.dst(), "udp port unreachable");
                    self.metrics().icmp_port_unreachable.inc();
                    self.forward(network, reply, hops, false, peer);
                }
            }
            _ => trace!(vni = network.vni(), protocol = ip.protocol(), "no handler, dropped"),
        }
    }

    /// Route an IP packet out of `network`; `transit` packets lose one TTL
    fn forward(
        &mut self,
        network: &Arc<Network>,
        mut ip: IpPacket,
        hops: u8,
        transit: bool,
        peer: Option<Peer>,
    ) {
        if transit {
            let ttl = ip.ttl();
            if ttl <= 1 {
                self.time_exceeded(network, &ip, hops, peer);
                return;
            }
            ip.set_ttl(ttl - 1);
        }

        let dst = ip.dst();
        let Some(rule) = network.lookup_route(&dst) else {
            if transit {
                trace!(vni = network.vni(), %dst, "no route");
                let from = network.binding(ip.is_v6()).map_or(dst, |(addr, _)| addr);
                self.refuse(network, &ip, from, hops, peer);
            } else {
                trace!(vni = network.vni(), %dst, "no route for local packet, dropped");
            }
            return;
        };

        match rule.target {
            RouteTarget::Network(vni) if vni == network.vni() => {
                self.deliver(network, ip, hops, peer)
            }
            RouteTarget::Network(vni) => {
                let Some(target) = self.switch.network(vni) else {
                    debug!(route = %rule, "route targets a missing network, dropped");
                    return;
                };
                trace!(from = network.vni(), to = vni, %dst, "routing between networks");
                self.metrics().packets_routed.inc();
                self.deliver(&target, ip, hops + 1, None);
            }
            RouteTarget::Gateway(gateway) => {
                let Some((_, src_mac)) = network.binding(gateway.is_ipv6()) else {
                    debug!(vni = network.vni(), "no local address to reach the gateway from");
                    return;
                };
                let Some(gateway_mac) = network.lookup_neighbor(&gateway, self.now) else {
                    debug!(vni = network.vni(), %gateway, "gateway unresolved, packet dropped");
                    self.solicit(network, gateway);
                    return;
                };
                self.metrics().packets_routed.inc();
                self.send_l2(network, EthernetPacket::new(gateway_mac, src_mac, EthPayload::Ip(ip)));
            }
        }
    }

    /// Hand an IP packet to its destination inside `network`
    ///
    /// A reply to `peer` goes to the MAC its request came from, even when
    /// the neighbor table has no binding for it.
    fn deliver(&mut self, network: &Arc<Network>, ip: IpPacket, hops: u8, peer: Option<Peer>) {
        let dst = ip.dst();
        if hops > self.switch.hop_limit() {
            warn!(vni = network.vni(), %dst, hops, "hop limit exceeded, routing loop suspected");
            return;
        }
        let Some((_, src_mac)) = network.binding(ip.is_v6()) else {
            debug!(vni = network.vni(), %dst, "no local address to send from, dropped");
            return;
        };
        let known = peer
            .filter(|p| p.vni == network.vni() && p.ip == dst)
            .map(|p| p.mac);
        let Some(dst_mac) = network.lookup_neighbor(&dst, self.now).or(known) else {
            trace!(vni = network.vni(), %dst, "neighbor unresolved, packet dropped");
            self.solicit(network, dst);
            return;
        };
        let frame = EthernetPacket::new(dst_mac, src_mac, EthPayload::Ip(ip));
        self.handle_l2(network, None, frame, hops);
    }

    fn time_exceeded(&mut self, network: &Arc<Network>, ip: &IpPacket, hops: u8, peer: Option<Peer>) {
        // never answer an ICMP error with another
        if ip.icmp().is_some_and(|i| !i.is_echo_request()) {
            return;
        }
        let Some((from, _)) = network.binding(ip.is_v6()) else {
            return;
        };
        let icmp = IcmpPacket::time_exceeded(ip.is_v6(), &ip.to_bytes());
        if let Ok(reply) = IpPacket::new(from, ip.src(), IpPayload::Icmp(icmp)) {
            trace!(vni = network.vni(), to = %ip.src(), "time exceeded");
            self.metrics().icmp_time_exceeded.inc();
            self.forward(network, reply, hops, false, peer);
        }
    }

    /// Broadcast an ARP request or Neighbor Solicitation for `target`
    fn solicit(&mut self, network: &Network, target: IpAddr) {
        let Some((from, mac)) = network.binding(target.is_ipv6()) else {
            trace!(vni = network.vni(), %target, "no local address to solicit from");
            return;
        };
        let frame = match (from, target) {
            (IpAddr::V4(from), IpAddr::V4(target)) => {
                self.metrics().arp_requests_sent.inc();
                let request = ArpPacket::request(mac, from, target);
                EthernetPacket::new(MacAddr::BROADCAST, mac, EthPayload::Arp(request))
            }
            (IpAddr::V6(_), IpAddr::V6(target)) => {
                let group = solicited_node(&target);
                let ns = NeighborSolicitation::new(target, Some(mac));
                let Ok(mut ip) = IpPacket::new(from, IpAddr::V6(group), IpPayload::Icmp(ns.to_icmp())) else {
                    return;
                };
                ip.set_ttl(NDP_HOP_LIMIT);
                self.metrics().ndp_solicitations_sent.inc();
                EthernetPacket::new(MacAddr::ipv6_multicast(&group), mac, EthPayload::Ip(ip))
            }
            _ => return,
        };
        debug!(vni = network.vni(), %target, "soliciting neighbor");
        self.flood(network, None, &frame);
    }

    /// Run egress filters and serialize everything queued
    fn finish(self) -> Vec<(String, Vec<u8>)> {
        let switch = self.switch;
        let mut queue: VecDeque<Outgoing> = self.out.into();
        let mut frames = Vec::with_capacity(queue.len());

        while let Some(outgoing) = queue.pop_front() {
            let Some(attached) = switch.attached(&outgoing.port) else {
                trace!(port = %outgoing.port, "frame for unknown port dropped");
                continue;
            };
            let mut packet = outgoing.packet;

            if !outgoing.direct {
                let filters = read(&attached.egress).clone();
                if !filters.is_empty() {
                    let mut ctx = PacketContext::new(packet, &outgoing.port, attached.vni, self.now);
                    let helper = FilterHelper::new(switch);
                    let result = run_filters(&filters, &helper, &mut ctx);
                    queue.extend(helper.take_outbox().into_iter().map(|mut o| {
                        o.direct = true;
                        o
                    }));
                    packet = ctx.into_packet();
                    match result {
                        FilterResult::Pass | FilterResult::L4Tx => {}
                        FilterResult::Drop => {
                            trace!(port = %outgoing.port, "dropped by egress filter");
                            switch.metrics.filter_dropped.inc();
                            continue;
                        }
                        FilterResult::Redirect(to) => {
                            trace!(port = %outgoing.port, to = %to, "redirected by egress filter");
                            switch.metrics.filter_redirected.inc();
                            queue.push_back(Outgoing::direct(&to, packet));
                            continue;
                        }
                    }
                }
            }

            clamp_syn_mss(&mut packet, attached.port.mtu());
            frames.push((outgoing.port, packet.bytes().to_vec()));
        }
        frames
    }
}
