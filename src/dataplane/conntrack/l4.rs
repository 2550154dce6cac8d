//! User-space L4 stack for addresses owned by the switch
//!
//! Every function here mutates the conntrack tables and returns the IP
//! packets to emit; routing them is left to the caller.

use super::entry::{
    rto, FlowKey, RetransmitTimer, TcpEntry, TcpState, DELAYED_ACK_TIMEOUT,
    MAX_RETRANSMISSION_AFTER_CLOSING, MAX_SYN_BACKLOG, RCV_MSS, RCV_WINDOW_SCALE,
    SND_DEFAULT_MSS,
};
use super::queue::{seq_gt, QueueViolation, Segment};
use super::table::Conntrack;
use crate::protocol::ip::{IpPacket, IpPayload};
use crate::protocol::tcp::{TcpFlags, TcpOption, TcpPacket};
use crate::protocol::udp::UdpPacket;
use crate::{Error, Result};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, error, trace, warn};

/// Result of offering an inbound packet to the L4 stack
#[derive(Debug, PartialEq, Eq)]
pub enum L4Input {
    /// No socket wants this packet
    NotHandled,
    /// Consumed; these packets go back out
    Handled(Vec<IpPacket>),
}

/// Reset answering `ip`, or `None` if `ip` is itself a reset or not TCP
pub fn reset_for(ip: &IpPacket) -> Option<IpPacket> {
    let tcp = ip.tcp()?;
    if tcp.flags.rst {
        return None;
    }
    let reply = if tcp.flags.ack {
        TcpPacket::new(tcp.dst_port, tcp.src_port, tcp.ack, 0, rst_only())
    } else {
        TcpPacket::new(
            tcp.dst_port,
            tcp.src_port,
            0,
            tcp.seq.wrapping_add(tcp.seq_len()),
            TcpFlags::RST_ACK,
        )
    };
    IpPacket::new(ip.dst(), ip.src(), IpPayload::Tcp(reply)).ok()
}

fn rst_only() -> TcpFlags {
    TcpFlags {
        rst: true,
        ..TcpFlags::empty()
    }
}

/// Offer an inbound packet addressed to a local IP
pub fn input(ct: &mut Conntrack, ip: &IpPacket, now: Instant) -> L4Input {
    match ip.payload() {
        IpPayload::Tcp(tcp) => input_tcp(ct, ip, tcp, now),
        IpPayload::Udp(udp) => input_udp(ct, ip, udp),
        _ => L4Input::NotHandled,
    }
}

fn input_udp(ct: &mut Conntrack, ip: &IpPacket, udp: &UdpPacket) -> L4Input {
    let local = SocketAddr::new(ip.dst(), udp.dst_port);
    let Some(listener) = ct.udp_listener_mut(&local) else {
        return L4Input::NotHandled;
    };
    let remote = SocketAddr::new(ip.src(), udp.src_port);
    if !listener.push(remote, udp.payload.clone()) {
        debug!(%local, %remote, "udp receive queue full, datagram dropped");
    }
    L4Input::Handled(Vec::new())
}

fn input_tcp(ct: &mut Conntrack, ip: &IpPacket, tcp: &TcpPacket, now: Instant) -> L4Input {
    let key = FlowKey::new(
        SocketAddr::new(ip.src(), tcp.src_port),
        SocketAddr::new(ip.dst(), tcp.dst_port),
    );

    if ct.lookup_tcp(&key).is_none() {
        if tcp.flags.rst {
            return L4Input::Handled(Vec::new());
        }
        if !tcp.flags.is_syn_only() {
            trace!(flow = %key, "segment for unknown flow, resetting");
            return L4Input::Handled(reset_for(ip).into_iter().collect());
        }
        let Some(listener) = ct.lookup_tcp_listen(&key.local) else {
            return L4Input::NotHandled;
        };
        let full = ct
            .tcp_listener(&listener)
            .is_some_and(|l| l.syn_backlog_len() >= MAX_SYN_BACKLOG);
        if full {
            debug!(%listener, "syn backlog full, resetting");
            return L4Input::Handled(reset_for(ip).into_iter().collect());
        }
        ct.create_tcp(listener, key, tcp.seq);
    }

    let mut outcome = Outcome::default();
    if let Some(entry) = ct.lookup_tcp_mut(&key) {
        handle_tcp(entry, tcp, now, &mut outcome);
    }
    if outcome.established {
        ct.established(&key);
    }
    if outcome.remove {
        ct.remove_tcp(&key);
    }
    L4Input::Handled(outcome.out)
}

#[derive(Debug, Default)]
struct Outcome {
    out: Vec<IpPacket>,
    established: bool,
    remove: bool,
}

impl Outcome {
    fn push(&mut self, packet: Option<IpPacket>) {
        self.out.extend(packet);
    }
}

fn handle_tcp(entry: &mut TcpEntry, tcp: &TcpPacket, now: Instant, outcome: &mut Outcome) {
    if tcp.flags.rst {
        debug!(flow = %entry.key(), state = %entry.state(), "reset by peer");
        entry.set_state(TcpState::Closed);
        outcome.remove = true;
        return;
    }
    match entry.state() {
        TcpState::Closed => handle_closed(entry, tcp, outcome),
        TcpState::SynReceived => handle_syn_received(entry, tcp, now, outcome),
        TcpState::TimeWait | TcpState::SynSent => {
            trace!(flow = %entry.key(), state = %entry.state(), "segment ignored");
        }
        _ => handle_synchronized(entry, tcp, now, outcome),
    }
}

fn handle_closed(entry: &mut TcpEntry, tcp: &TcpPacket, outcome: &mut Outcome) {
    if !tcp.flags.is_syn_only() {
        return;
    }
    let mss = tcp.mss().map_or(SND_DEFAULT_MSS, u32::from);
    let scale = tcp.window_scale();
    entry.send.init(tcp.window as u32, mss, scale.unwrap_or(0));
    entry.recv_window_shift = if scale.is_some() { RCV_WINDOW_SCALE } else { 0 };
    entry.set_state(TcpState::SynReceived);

    outcome.push(syn_ack(entry));
    entry.send.inc_all_seq();
}

fn handle_syn_received(
    entry: &mut TcpEntry,
    tcp: &TcpPacket,
    now: Instant,
    outcome: &mut Outcome,
) {
    if tcp.flags.syn {
        // retransmitted SYN: answer with the same SYN-ACK
        if tcp.seq == entry.recv.expecting_seq().wrapping_sub(1) {
            entry.send.dec_all_seq();
            outcome.push(syn_ack(entry));
            entry.send.inc_all_seq();
        }
        return;
    }
    if !tcp.flags.ack || tcp.ack != entry.send.ack_seq() {
        trace!(flow = %entry.key(), "handshake ACK missing or wrong");
        return;
    }
    entry.set_state(TcpState::Established);
    outcome.established = true;
    handle_synchronized(entry, tcp, now, outcome);
}

/// Any state after the handshake
fn handle_synchronized(
    entry: &mut TcpEntry,
    tcp: &TcpPacket,
    now: Instant,
    outcome: &mut Outcome,
) {
    if tcp.flags.ack {
        let before = entry.send.ack_seq();
        entry.send.ack(tcp.ack, tcp.window);
        let progressed = entry.send.ack_seq() != before || entry.send.fin_acked();
        on_fin_acked(entry, outcome);
        if outcome.remove {
            return;
        }
        transmit(entry, false, outcome);
        if outcome.remove {
            return;
        }
        rearm(entry, now, progressed);
    }

    let expect = entry.recv.expecting_seq();
    if !tcp.payload.is_empty() {
        if entry.state().remote_closed() {
            trace!(flow = %entry.key(), "data after FIN ignored");
        } else {
            let stored = match entry.recv.store(Segment::new(tcp.seq, tcp.payload.clone())) {
                Ok(stored) => stored,
                Err(e) => {
                    violation(entry, e, outcome);
                    return;
                }
            };
            if seq_gt(tcp.seq, expect) {
                // gap: keep the segment and tell the peer what we still miss
                send_ack(entry, outcome);
                return;
            } else if stored {
                schedule_ack(entry, now, outcome);
            } else {
                // duplicate
                send_ack(entry, outcome);
            }
        }
    }

    if tcp.flags.fin {
        let fin_seq = tcp.seq.wrapping_add(tcp.payload.len() as u32);
        if fin_seq == entry.recv.expecting_seq() && !entry.state().remote_closed() {
            entry.recv.inc_expecting_seq();
            let next = match entry.state() {
                TcpState::Established => TcpState::CloseWait,
                TcpState::FinWait1 => TcpState::Closing,
                TcpState::FinWait2 => TcpState::TimeWait,
                other => other,
            };
            entry.set_state(next);
            send_ack(entry, outcome);
            if next == TcpState::TimeWait {
                outcome.remove = true;
            }
        } else if fin_seq.wrapping_add(1) == entry.recv.expecting_seq() {
            // retransmitted FIN
            send_ack(entry, outcome);
        }
    }
}

/// State changes once the peer acknowledged our FIN
fn on_fin_acked(entry: &mut TcpEntry, outcome: &mut Outcome) {
    if !entry.send.fin_acked() {
        return;
    }
    match entry.state() {
        TcpState::FinWait1 => entry.set_state(TcpState::FinWait2),
        TcpState::Closing | TcpState::LastAck => {
            entry.set_state(TcpState::Closed);
            outcome.remove = true;
        }
        _ => {}
    }
}

// ========================================
// Output
// ========================================

fn segment(entry: &TcpEntry, seq: u32, flags: TcpFlags, payload: Vec<u8>) -> Option<IpPacket> {
    let mut tcp = TcpPacket::new(
        entry.local().port(),
        entry.remote().port(),
        seq,
        entry.recv.expecting_seq(),
        flags,
    );
    tcp.window = entry.advertised_window();
    tcp.payload = payload;
    IpPacket::new(entry.local().ip(), entry.remote().ip(), IpPayload::Tcp(tcp))
        .inspect_err(|e| warn!(flow = %entry.key(), error = %e, "unable to build segment"))
        .ok()
}

fn syn_ack(entry: &TcpEntry) -> Option<IpPacket> {
    let mut tcp = TcpPacket::new(
        entry.local().port(),
        entry.remote().port(),
        entry.send.ack_seq(),
        entry.recv.expecting_seq(),
        TcpFlags::SYN_ACK,
    );
    tcp.window = u16::MAX;
    tcp.options.push(TcpOption::Mss(RCV_MSS));
    if entry.recv_window_shift != 0 {
        tcp.options.push(TcpOption::WindowScale(entry.recv_window_shift));
    }
    IpPacket::new(entry.local().ip(), entry.remote().ip(), IpPayload::Tcp(tcp)).ok()
}

fn send_ack(entry: &mut TcpEntry, outcome: &mut Outcome) {
    entry.delayed_ack = None;
    outcome.push(segment(entry, entry.snd_nxt(), TcpFlags::ACK, Vec::new()));
}

/// Acknowledge received data now if the window is closed, else within
/// the delayed-ACK timeout
fn schedule_ack(entry: &mut TcpEntry, now: Instant, outcome: &mut Outcome) {
    if entry.recv.window() == 0 {
        send_ack(entry, outcome);
    } else if entry.delayed_ack.is_none() {
        entry.delayed_ack = Some(now + DELAYED_ACK_TIMEOUT);
    }
}

/// Send queued data and the FIN. Without `retransmit` only bytes never
/// sent before go out.
fn transmit(entry: &mut TcpEntry, retransmit: bool, outcome: &mut Outcome) {
    let sent = entry.send.fetch_seq();
    let segments = match entry.send.fetch() {
        Ok(segments) => segments,
        Err(e) => return violation(entry, e, outcome),
    };
    for s in segments {
        if retransmit || seq_gt(s.end(), sent) {
            let begin = s.begin();
            outcome.push(segment(entry, begin, TcpFlags::PSH_ACK, s.into_data()));
            entry.delayed_ack = None;
        }
    }
    let all_sent = entry.send.fetch_seq() == entry.send.latest_seq();
    if entry.send.need_fin() && all_sent && (retransmit || !entry.fin_transmitted) {
        outcome.push(segment(
            entry,
            entry.send.latest_seq(),
            TcpFlags::FIN_ACK,
            Vec::new(),
        ));
        entry.fin_transmitted = true;
        entry.delayed_ack = None;
    }
}

/// Keep the retransmission timer in line with what is outstanding
fn rearm(entry: &mut TcpEntry, now: Instant, progressed: bool) {
    if !entry.send.has_data() && !entry.send.need_fin() {
        entry.retransmit = None;
        return;
    }
    if entry.retransmit.is_none() || progressed {
        entry.retransmit = Some(RetransmitTimer {
            deadline: now + rto(0),
            count: 0,
            begin: entry.send.ack_seq(),
        });
    }
}

fn reset_entry(entry: &mut TcpEntry, outcome: &mut Outcome) {
    outcome.push(segment(entry, entry.snd_nxt(), TcpFlags::RST_ACK, Vec::new()));
    entry.set_state(TcpState::Closed);
    outcome.remove = true;
}

/// Queue bookkeeping broke: the flow is reset and dropped
fn violation(entry: &mut TcpEntry, err: QueueViolation, outcome: &mut Outcome) {
    error!(flow = %entry.key(), state = %entry.state(), error = %err, "tcp flow corrupted, resetting");
    reset_entry(entry, outcome);
}

/// Fire due timers of every flow: delayed ACKs and retransmissions
pub fn tick(ct: &mut Conntrack, now: Instant) -> Vec<IpPacket> {
    let mut out = Vec::new();
    let mut removed = Vec::new();
    for entry in ct.tcp_entries_mut() {
        let mut outcome = Outcome::default();
        tick_entry(entry, now, &mut outcome);
        out.append(&mut outcome.out);
        if outcome.remove {
            removed.push(entry.key());
        }
    }
    for key in removed {
        ct.remove_tcp(&key);
    }
    out
}

fn tick_entry(entry: &mut TcpEntry, now: Instant, outcome: &mut Outcome) {
    if entry.delayed_ack.is_some_and(|d| d <= now) {
        send_ack(entry, outcome);
    }
    let Some(timer) = entry.retransmit else {
        return;
    };
    if timer.deadline > now {
        return;
    }
    let count = if entry.send.ack_seq() == timer.begin {
        timer.count + 1
    } else {
        0
    };
    if entry.state().fin_sent() && count > MAX_RETRANSMISSION_AFTER_CLOSING {
        debug!(flow = %entry.key(), "too many retransmissions after close, resetting");
        reset_entry(entry, outcome);
        return;
    }
    transmit(entry, true, outcome);
    if outcome.remove {
        return;
    }
    entry.retransmit = (entry.send.has_data() || entry.send.need_fin()).then(|| RetransmitTimer {
        deadline: now + rto(count),
        count,
        begin: entry.send.ack_seq(),
    });
}

// ========================================
// Application API
// ========================================

fn entry_mut<'a>(ct: &'a mut Conntrack, key: &FlowKey) -> Result<&'a mut TcpEntry> {
    ct.lookup_tcp_mut(key)
        .ok_or_else(|| Error::not_found("tcp connection", key))
}

/// Queue bytes for sending; returns how many were accepted and the
/// segments to emit now
pub fn tcp_write(
    ct: &mut Conntrack,
    key: &FlowKey,
    data: &[u8],
    now: Instant,
) -> Result<(usize, Vec<IpPacket>)> {
    let entry = entry_mut(ct, key)?;
    if !matches!(entry.state(), TcpState::Established | TcpState::CloseWait) {
        return Err(Error::InvalidArgument(format!(
            "cannot write in state {}",
            entry.state()
        )));
    }
    let mut outcome = Outcome::default();
    let n = match entry.send.write(data) {
        Ok(n) => {
            transmit(entry, false, &mut outcome);
            n
        }
        Err(e) => {
            violation(entry, e, &mut outcome);
            0
        }
    };
    if !outcome.remove {
        rearm(entry, now, false);
    }
    if outcome.remove {
        ct.remove_tcp(key);
    }
    Ok((n, outcome.out))
}

/// Drain up to `max_len` received bytes; empty once the peer closed and
/// everything was read
pub fn tcp_read(ct: &mut Conntrack, key: &FlowKey, max_len: usize) -> Result<Vec<u8>> {
    Ok(entry_mut(ct, key)?.recv.read(max_len))
}

/// Close the sending side: FIN follows the queued bytes
pub fn tcp_close(ct: &mut Conntrack, key: &FlowKey, now: Instant) -> Result<Vec<IpPacket>> {
    let entry = entry_mut(ct, key)?;
    let mut outcome = Outcome::default();
    match entry.state() {
        TcpState::Established => entry.set_state(TcpState::FinWait1),
        TcpState::CloseWait => entry.set_state(TcpState::LastAck),
        TcpState::SynReceived | TcpState::Closed => reset_entry(entry, &mut outcome),
        _ => return Ok(Vec::new()),
    }
    if !outcome.remove {
        entry.send.close();
        transmit(entry, false, &mut outcome);
        rearm(entry, now, false);
    }
    if outcome.remove {
        ct.remove_tcp(key);
    }
    Ok(outcome.out)
}

/// Datagram from a bound local address
pub fn udp_send_to(
    ct: &Conntrack,
    local: SocketAddr,
    remote: SocketAddr,
    data: Vec<u8>,
) -> Result<IpPacket> {
    if !ct.has_udp_listener(&local) {
        return Err(Error::not_found("udp listener", local));
    }
    IpPacket::new(
        local.ip(),
        remote.ip(),
        IpPayload::Udp(UdpPacket::new(local.port(), remote.port(), data)),
    )
}
