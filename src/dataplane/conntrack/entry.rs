//! Tracked TCP flow

use super::queue::{ReceiveQueue, SendQueue};
use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::{BuildHasher, Hash, Hasher};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Send buffer limit in bytes
pub const WMEM_MAX: usize = 212992;
/// Receive buffer limit in bytes
pub const RMEM_MAX: usize = 212992;
/// MSS assumed when the peer's SYN carries no MSS option
pub const SND_DEFAULT_MSS: u32 = 1360;
/// MSS advertised in our SYN-ACK
pub const RCV_MSS: u16 = 1360;
/// Window-scale shift advertised in our SYN-ACK
pub const RCV_WINDOW_SCALE: u8 = 6;
/// The peer's window is never trusted beyond this many segments
pub const MAX_REMOTE_WINDOW_MSS: u32 = 45;
pub const RTO_MIN: Duration = Duration::from_millis(200);
pub const RTO_MAX: Duration = Duration::from_secs(120);
pub const DELAYED_ACK_TIMEOUT: Duration = Duration::from_millis(20);
pub const MAX_RETRANSMISSION_AFTER_CLOSING: u32 = 7;
/// Half-open connections a listener keeps before answering SYNs with RST
pub const MAX_SYN_BACKLOG: usize = 128;

const SEQ_INIT_MIN: u32 = i32::MAX as u32 / 3;
const SEQ_INIT_RANGE: u32 = i32::MAX as u32 / 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcpState {
    Closed,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl TcpState {
    /// We have sent (or queued) our FIN
    pub fn fin_sent(&self) -> bool {
        matches!(
            self,
            TcpState::FinWait1
                | TcpState::FinWait2
                | TcpState::Closing
                | TcpState::LastAck
                | TcpState::TimeWait
        )
    }

    /// The peer has sent its FIN
    pub fn remote_closed(&self) -> bool {
        matches!(
            self,
            TcpState::CloseWait | TcpState::Closing | TcpState::LastAck | TcpState::TimeWait
        )
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TcpState::Closed => "CLOSED",
            TcpState::SynSent => "SYN_SENT",
            TcpState::SynReceived => "SYN_RECEIVED",
            TcpState::Established => "ESTABLISHED",
            TcpState::FinWait1 => "FIN_WAIT_1",
            TcpState::FinWait2 => "FIN_WAIT_2",
            TcpState::CloseWait => "CLOSE_WAIT",
            TcpState::Closing => "CLOSING",
            TcpState::LastAck => "LAST_ACK",
            TcpState::TimeWait => "TIME_WAIT",
        };
        f.write_str(name)
    }
}

/// Identity of a flow from the switch's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub remote: SocketAddr,
    pub local: SocketAddr,
}

impl FlowKey {
    pub fn new(remote: SocketAddr, local: SocketAddr) -> Self {
        Self { remote, local }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}", self.local, self.remote)
    }
}

/// Pending retransmission
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetransmitTimer {
    pub deadline: Instant,
    pub count: u32,
    /// First sequence number sent by the transmission being timed
    pub begin: u32,
}

#[derive(Debug)]
pub struct TcpEntry {
    key: FlowKey,
    state: TcpState,
    pub send: SendQueue,
    pub recv: ReceiveQueue,
    pub(crate) retransmit: Option<RetransmitTimer>,
    pub(crate) delayed_ack: Option<Instant>,
    /// Shift applied to the window we advertise (0 unless the peer offered scaling)
    pub(crate) recv_window_shift: u8,
    pub(crate) fin_transmitted: bool,
}

impl TcpEntry {
    /// Entry for a peer whose SYN carried `peer_seq`
    pub fn new(key: FlowKey, peer_seq: u32) -> Self {
        Self {
            key,
            state: TcpState::Closed,
            send: SendQueue::new(initial_sequence(&key)),
            recv: ReceiveQueue::new(peer_seq.wrapping_add(1)),
            retransmit: None,
            delayed_ack: None,
            recv_window_shift: 0,
            fin_transmitted: false,
        }
    }

    pub fn key(&self) -> FlowKey {
        self.key
    }

    pub fn remote(&self) -> SocketAddr {
        self.key.remote
    }

    pub fn local(&self) -> SocketAddr {
        self.key.local
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: TcpState) {
        if self.state != state {
            tracing::trace!(flow = %self.key, from = %self.state, to = %state, "tcp state changed");
            self.state = state;
        }
    }

    /// Sequence number of the next byte we would send
    pub fn snd_nxt(&self) -> u32 {
        if self.fin_transmitted {
            self.send.latest_seq().wrapping_add(1)
        } else {
            self.send.fetch_seq()
        }
    }

    /// Receive window as carried in the header field
    pub fn advertised_window(&self) -> u16 {
        (self.recv.window() >> self.recv_window_shift).min(u16::MAX as u32) as u16
    }

    /// Earliest pending timer
    pub fn next_deadline(&self) -> Option<Instant> {
        let retransmit = self.retransmit.map(|t| t.deadline);
        match (retransmit, self.delayed_ack) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Randomized initial send sequence
fn initial_sequence(key: &FlowKey) -> u32 {
    let mut hasher = RandomState::new().build_hasher();
    key.hash(&mut hasher);
    SEQ_INIT_MIN + (hasher.finish() % SEQ_INIT_RANGE as u64) as u32
}

/// Retransmission timeout after `count` consecutive retransmissions
pub fn rto(count: u32) -> Duration {
    RTO_MIN
        .checked_mul(1u32.checked_shl(count).unwrap_or(u32::MAX))
        .map_or(RTO_MAX, |d| d.min(RTO_MAX))
}
