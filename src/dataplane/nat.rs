//! Stateful NAT: source pools and bidirectional sessions
//!
//! A session maps an original 5-tuple (as the initiator sent it) to a
//! translated 5-tuple (as it leaves the switch). The forward map is keyed
//! by the original tuple and the reverse map by the reply direction of the
//! translated tuple, so a packet hits exactly one of them.

use super::conntrack::TcpState;
use crate::protocol::ip::IpPacket;
use crate::protocol::tcp::TcpFlags;
use crate::protocol::IpProtocol;
use crate::{Error, Result};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

/// Transport 5-tuple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiveTuple {
    pub protocol: IpProtocol,
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

impl FiveTuple {
    pub fn new(protocol: IpProtocol, src: SocketAddr, dst: SocketAddr) -> Self {
        Self { protocol, src, dst }
    }

    /// Tuple of a TCP/UDP packet; `None` for other payloads
    pub fn of(ip: &IpPacket) -> Option<Self> {
        let (sport, dport) = ip.ports()?;
        let protocol = if ip.tcp().is_some() {
            IpProtocol::Tcp
        } else {
            IpProtocol::Udp
        };
        Some(Self {
            protocol,
            src: SocketAddr::new(ip.src(), sport),
            dst: SocketAddr::new(ip.dst(), dport),
        })
    }

    /// The same flow seen from the other end
    pub fn reversed(&self) -> Self {
        Self {
            protocol: self.protocol,
            src: self.dst,
            dst: self.src,
        }
    }
}

impl fmt::Display for FiveTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.protocol, self.src, self.dst)
    }
}

// ========================================
// Source address pool
// ========================================

#[derive(Debug, Default)]
struct PoolState {
    next: u16,
    /// (protocol, remote, port) currently held by a live session
    used: HashSet<(IpProtocol, SocketAddr, u16)>,
}

/// Source IP with a contiguous port range, e.g. `"192.0.2.1:20000-29999"`
///
/// Ports are allocated per (protocol, destination), so the same port may
/// be in use towards different destinations at once.
#[derive(Debug)]
pub struct SNatPool {
    ip: IpAddr,
    low: u16,
    high: u16,
    state: Mutex<PoolState>,
}

impl SNatPool {
    pub fn new(ip: IpAddr, low: u16, high: u16) -> Result<Self> {
        if low == 0 || low > high {
            return Err(Error::InvalidArgument(format!(
                "invalid port range {}-{}",
                low, high
            )));
        }
        Ok(Self {
            ip,
            low,
            high,
            state: Mutex::new(PoolState {
                next: low,
                used: HashSet::new(),
            }),
        })
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn range(&self) -> (u16, u16) {
        (self.low, self.high)
    }

    /// Reserve a source address for a flow towards `dst`
    pub fn allocate(&self, protocol: IpProtocol, dst: SocketAddr) -> Option<SocketAddr> {
        let mut state = lock(&self.state);
        let size = (self.high - self.low) as u32 + 1;
        for _ in 0..size {
            let port = state.next;
            state.next = if port >= self.high { self.low } else { port + 1 };
            if state.used.insert((protocol, dst, port)) {
                return Some(SocketAddr::new(self.ip, port));
            }
        }
        None
    }

    pub fn release(&self, protocol: IpProtocol, dst: SocketAddr, port: u16) {
        lock(&self.state).used.remove(&(protocol, dst, port));
    }

    pub fn in_use(&self) -> usize {
        lock(&self.state).used.len()
    }
}

impl fmt::Display for SNatPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{}:{}-{}", ip, self.low, self.high),
            IpAddr::V6(ip) => write!(f, "[{}]:{}-{}", ip, self.low, self.high),
        }
    }
}

impl FromStr for SNatPool {
    type Err = Error;

    /// `"ip:low-high"`; IPv6 addresses are bracketed
    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::Parse(format!("invalid NAT pool: {:?}", s));
        let (ip, range) = s.trim().rsplit_once(':').ok_or_else(bad)?;
        let ip = ip.trim_start_matches('[').trim_end_matches(']');
        let ip: IpAddr = ip.parse().map_err(|_| bad())?;
        let (low, high) = range.split_once('-').ok_or_else(bad)?;
        let low: u16 = low.parse().map_err(|_| bad())?;
        let high: u16 = high.parse().map_err(|_| bad())?;
        SNatPool::new(ip, low, high)
    }
}

// ========================================
// Sessions
// ========================================

/// Which way a packet travels through a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatDirection {
    /// Initiator to responder
    Forward,
    /// Responder back to initiator
    Reverse,
}

#[derive(Debug)]
struct SessionState {
    tcp: Option<TcpState>,
    last_active: Instant,
}

#[derive(Debug)]
pub struct NatSession {
    original: FiveTuple,
    translated: FiveTuple,
    pool: Option<Arc<SNatPool>>,
    state: Mutex<SessionState>,
}

impl NatSession {
    pub fn original(&self) -> FiveTuple {
        self.original
    }

    pub fn translated(&self) -> FiveTuple {
        self.translated
    }

    pub fn tcp_state(&self) -> Option<TcpState> {
        lock(&self.state).tcp
    }

    /// Advance the advisory TCP state from a segment's flags
    fn observe_tcp(&self, flags: TcpFlags, dir: NatDirection, now: Instant) {
        let mut state = lock(&self.state);
        state.last_active = now;
        let Some(current) = state.tcp else {
            return;
        };
        let backhaul = dir == NatDirection::Reverse;
        state.tcp = Some(if flags.rst {
            TcpState::Closed
        } else {
            match current {
                TcpState::TimeWait | TcpState::Closed if flags.is_syn_only() => TcpState::SynSent,
                TcpState::SynSent if backhaul && flags.is_syn_ack() => TcpState::SynReceived,
                TcpState::SynReceived if !backhaul && !flags.syn && flags.ack => {
                    TcpState::Established
                }
                TcpState::Established if flags.fin && backhaul => TcpState::CloseWait,
                TcpState::Established if flags.fin => TcpState::FinWait1,
                TcpState::FinWait1 if backhaul && flags.ack && flags.fin => TcpState::TimeWait,
                TcpState::FinWait1 if backhaul && flags.ack => TcpState::FinWait2,
                TcpState::FinWait2 if backhaul && flags.fin => TcpState::TimeWait,
                TcpState::CloseWait if !backhaul && flags.fin && flags.ack => TcpState::TimeWait,
                TcpState::CloseWait if !backhaul && flags.fin => TcpState::Closing,
                TcpState::Closing if flags.ack => TcpState::TimeWait,
                other => other,
            }
        });
    }

    fn touch(&self, now: Instant) {
        lock(&self.state).last_active = now;
    }

    fn expired(&self, timeouts: &NatTimeouts, now: Instant) -> bool {
        let state = lock(&self.state);
        let timeout = match state.tcp {
            Some(s) => timeouts.tcp(s),
            None => timeouts.udp,
        };
        now.saturating_duration_since(state.last_active) >= timeout
    }

    /// Rewrite addresses and ports for travel in `dir`
    fn rewrite(&self, ip: &mut IpPacket, dir: NatDirection) -> Result<()> {
        let (src, dst) = match dir {
            NatDirection::Forward => (self.translated.src, self.translated.dst),
            NatDirection::Reverse => (self.original.dst, self.original.src),
        };
        ip.set_src(src.ip())?;
        ip.set_dst(dst.ip())?;
        ip.set_src_port(src.port());
        ip.set_dst_port(dst.port());
        Ok(())
    }

    fn release(&self) {
        if let Some(pool) = &self.pool {
            pool.release(
                self.translated.protocol,
                self.translated.dst,
                self.translated.src.port(),
            );
        }
    }
}

/// Idle timeouts per protocol state
#[derive(Debug, Clone)]
pub struct NatTimeouts {
    pub syn_sent: Duration,
    pub syn_received: Duration,
    pub established: Duration,
    pub fin_wait: Duration,
    pub close_wait: Duration,
    pub last_ack: Duration,
    pub time_wait: Duration,
    pub closed: Duration,
    pub udp: Duration,
}

impl Default for NatTimeouts {
    fn default() -> Self {
        Self {
            syn_sent: Duration::from_secs(120),
            syn_received: Duration::from_secs(60),
            established: Duration::from_secs(7200), // 2 hours
            fin_wait: Duration::from_secs(120),
            close_wait: Duration::from_secs(60),
            last_ack: Duration::from_secs(30),
            time_wait: Duration::from_secs(120),
            closed: Duration::from_secs(10),
            udp: Duration::from_secs(300),
        }
    }
}

impl NatTimeouts {
    fn tcp(&self, state: TcpState) -> Duration {
        match state {
            TcpState::SynSent => self.syn_sent,
            TcpState::SynReceived => self.syn_received,
            TcpState::Established => self.established,
            TcpState::FinWait1 | TcpState::FinWait2 => self.fin_wait,
            TcpState::CloseWait => self.close_wait,
            TcpState::Closing | TcpState::LastAck => self.last_ack,
            TcpState::TimeWait => self.time_wait,
            TcpState::Closed => self.closed,
        }
    }
}

/// Number of independently locked slices of a [`NatTable`]
const NAT_SHARDS: usize = 16;

#[derive(Debug, Default)]
struct Shard {
    forward: HashMap<FiveTuple, Arc<NatSession>>,
    reverse: HashMap<FiveTuple, Arc<NatSession>>,
}

/// NAT sessions of the switch
///
/// Sessions are spread over shards by tuple hash. A session sits in the
/// shard of its original tuple (forward map) and in the shard of its reply
/// tuple (reverse map); lookups only take a read lock on one shard.
#[derive(Debug)]
pub struct NatTable {
    shards: Vec<RwLock<Shard>>,
    timeouts: RwLock<NatTimeouts>,
}

impl Default for NatTable {
    fn default() -> Self {
        Self::new(NatTimeouts::default())
    }
}

impl NatTable {
    pub fn new(timeouts: NatTimeouts) -> Self {
        Self {
            shards: (0..NAT_SHARDS).map(|_| RwLock::new(Shard::default())).collect(),
            timeouts: RwLock::new(timeouts),
        }
    }

    fn shard_of(tuple: &FiveTuple) -> usize {
        let mut hasher = DefaultHasher::new();
        tuple.hash(&mut hasher);
        (hasher.finish() % NAT_SHARDS as u64) as usize
    }

    /// Session a packet with this tuple belongs to, and its direction
    pub fn lookup(&self, tuple: &FiveTuple) -> Option<(Arc<NatSession>, NatDirection)> {
        let shard = read(&self.shards[Self::shard_of(tuple)]);
        if let Some(s) = shard.forward.get(tuple) {
            return Some((s.clone(), NatDirection::Forward));
        }
        shard
            .reverse
            .get(tuple)
            .map(|s| (s.clone(), NatDirection::Reverse))
    }

    /// Run `f` with the shards of `original` and `reply` write-locked;
    /// locks are taken in index order
    fn with_pair<R>(
        &self,
        original: &FiveTuple,
        reply: &FiveTuple,
        f: impl FnOnce(&mut Shard, Option<&mut Shard>) -> R,
    ) -> R {
        let (a, b) = (Self::shard_of(original), Self::shard_of(reply));
        if a == b {
            return f(&mut *write(&self.shards[a]), None);
        }
        let (first, second) = (a.min(b), a.max(b));
        let mut low = write(&self.shards[first]);
        let mut high = write(&self.shards[second]);
        if a < b {
            f(&mut *low, Some(&mut *high))
        } else {
            f(&mut *high, Some(&mut *low))
        }
    }

    /// Register a session; the pool (if any) already holds `translated.src`
    pub fn create(
        &self,
        original: FiveTuple,
        translated: FiveTuple,
        pool: Option<Arc<SNatPool>>,
        now: Instant,
    ) -> Result<Arc<NatSession>> {
        let reply = translated.reversed();
        self.with_pair(&original, &reply, |fwd, rev| {
            let taken = fwd.forward.contains_key(&original)
                || rev.as_deref().unwrap_or(&*fwd).reverse.contains_key(&reply);
            if taken {
                return Err(Error::already_exists("nat session", original));
            }
            let tcp = (original.protocol == IpProtocol::Tcp).then_some(TcpState::Closed);
            let session = Arc::new(NatSession {
                original,
                translated,
                pool,
                state: Mutex::new(SessionState {
                    tcp,
                    last_active: now,
                }),
            });
            fwd.forward.insert(original, session.clone());
            match rev {
                Some(rev) => rev.reverse.insert(reply, session.clone()),
                None => fwd.reverse.insert(reply, session.clone()),
            };
            debug!(%original, %translated, "nat session created");
            Ok(session)
        })
    }

    /// Rewrite `ip` through `session` and update its state
    pub fn apply(
        &self,
        session: &NatSession,
        dir: NatDirection,
        ip: &mut IpPacket,
        now: Instant,
    ) -> Result<()> {
        match ip.tcp() {
            Some(tcp) => session.observe_tcp(tcp.flags, dir, now),
            None => session.touch(now),
        }
        session.rewrite(ip, dir)
    }

    pub fn remove(&self, session: &NatSession) {
        let reply = session.translated.reversed();
        let removed = self.with_pair(&session.original, &reply, |fwd, rev| {
            let removed = fwd.forward.remove(&session.original).is_some();
            match rev {
                Some(rev) => rev.reverse.remove(&reply),
                None => fwd.reverse.remove(&reply),
            };
            removed
        });
        if removed {
            session.release();
        }
    }

    /// Reclaim idle and closed sessions, returning how many were dropped
    pub fn expire(&self, now: Instant) -> usize {
        let timeouts = self.timeouts();
        let expired: Vec<Arc<NatSession>> = self
            .shards
            .iter()
            .flat_map(|shard| {
                read(shard)
                    .forward
                    .values()
                    .filter(|s| s.expired(&timeouts, now))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        for session in &expired {
            debug!(original = %session.original, "nat session reclaimed");
            self.remove(session);
        }
        expired.len()
    }

    pub fn sessions(&self) -> Vec<Arc<NatSession>> {
        self.shards
            .iter()
            .flat_map(|shard| read(shard).forward.values().cloned().collect::<Vec<_>>())
            .collect()
    }

    pub fn timeouts(&self) -> NatTimeouts {
        read(&self.timeouts).clone()
    }

    pub fn set_timeouts(&self, timeouts: NatTimeouts) {
        *write(&self.timeouts) = timeouts;
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| read(shard).forward.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Allocate from `pool` and register a session whose source is rewritten
/// and whose destination becomes `dst`
pub fn new_pooled_session(
    table: &NatTable,
    original: FiveTuple,
    pool: &Arc<SNatPool>,
    dst: SocketAddr,
    now: Instant,
) -> Result<Arc<NatSession>> {
    let Some(src) = pool.allocate(original.protocol, dst) else {
        warn!(%pool, %dst, "unable to allocate source address for nat");
        return Err(Error::PoolExhausted {
            pool: pool.to_string(),
        });
    };
    let translated = FiveTuple::new(original.protocol, src, dst);
    table
        .create(original, translated, Some(pool.clone()), now)
        .inspect_err(|_| pool.release(original.protocol, dst, src.port()))
}
