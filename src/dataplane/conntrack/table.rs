//! Per-network connection tracking tables

use super::entry::{FlowKey, TcpEntry, TcpState};
use crate::{Error, Result};
use std::collections::hash_map::Entry as MapEntry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tracing::{debug, error};

/// Datagrams a UDP listener buffers before dropping new ones
pub const UDP_QUEUE_MAX: usize = 1024;

/// Listening TCP socket
#[derive(Debug)]
pub struct TcpListener {
    local: SocketAddr,
    pub(crate) syn_backlog: HashSet<FlowKey>,
    pub(crate) backlog: VecDeque<FlowKey>,
}

impl TcpListener {
    pub fn local(&self) -> SocketAddr {
        self.local
    }

    pub fn syn_backlog_len(&self) -> usize {
        self.syn_backlog.len()
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }
}

/// Bound UDP socket
#[derive(Debug)]
pub struct UdpListener {
    local: SocketAddr,
    queue: VecDeque<(SocketAddr, Vec<u8>)>,
}

impl UdpListener {
    pub fn local(&self) -> SocketAddr {
        self.local
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Returns false when the queue is full
    pub(crate) fn push(&mut self, remote: SocketAddr, payload: Vec<u8>) -> bool {
        if self.queue.len() >= UDP_QUEUE_MAX {
            return false;
        }
        self.queue.push_back((remote, payload));
        true
    }
}

#[derive(Debug, Default)]
pub struct Conntrack {
    tcp_listeners: HashMap<SocketAddr, TcpListener>,
    udp_listeners: HashMap<SocketAddr, UdpListener>,
    tcp: HashMap<FlowKey, TcpEntry>,
}

impl Conntrack {
    pub fn new() -> Self {
        Self::default()
    }

    // ===== TCP listeners =====

    /// Listen on `local`; an unspecified address matches any local address
    pub fn listen_tcp(&mut self, local: SocketAddr) -> Result<()> {
        if self.tcp_listeners.contains_key(&local) {
            return Err(Error::already_exists("tcp listener", local));
        }
        self.tcp_listeners.insert(
            local,
            TcpListener {
                local,
                syn_backlog: HashSet::new(),
                backlog: VecDeque::new(),
            },
        );
        debug!(%local, "tcp listening");
        Ok(())
    }

    /// Stop listening; flows already accepted or pending are reset by the caller
    pub fn unlisten_tcp(&mut self, local: SocketAddr) -> Result<TcpListener> {
        self.tcp_listeners
            .remove(&local)
            .ok_or_else(|| Error::not_found("tcp listener", local))
    }

    /// Key of the listener accepting connections to `dst`
    pub fn lookup_tcp_listen(&self, dst: &SocketAddr) -> Option<SocketAddr> {
        if self.tcp_listeners.contains_key(dst) {
            return Some(*dst);
        }
        let any = match dst.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let wildcard = SocketAddr::new(any, dst.port());
        self.tcp_listeners.contains_key(&wildcard).then_some(wildcard)
    }

    pub fn tcp_listener(&self, local: &SocketAddr) -> Option<&TcpListener> {
        self.tcp_listeners.get(local)
    }

    pub(crate) fn tcp_listener_mut(&mut self, local: &SocketAddr) -> Option<&mut TcpListener> {
        self.tcp_listeners.get_mut(local)
    }

    pub fn tcp_listeners(&self) -> impl Iterator<Item = &TcpListener> {
        self.tcp_listeners.values()
    }

    /// Next established connection of a listener
    pub fn accept(&mut self, listener: &SocketAddr) -> Result<Option<FlowKey>> {
        let l = self
            .tcp_listeners
            .get_mut(listener)
            .ok_or_else(|| Error::not_found("tcp listener", listener))?;
        Ok(l.backlog.pop_front())
    }

    // ===== TCP entries =====

    /// Start tracking a flow opened against `listener`
    pub(crate) fn create_tcp(
        &mut self,
        listener: SocketAddr,
        key: FlowKey,
        peer_seq: u32,
    ) -> &mut TcpEntry {
        if let Some(l) = self.tcp_listeners.get_mut(&listener) {
            l.syn_backlog.insert(key);
        }
        let entry = TcpEntry::new(key, peer_seq);
        match self.tcp.entry(key) {
            MapEntry::Occupied(mut occupied) => {
                error!(flow = %key, "replacing an existing tcp entry with the same tuple");
                occupied.insert(entry);
                occupied.into_mut()
            }
            MapEntry::Vacant(vacant) => vacant.insert(entry),
        }
    }

    /// Listener that owns a flow's local address
    pub(crate) fn owning_listener(&self, key: &FlowKey) -> Option<SocketAddr> {
        self.lookup_tcp_listen(&key.local)
    }

    /// Move a flow from the SYN backlog to the accept backlog
    pub(crate) fn established(&mut self, key: &FlowKey) {
        let Some(listener) = self.owning_listener(key) else {
            return;
        };
        if let Some(l) = self.tcp_listeners.get_mut(&listener)
            && l.syn_backlog.remove(key)
        {
            l.backlog.push_back(*key);
            debug!(flow = %key, "tcp connection established");
        }
    }

    pub fn lookup_tcp(&self, key: &FlowKey) -> Option<&TcpEntry> {
        self.tcp.get(key)
    }

    pub fn lookup_tcp_mut(&mut self, key: &FlowKey) -> Option<&mut TcpEntry> {
        self.tcp.get_mut(key)
    }

    pub fn remove_tcp(&mut self, key: &FlowKey) -> Option<TcpEntry> {
        let entry = self.tcp.remove(key)?;
        if let Some(listener) = self.owning_listener(key)
            && let Some(l) = self.tcp_listeners.get_mut(&listener)
        {
            l.syn_backlog.remove(key);
            l.backlog.retain(|k| k != key);
        }
        debug!(flow = %key, state = %entry.state(), "tcp entry removed");
        Some(entry)
    }

    pub fn tcp_entries(&self) -> impl Iterator<Item = &TcpEntry> {
        self.tcp.values()
    }

    pub(crate) fn tcp_entries_mut(&mut self) -> impl Iterator<Item = &mut TcpEntry> {
        self.tcp.values_mut()
    }

    pub fn tcp_count(&self) -> usize {
        self.tcp.len()
    }

    /// Flows in `state`, mostly for diagnostics
    pub fn count_in_state(&self, state: TcpState) -> usize {
        self.tcp.values().filter(|e| e.state() == state).count()
    }

    // ===== UDP =====

    /// Bind an exact `ip:port`; wildcards are not supported for UDP
    pub fn listen_udp(&mut self, local: SocketAddr) -> Result<()> {
        if self.udp_listeners.contains_key(&local) {
            return Err(Error::already_exists("udp listener", local));
        }
        self.udp_listeners.insert(
            local,
            UdpListener {
                local,
                queue: VecDeque::new(),
            },
        );
        debug!(%local, "udp listening");
        Ok(())
    }

    pub fn unlisten_udp(&mut self, local: SocketAddr) -> Result<()> {
        self.udp_listeners
            .remove(&local)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("udp listener", local))
    }

    pub(crate) fn udp_listener_mut(&mut self, local: &SocketAddr) -> Option<&mut UdpListener> {
        self.udp_listeners.get_mut(local)
    }

    pub fn has_udp_listener(&self, local: &SocketAddr) -> bool {
        self.udp_listeners.contains_key(local)
    }

    /// Oldest queued datagram as `(remote, payload)`
    pub fn recv_udp(&mut self, local: &SocketAddr) -> Result<Option<(SocketAddr, Vec<u8>)>> {
        let l = self
            .udp_listeners
            .get_mut(local)
            .ok_or_else(|| Error::not_found("udp listener", local))?;
        Ok(l.queue.pop_front())
    }

    pub fn clear(&mut self) {
        self.tcp.clear();
        self.tcp_listeners.clear();
        self.udp_listeners.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sa(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_tcp_listen_wildcard() {
        let mut ct = Conntrack::new();
        ct.listen_tcp(sa("0.0.0.0:80")).unwrap();
        ct.listen_tcp(sa("10.0.0.1:443")).unwrap();

        assert_eq!(ct.lookup_tcp_listen(&sa("10.0.0.9:80")), Some(sa("0.0.0.0:80")));
        assert_eq!(ct.lookup_tcp_listen(&sa("10.0.0.1:443")), Some(sa("10.0.0.1:443")));
        assert_eq!(ct.lookup_tcp_listen(&sa("10.0.0.2:443")), None);
        assert_eq!(ct.lookup_tcp_listen(&sa("[fd00::1]:80")), None);
        assert!(ct.listen_tcp(sa("0.0.0.0:80")).is_err());
    }

    #[test]
    fn test_udp_listen_exact_only() {
        let mut ct = Conntrack::new();
        ct.listen_udp(sa("10.0.0.1:53")).unwrap();
        assert!(ct.has_udp_listener(&sa("10.0.0.1:53")));
        assert!(!ct.has_udp_listener(&sa("10.0.0.2:53")));
        assert!(ct.listen_udp(sa("10.0.0.1:53")).is_err());
        ct.unlisten_udp(sa("10.0.0.1:53")).unwrap();
        assert!(ct.unlisten_udp(sa("10.0.0.1:53")).is_err());
    }

    #[test]
    fn test_udp_queue() {
        let mut ct = Conntrack::new();
        let local = sa("10.0.0.1:53");
        ct.listen_udp(local).unwrap();
        let l = ct.udp_listener_mut(&local).unwrap();
        assert!(l.push(sa("10.0.0.2:5000"), b"q1".to_vec()));
        assert!(l.push(sa("10.0.0.3:5000"), b"q2".to_vec()));
        assert_eq!(
            ct.recv_udp(&local).unwrap(),
            Some((sa("10.0.0.2:5000"), b"q1".to_vec()))
        );
        assert_eq!(ct.recv_udp(&local).unwrap().unwrap().1, b"q2");
        assert_eq!(ct.recv_udp(&local).unwrap(), None);
    }

    #[test]
    fn test_backlog_transitions() {
        let mut ct = Conntrack::new();
        let listener = sa("10.0.0.1:80");
        ct.listen_tcp(listener).unwrap();
        let key = FlowKey::new(sa("10.0.0.2:40000"), listener);
        ct.create_tcp(listener, key, 100);
        assert_eq!(ct.tcp_listener(&listener).unwrap().syn_backlog_len(), 1);
        assert_eq!(ct.accept(&listener).unwrap(), None);

        ct.established(&key);
        assert_eq!(ct.tcp_listener(&listener).unwrap().syn_backlog_len(), 0);
        assert_eq!(ct.accept(&listener).unwrap(), Some(key));

        assert!(ct.remove_tcp(&key).is_some());
        assert_eq!(ct.tcp_count(), 0);
    }
}
