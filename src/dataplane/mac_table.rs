//! MAC address table (MAC → port) with aging

use super::aging::{AgingEntry, AgingMap};
use crate::protocol::MacAddr;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default MAC aging time (5 minutes, per IEEE 802.1D)
pub const DEFAULT_MAC_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug)]
pub struct MacTable {
    entries: AgingMap<MacAddr, String>,
}

impl Default for MacTable {
    fn default() -> Self {
        Self::new(DEFAULT_MAC_TIMEOUT)
    }
}

impl MacTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: AgingMap::new(timeout),
        }
    }

    /// Learn `mac` on `port`; broadcast/multicast sources are ignored
    pub fn record(&mut self, mac: MacAddr, port: &str, now: Instant) {
        if mac.is_multicast() {
            return;
        }
        match self.entries.record(mac, port.to_string(), now) {
            Some(previous) if previous != port => {
                debug!(%mac, from = %previous, to = port, "MAC moved");
            }
            None => debug!(%mac, port, "MAC learned"),
            _ => {}
        }
    }

    pub fn lookup(&self, mac: &MacAddr, now: Instant) -> Option<&str> {
        self.entries.get(mac, now).map(String::as_str)
    }

    pub fn remove(&mut self, mac: &MacAddr) -> Option<String> {
        self.entries.remove(mac)
    }

    /// Forget every MAC learned on `port`
    pub fn remove_port(&mut self, port: &str) {
        self.entries.retain(|_, p| p != port);
    }

    pub fn expire(&mut self, now: Instant) -> usize {
        let evicted = self.entries.expire(now);
        for (mac, port) in &evicted {
            debug!(%mac, port = %port, "MAC aged out");
        }
        evicted.len()
    }

    pub fn timeout(&self) -> Duration {
        self.entries.timeout()
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.entries.set_timeout(timeout);
    }

    pub fn entries(&self, now: Instant) -> Vec<AgingEntry<MacAddr, String>> {
        self.entries.entries(now)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
