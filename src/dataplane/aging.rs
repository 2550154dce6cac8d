//! Deadline-based aging map
//!
//! Every dynamic entry carries a deadline. A min-heap of (deadline, key)
//! drives eviction; refreshing an entry only moves its deadline, and a stale
//! heap item is re-pushed with the current deadline when it surfaces.
//! Static entries have no deadline and are never evicted by aging.

use std::cmp::Reverse;
use std::collections::hash_map::Entry as MapEntry;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    deadline: Option<Instant>,
}

/// View of one live entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgingEntry<K, V> {
    pub key: K,
    pub value: V,
    /// Time left before eviction; `None` for static entries
    pub remaining: Option<Duration>,
}

#[derive(Debug)]
pub struct AgingMap<K, V> {
    entries: HashMap<K, Entry<V>>,
    heap: BinaryHeap<Reverse<(Instant, K)>>,
    timeout: Duration,
}

impl<K, V> AgingMap<K, V>
where
    K: Hash + Eq + Ord + Clone,
{
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            heap: BinaryHeap::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Change the timeout; applies from each entry's next refresh
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Insert or refresh a dynamic entry, returning the previous value
    ///
    /// A static entry with the same key is left untouched and `None` is returned.
    pub fn record(&mut self, key: K, value: V, now: Instant) -> Option<V> {
        let deadline = now + self.timeout;
        match self.entries.entry(key.clone()) {
            MapEntry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                let old = entry.deadline?;
                entry.deadline = Some(deadline);
                if deadline < old {
                    self.heap.push(Reverse((deadline, key)));
                }
                Some(std::mem::replace(&mut entry.value, value))
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry {
                    value,
                    deadline: Some(deadline),
                });
                self.heap.push(Reverse((deadline, key)));
                None
            }
        }
    }

    /// Insert an entry that never ages out (replaces any dynamic entry)
    pub fn insert_static(&mut self, key: K, value: V) -> Option<V> {
        self.entries
            .insert(
                key,
                Entry {
                    value,
                    deadline: None,
                },
            )
            .map(|e| e.value)
    }

    /// Live value for `key`; an expired but not yet evicted entry is a miss
    pub fn get(&self, key: &K, now: Instant) -> Option<&V> {
        let entry = self.entries.get(key)?;
        match entry.deadline {
            Some(deadline) if deadline <= now => None,
            _ => Some(&entry.value),
        }
    }

    pub fn is_static(&self, key: &K) -> bool {
        self.entries.get(key).is_some_and(|e| e.deadline.is_none())
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|e| e.value)
    }

    /// Drop entries for which `keep` returns false
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        self.entries.retain(|k, e| keep(k, &e.value));
    }

    /// Evict every dynamic entry whose deadline has passed
    pub fn expire(&mut self, now: Instant) -> Vec<(K, V)> {
        let mut evicted = Vec::new();
        while let Some(Reverse((deadline, _))) = self.heap.peek() {
            if *deadline > now {
                break;
            }
            let Some(Reverse((_, key))) = self.heap.pop() else {
                break;
            };
            let current = match self.entries.get(&key) {
                Some(entry) => entry.deadline,
                None => continue,
            };
            match current {
                Some(d) if d <= now => {
                    if let Some(entry) = self.entries.remove(&key) {
                        evicted.push((key, entry.value));
                    }
                }
                // refreshed since this item was pushed
                Some(d) => self.heap.push(Reverse((d, key))),
                None => {}
            }
        }
        evicted
    }

    /// Earliest pending deadline, if any
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse((d, _))| *d)
    }

    /// Live entries at `now`
    pub fn entries(&self, now: Instant) -> Vec<AgingEntry<K, V>>
    where
        V: Clone,
    {
        self.entries
            .iter()
            .filter_map(|(k, e)| {
                let remaining = match e.deadline {
                    Some(d) if d <= now => return None,
                    Some(d) => Some(d - now),
                    None => None,
                };
                Some(AgingEntry {
                    key: k.clone(),
                    value: e.value.clone(),
                    remaining,
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.heap.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(10);

    #[test]
    fn test_record_and_get() {
        let now = Instant::now();
        let mut map = AgingMap::new(TIMEOUT);
        assert_eq!(map.record(1u32, "a", now), None);
        assert_eq!(map.get(&1, now), Some(&"a"));
        assert_eq!(map.record(1, "b", now), Some("a"));
        assert_eq!(map.get(&1, now), Some(&"b"));
    }

    #[test]
    fn test_expired_lookup_misses_before_eviction() {
        let now = Instant::now();
        let mut map = AgingMap::new(TIMEOUT);
        map.record(1u32, "a", now);
        assert_eq!(map.get(&1, now + TIMEOUT), None);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_expire_evicts() {
        let now = Instant::now();
        let mut map = AgingMap::new(TIMEOUT);
        map.record(1u32, "a", now);
        map.record(2u32, "b", now + Duration::from_secs(5));

        assert!(map.expire(now + Duration::from_secs(9)).is_empty());
        assert_eq!(map.expire(now + TIMEOUT), vec![(1, "a")]);
        assert_eq!(map.len(), 1);
        assert_eq!(map.expire(now + Duration::from_secs(15)), vec![(2, "b")]);
        assert!(map.is_empty());
        assert_eq!(map.next_deadline(), None);
    }

    #[test]
    fn test_refresh_reschedules() {
        let now = Instant::now();
        let mut map = AgingMap::new(TIMEOUT);
        map.record(1u32, "a", now);
        map.record(1, "a", now + Duration::from_secs(8));

        assert!(map.expire(now + TIMEOUT).is_empty());
        assert_eq!(map.get(&1, now + TIMEOUT), Some(&"a"));
        assert_eq!(
            map.next_deadline(),
            Some(now + Duration::from_secs(18))
        );
        assert_eq!(map.expire(now + Duration::from_secs(18)).len(), 1);
    }

    #[test]
    fn test_static_never_expires() {
        let now = Instant::now();
        let mut map = AgingMap::new(TIMEOUT);
        map.record(1u32, "dyn", now);
        map.insert_static(1, "static");
        assert!(map.is_static(&1));
        assert!(map.expire(now + TIMEOUT * 100).is_empty());
        assert_eq!(map.get(&1, now + TIMEOUT * 100), Some(&"static"));

        // learning does not override a static binding
        assert_eq!(map.record(1, "learned", now), None);
        assert_eq!(map.get(&1, now), Some(&"static"));
    }

    #[test]
    fn test_remove_then_stale_heap_item() {
        let now = Instant::now();
        let mut map = AgingMap::new(TIMEOUT);
        map.record(1u32, "a", now);
        assert_eq!(map.remove(&1), Some("a"));
        assert!(map.expire(now + TIMEOUT).is_empty());
    }

    #[test]
    fn test_shorter_timeout_applies_on_refresh() {
        let now = Instant::now();
        let mut map = AgingMap::new(TIMEOUT);
        map.record(1u32, "a", now);
        map.set_timeout(Duration::from_secs(2));
        map.record(1, "a", now + Duration::from_secs(1));
        assert_eq!(map.expire(now + Duration::from_secs(3)), vec![(1, "a")]);
    }

    #[test]
    fn test_entries_reports_remaining() {
        let now = Instant::now();
        let mut map = AgingMap::new(TIMEOUT);
        map.record(1u32, "a", now);
        map.insert_static(2, "s");
        let mut entries = map.entries(now + Duration::from_secs(4));
        entries.sort_by_key(|e| e.key);
        assert_eq!(entries[0].remaining, Some(Duration::from_secs(6)));
        assert_eq!(entries[1].remaining, None);
        assert_eq!(map.entries(now + TIMEOUT).len(), 1);
    }

    #[test]
    fn test_retain() {
        let now = Instant::now();
        let mut map = AgingMap::new(TIMEOUT);
        map.record(1u32, "p1", now);
        map.record(2u32, "p2", now);
        map.retain(|_, v| *v != "p1");
        assert_eq!(map.get(&1, now), None);
        assert_eq!(map.get(&2, now), Some(&"p2"));
    }
}
