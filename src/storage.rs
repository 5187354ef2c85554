//! TTL-bounded key/value storage, keyed by digest.

use crate::id::NodeId;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// One week, the default time-to-live for a stored value.
pub const DEFAULT_TTL: Duration = Duration::from_secs(604_800);

struct Entry {
    value: Vec<u8>,
    inserted_at: Instant,
}

/// A map from key digest to opaque value, with TTL expiry and an optional
/// bounded-capacity, earliest-inserted eviction policy.
pub struct Storage {
    entries: HashMap<NodeId, Entry>,
    insertion_order: Vec<NodeId>,
    ttl: Duration,
    capacity: Option<usize>,
}

impl Storage {
    pub fn new(ttl: Duration, capacity: Option<usize>) -> Self {
        Self {
            entries: HashMap::new(),
            insertion_order: Vec::new(),
            ttl,
            capacity,
        }
    }

    /// Stores `value` under `key_digest`, evicting the earliest-inserted
    /// entry first if a capacity bound is set and already reached.
    pub fn set(&mut self, key_digest: NodeId, value: Vec<u8>) {
        if self.entries.contains_key(&key_digest) {
            self.insertion_order.retain(|k| k != &key_digest);
        } else if let Some(cap) = self.capacity {
            while self.entries.len() >= cap {
                if let Some(oldest) = self.insertion_order.first().copied() {
                    self.insertion_order.remove(0);
                    self.entries.remove(&oldest);
                } else {
                    break;
                }
            }
        }
        self.insertion_order.push(key_digest);
        self.entries.insert(
            key_digest,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn get(&self, key_digest: &NodeId) -> Option<&[u8]> {
        self.entries.get(key_digest).map(|e| e.value.as_slice())
    }

    /// Entries inserted more than `seconds` ago.
    pub fn iter_older_than(&self, seconds: u64) -> Vec<(NodeId, Vec<u8>)> {
        let threshold = Duration::from_secs(seconds);
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.inserted_at) > threshold)
            .map(|(k, e)| (*k, e.value.clone()))
            .collect()
    }

    /// Drops entries older than the configured TTL.
    pub fn cull(&mut self) {
        let now = Instant::now();
        let ttl = self.ttl;
        let expired: Vec<NodeId> = self
            .entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.inserted_at) > ttl)
            .map(|(k, _)| *k)
            .collect();
        for k in expired {
            self.entries.remove(&k);
            self.insertion_order.retain(|o| o != &k);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_round_trips() {
        let mut s = Storage::new(DEFAULT_TTL, None);
        let k = NodeId::digest(b"k");
        s.set(k, b"v".to_vec());
        assert_eq!(s.get(&k), Some(&b"v"[..]));
    }

    #[test]
    fn bounded_capacity_evicts_earliest_inserted() {
        let mut s = Storage::new(DEFAULT_TTL, Some(2));
        let (a, b, c) = (NodeId::digest(b"a"), NodeId::digest(b"b"), NodeId::digest(b"c"));
        s.set(a, b"1".to_vec());
        s.set(b, b"2".to_vec());
        s.set(c, b"3".to_vec());
        assert!(s.get(&a).is_none());
        assert!(s.get(&b).is_some());
        assert!(s.get(&c).is_some());
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn iter_older_than_zero_returns_everything() {
        let mut s = Storage::new(DEFAULT_TTL, None);
        s.set(NodeId::digest(b"a"), b"1".to_vec());
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(s.iter_older_than(0).len(), 1);
    }

    #[test]
    fn cull_drops_entries_past_ttl() {
        let mut s = Storage::new(Duration::from_millis(1), None);
        s.set(NodeId::digest(b"a"), b"1".to_vec());
        std::thread::sleep(Duration::from_millis(5));
        s.cull();
        assert!(s.is_empty());
    }
}
