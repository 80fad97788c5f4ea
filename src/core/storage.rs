use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::identifier::Key;

/// Opaque payload stored by upper layers.
pub type Record = Vec<u8>;

pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60); // 24 hours
pub const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Clone)]
struct Entry {
    record: Record,
    expires_at: Instant,
}

/// Records held by one virtual node, each with its own expiry.
#[derive(Debug, Default)]
pub struct Storage {
    map: HashMap<Key, Entry>,
}

impl Storage {
    pub fn new() -> Self {
        Storage {
            map: HashMap::new(),
        }
    }

    /// Store `record` under `key`. Lifetimes are capped at [`MAX_TTL`].
    pub fn insert_with_ttl(&mut self, key: Key, record: Record, ttl: Duration) {
        let expires_at = Instant::now() + ttl.min(MAX_TTL);
        let entry = Entry { record, expires_at };
        self.map.insert(key, entry);
    }

    pub fn get(&self, key: &Key) -> Option<&Record> {
        match self.map.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(&entry.record),
            _ => None,
        }
    }

    /// Number of records that have not expired yet.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.map.values().filter(|e| e.expires_at > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every live record together with its remaining lifetime, leaving
    /// the store empty. Used to hand records over when leaving the ring.
    pub fn drain_live(&mut self) -> Vec<(Key, Record, Duration)> {
        let now = Instant::now();
        self.map
            .drain()
            .filter(|(_, e)| e.expires_at > now)
            .map(|(k, e)| (k, e.record, e.expires_at - now))
            .collect()
    }

    pub fn purge_expired(&mut self) -> usize {
        let now = Instant::now();
        let before = self.map.len();
        self.map.retain(|_, entry| entry.expires_at > now);
        before - self.map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::identifier::NodeID;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn record_expires_and_is_purged() {
        let mut storage = Storage::new();
        let key: Key = NodeID::random();
        let val: Record = b"hello".to_vec();

        // Insert with a very short TTL
        storage.insert_with_ttl(key, val.clone(), Duration::from_millis(10));

        // Immediately available
        assert_eq!(storage.get(&key), Some(&val));

        thread::sleep(Duration::from_millis(20));

        // Expired entries are invisible before they are purged
        assert_eq!(storage.get(&key), None);
        assert_eq!(storage.len(), 0);
        assert!(storage.is_empty());

        // Purge removes the expired entry physically
        assert_eq!(storage.purge_expired(), 1);
        assert!(!storage.map.contains_key(&key));
    }

    #[test]
    fn oversized_ttl_is_capped() {
        let mut storage = Storage::new();
        let key = NodeID::from_hashed(&"forever");
        storage.insert_with_ttl(key, b"v".to_vec(), Duration::MAX);
        storage.insert_with_ttl(NodeID::from_hashed(&"secs"), b"w".to_vec(), Duration::from_secs(u64::MAX));
        assert_eq!(storage.get(&key), Some(&b"v".to_vec()));
        assert_eq!(storage.len(), 2);

        let drained = storage.drain_live();
        assert!(drained.iter().all(|(_, _, ttl)| *ttl <= MAX_TTL));
    }

    #[test]
    fn drain_skips_expired_records() {
        let mut storage = Storage::new();
        let live = NodeID::from_hashed(&"live");
        let dead = NodeID::from_hashed(&"dead");
        storage.insert_with_ttl(live, b"a".to_vec(), DEFAULT_TTL);
        storage.insert_with_ttl(dead, b"b".to_vec(), Duration::ZERO);

        let drained = storage.drain_live();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].0, live);
        assert!(drained[0].2 > Duration::from_secs(60));
        assert!(storage.is_empty());
    }
}
