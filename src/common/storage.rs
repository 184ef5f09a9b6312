//! Timestamped local key/value storage with TTL expiry.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::common::{Id, Value};

/// Default age after which a stored entry is purged.
pub const DEFAULT_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Microseconds since a process-local monotonic origin.
///
/// These counters travel over the wire and are compared across nodes for
/// last-writer-wins resolution even though independent processes have
/// unrelated origins. That is the protocol's documented behavior, kept
/// rather than switched to wall-clock time.
pub fn monotonic_now() -> u64 {
    use std::sync::OnceLock;
    static ORIGIN: OnceLock<Instant> = OnceLock::new();

    let origin = ORIGIN.get_or_init(Instant::now);
    origin.elapsed().as_micros() as u64
}

#[derive(Debug, Clone)]
/// A value along with the writer's timestamp at write time.
pub struct StoredEntry {
    pub timestamp: u64,
    pub value: Value,
    written_at: Instant,
}

impl StoredEntry {
    /// Age of this entry by the local clock, regardless of the wire timestamp.
    pub fn age(&self) -> Duration {
        self.written_at.elapsed()
    }
}

#[derive(Debug)]
/// In-memory store of this node's share of the keyspace.
pub struct MemoryStore {
    ttl: Duration,
    entries: BTreeMap<Id, StoredEntry>,
}

impl MemoryStore {
    pub fn new(ttl: Duration) -> Self {
        MemoryStore {
            ttl,
            entries: BTreeMap::new(),
        }
    }

    // === Public Methods ===

    /// Write `(timestamp, value)` under `key`.
    ///
    /// Conflicts resolve by timestamp, not arrival order: an incoming write
    /// older than the stored one is dropped. Returns whether the write took.
    pub fn set(&mut self, key: Id, timestamp: u64, value: Value) -> bool {
        if let Some(existing) = self.entries.get(&key) {
            if existing.timestamp > timestamp {
                return false;
            }
        }

        self.entries.insert(
            key,
            StoredEntry {
                timestamp,
                value,
                written_at: Instant::now(),
            },
        );

        true
    }

    pub fn get(&self, key: &Id) -> Option<&StoredEntry> {
        self.entries.get(key).filter(|entry| entry.age() < self.ttl)
    }

    pub fn contains(&self, key: &Id) -> bool {
        self.get(key).is_some()
    }

    /// Remove every entry older than the TTL.
    pub fn cull(&mut self) {
        let ttl = self.ttl;
        self.entries.retain(|_, entry| entry.age() < ttl);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Id, &StoredEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    /// Pretend an entry was written `age` ago.
    pub fn backdate(&mut self, key: &Id, age: Duration) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.written_at = Instant::now() - age;
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn set_and_get() {
        let mut store = MemoryStore::default();
        let key = Id::for_key("foo");

        assert!(store.set(key, 1, Value::from("bar")));

        let entry = store.get(&key).unwrap();
        assert_eq!(entry.timestamp, 1);
        assert_eq!(entry.value, Value::from("bar"));
    }

    #[test]
    fn newer_timestamp_wins_regardless_of_arrival_order() {
        let mut store = MemoryStore::default();
        let key = Id::for_key("foo");

        assert!(store.set(key, 100, Value::from("old")));
        // Simulates out-of-order network delivery.
        assert!(!store.set(key, 50, Value::from("new")));

        assert_eq!(store.get(&key).unwrap().value, Value::from("old"));
        assert_eq!(store.get(&key).unwrap().timestamp, 100);

        assert!(store.set(key, 150, Value::from("newest")));
        assert_eq!(store.get(&key).unwrap().value, Value::from("newest"));
    }

    #[test]
    fn cull_removes_exactly_the_expired() {
        let mut store = MemoryStore::new(Duration::from_secs(60));

        let stale = Id::for_key("stale");
        let fresh = Id::for_key("fresh");

        store.set(stale, 1, Value::from(1i64));
        store.set(fresh, 2, Value::from(2i64));
        store.backdate(&stale, Duration::from_secs(120));

        store.cull();

        assert!(store.get(&stale).is_none());
        assert!(store.get(&fresh).is_some());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn expired_entries_are_invisible_before_cull() {
        let mut store = MemoryStore::new(Duration::from_secs(60));
        let key = Id::for_key("foo");

        store.set(key, 1, Value::from("bar"));
        store.backdate(&key, Duration::from_secs(120));

        assert!(store.get(&key).is_none());
    }
}
