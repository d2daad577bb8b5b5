//! In-memory snapshot cache.

use crate::types::{Snapshot, SnapshotId};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use tracing::trace;

/// Bounded cache of projection snapshots. The least recently used entry
/// is evicted once the cache is full.
pub struct SnapshotCache {
    cache: Mutex<LruCache<SnapshotId, Snapshot>>,
}

impl SnapshotCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, id: &SnapshotId) -> Option<Snapshot> {
        self.cache.lock().get(id).cloned()
    }

    /// Store or replace the snapshot under its id.
    pub fn set(&self, snapshot: Snapshot) {
        trace!(key = %snapshot.id.key, uuid = %snapshot.id.uuid, "snapshot stored");
        self.cache.lock().put(snapshot.id.clone(), snapshot);
    }

    pub fn clear(&self, id: &SnapshotId) {
        self.cache.lock().pop(id);
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn snapshot(key: &str, bytes: &[u8]) -> Snapshot {
        Snapshot {
            id: SnapshotId::new(key, Uuid::nil()),
            last_fact: Uuid::new_v4(),
            bytes: bytes.to_vec(),
        }
    }

    #[test]
    fn test_set_get_clear() {
        let cache = SnapshotCache::new(10);
        let snap = snapshot("orders", b"state");
        let id = snap.id.clone();

        assert!(cache.get(&id).is_none());
        cache.set(snap.clone());
        assert_eq!(cache.get(&id), Some(snap));

        cache.clear(&id);
        assert!(cache.get(&id).is_none());
    }

    #[test]
    fn test_set_replaces() {
        let cache = SnapshotCache::new(10);
        cache.set(snapshot("orders", b"v1"));
        cache.set(snapshot("orders", b"v2"));

        let id = SnapshotId::new("orders", Uuid::nil());
        assert_eq!(cache.get(&id).unwrap().bytes, b"v2");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_uuid_is_part_of_key() {
        let cache = SnapshotCache::new(10);
        let agg = Uuid::new_v4();
        cache.set(Snapshot {
            id: SnapshotId::new("orders", agg),
            last_fact: Uuid::new_v4(),
            bytes: vec![1],
        });

        assert!(cache.get(&SnapshotId::new("orders", agg)).is_some());
        assert!(cache.get(&SnapshotId::new("orders", Uuid::nil())).is_none());
    }

    #[test]
    fn test_eviction() {
        let cache = SnapshotCache::new(2);
        cache.set(snapshot("a", b""));
        cache.set(snapshot("b", b""));
        cache.set(snapshot("c", b""));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&SnapshotId::new("a", Uuid::nil())).is_none());
    }
}
