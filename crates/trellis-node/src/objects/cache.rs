//! LRU cache of recently observed instance bursts, keyed by object.
//!
//! A hit on map short-circuits the instance transfer: the slave replays
//! the cached burst and tells the master which version it already holds.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use trellis_protocol::{NodeId, ObjectData, ObjectId, Version};
use trellis_stream::RawChunk;

/// One complete cached instance burst.
#[derive(Clone)]
pub struct CachedInstance {
    pub version: Version,
    pub chunks: Vec<RawChunk>,
    /// Node the burst originated from; purged when that node goes away.
    pub from: NodeId,
    pub swap: bool,
    created: Instant,
    last_used: Instant,
}

struct Partial {
    version: Version,
    next_seq: u32,
    chunks: Vec<RawChunk>,
    from: NodeId,
    swap: bool,
}

pub struct InstanceCache {
    capacity: usize,
    entries: HashMap<ObjectId, CachedInstance>,
    partials: HashMap<ObjectId, Partial>,
}

impl InstanceCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            partials: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a cached instance, refreshing its LRU position.
    pub fn get(&mut self, id: ObjectId) -> Option<CachedInstance> {
        let entry = self.entries.get_mut(&id)?;
        entry.last_used = Instant::now();
        Some(entry.clone())
    }

    /// Feed one observed instance chunk; a completed burst becomes a
    /// cache entry. Out-of-order chunks drop the partial burst.
    pub fn feed(&mut self, data: &ObjectData, from: NodeId, swap: bool) {
        if self.capacity == 0 {
            return;
        }
        let id = data.object_id;
        let chunk = RawChunk {
            compressor: data.compressor,
            n_chunks: data.n_chunks,
            data_size: data.data_size,
            body: data.body.clone(),
        };

        let partial = self.partials.entry(id).or_insert_with(|| Partial {
            version: data.version,
            next_seq: 0,
            chunks: Vec::new(),
            from,
            swap,
        });
        if partial.version != data.version || partial.next_seq != data.sequence {
            // Restart on a fresh burst head, drop anything else.
            if data.sequence == 0 {
                *partial = Partial {
                    version: data.version,
                    next_seq: 0,
                    chunks: Vec::new(),
                    from,
                    swap,
                };
            } else {
                self.partials.remove(&id);
                return;
            }
        }

        let partial = self.partials.get_mut(&id).unwrap();
        partial.chunks.push(chunk);
        partial.next_seq += 1;

        if data.last {
            let done = self.partials.remove(&id).unwrap();
            self.insert(
                id,
                CachedInstance {
                    version: done.version,
                    chunks: done.chunks,
                    from: done.from,
                    swap: done.swap,
                    created: Instant::now(),
                    last_used: Instant::now(),
                },
            );
        }
    }

    fn insert(&mut self, id: ObjectId, instance: CachedInstance) {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&id) {
            // Evict the least recently used entry.
            if let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(id, _)| *id)
            {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(id, instance);
    }

    /// Evict entries older than `age`.
    pub fn expire(&mut self, age: Duration) {
        let now = Instant::now();
        self.entries.retain(|_, e| now.duration_since(e.created) < age);
    }

    /// Purge everything learned from a departed node.
    pub fn remove_from(&mut self, node: NodeId) {
        self.entries.retain(|_, e| e.from != node);
        self.partials.retain(|_, p| p.from != node);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.partials.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn chunk(id: ObjectId, version: Version, seq: u32, last: bool) -> ObjectData {
        let payload = [seq as u8; 4];
        let mut body = Vec::new();
        body.extend_from_slice(&4u64.to_le_bytes());
        body.extend_from_slice(&payload);
        ObjectData {
            object_id: id,
            version,
            sequence: seq,
            last,
            compressor: 0,
            n_chunks: 0,
            data_size: 4,
            body: Bytes::from(body),
        }
    }

    #[test]
    fn test_complete_burst_cached() {
        let mut cache = InstanceCache::new(4);
        let id = ObjectId::random();
        let from = NodeId::random();
        cache.feed(&chunk(id, Version(2), 0, false), from, false);
        assert!(cache.get(id).is_none());
        cache.feed(&chunk(id, Version(2), 1, true), from, false);

        let hit = cache.get(id).unwrap();
        assert_eq!(hit.version, Version(2));
        assert_eq!(hit.chunks.len(), 2);
    }

    #[test]
    fn test_out_of_order_burst_dropped() {
        let mut cache = InstanceCache::new(4);
        let id = ObjectId::random();
        let from = NodeId::random();
        cache.feed(&chunk(id, Version(2), 0, false), from, false);
        cache.feed(&chunk(id, Version(2), 2, true), from, false); // gap
        assert!(cache.get(id).is_none());
    }

    #[test]
    fn test_lru_eviction() {
        let mut cache = InstanceCache::new(2);
        let from = NodeId::random();
        let ids: Vec<ObjectId> = (0..3).map(|_| ObjectId::random()).collect();
        for &id in &ids {
            cache.feed(&chunk(id, Version(1), 0, true), from, false);
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.get(ids[0]).is_none());
        assert!(cache.get(ids[2]).is_some());
    }

    #[test]
    fn test_remove_from_node() {
        let mut cache = InstanceCache::new(4);
        let gone = NodeId::random();
        let stays = NodeId::random();
        let a = ObjectId::random();
        let b = ObjectId::random();
        cache.feed(&chunk(a, Version(1), 0, true), gone, false);
        cache.feed(&chunk(b, Version(1), 0, true), stays, false);
        cache.remove_from(gone);
        assert!(cache.get(a).is_none());
        assert!(cache.get(b).is_some());
    }

    #[test]
    fn test_zero_capacity_disables() {
        let mut cache = InstanceCache::new(0);
        let id = ObjectId::random();
        cache.feed(&chunk(id, Version(1), 0, true), NodeId::random(), false);
        assert!(cache.get(id).is_none());
    }

    #[test]
    fn test_expire_by_age() {
        let mut cache = InstanceCache::new(4);
        let id = ObjectId::random();
        cache.feed(&chunk(id, Version(1), 0, true), NodeId::random(), false);
        cache.expire(Duration::from_secs(3600));
        assert!(cache.get(id).is_some());
        cache.expire(Duration::ZERO);
        assert!(cache.get(id).is_none());
    }
}
