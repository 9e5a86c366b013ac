use std::collections::{HashMap, HashSet, VecDeque};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::metainfo::InfoHash;

type CacheKey = (InfoHash, u32);

/// Byte-bounded cache of whole verified pieces served to uploading peers.
///
/// Two resident lists split the budget: `recent` holds pieces seen once,
/// `frequent` holds pieces hit again. Ghost lists of recently evicted keys
/// steer the split, so a scan of one-shot requests cannot flush the pieces
/// that are actually hot. Entries for a torrent are dropped wholesale when
/// its data moves or the torrent is removed.
pub struct PieceCache {
    inner: Mutex<Inner>,
    capacity: usize,
}

struct Inner {
    recent: Tier,
    frequent: Tier,
    ghost_recent: Ghost,
    ghost_frequent: Ghost,
    /// Byte share of the budget currently granted to `recent`.
    target_recent: usize,
}

#[derive(Default)]
struct Tier {
    order: VecDeque<CacheKey>,
    data: HashMap<CacheKey, Bytes>,
    bytes: usize,
}

#[derive(Default)]
struct Ghost {
    order: VecDeque<CacheKey>,
    keys: HashSet<CacheKey>,
}

impl Tier {
    fn get(&self, key: &CacheKey) -> Option<Bytes> {
        self.data.get(key).cloned()
    }

    fn insert(&mut self, key: CacheKey, data: Bytes) {
        if let Some(old) = self.data.insert(key, data.clone()) {
            self.bytes -= old.len();
        } else {
            self.order.push_back(key);
        }
        self.bytes += data.len();
    }

    fn remove(&mut self, key: &CacheKey) -> Option<Bytes> {
        let data = self.data.remove(key)?;
        self.order.retain(|k| k != key);
        self.bytes -= data.len();
        Some(data)
    }

    fn pop_oldest(&mut self) -> Option<(CacheKey, Bytes)> {
        while let Some(key) = self.order.pop_front() {
            if let Some(data) = self.data.remove(&key) {
                self.bytes -= data.len();
                return Some((key, data));
            }
        }
        None
    }

    fn refresh(&mut self, key: &CacheKey) {
        if self.data.contains_key(key) {
            self.order.retain(|k| k != key);
            self.order.push_back(*key);
        }
    }
}

impl Ghost {
    fn insert(&mut self, key: CacheKey) {
        if self.keys.insert(key) {
            self.order.push_back(key);
        }
        // Ghosts only need to remember as far back as the cache is deep.
        while self.order.len() > 4096 {
            if let Some(old) = self.order.pop_front() {
                self.keys.remove(&old);
            }
        }
    }

    fn take(&mut self, key: &CacheKey) -> bool {
        if self.keys.remove(key) {
            self.order.retain(|k| k != key);
            true
        } else {
            false
        }
    }
}

impl PieceCache {
    /// Creates a cache bounded to `capacity` bytes of piece data.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                recent: Tier::default(),
                frequent: Tier::default(),
                ghost_recent: Ghost::default(),
                ghost_frequent: Ghost::default(),
                target_recent: capacity / 2,
            }),
            capacity,
        }
    }

    pub fn get(&self, hash: InfoHash, index: u32) -> Option<Bytes> {
        let key = (hash, index);
        let mut inner = self.inner.lock();

        if let Some(data) = inner.recent.remove(&key) {
            // Second hit: promote to the frequent tier.
            inner.frequent.insert(key, data.clone());
            return Some(data);
        }
        if let Some(data) = inner.frequent.get(&key) {
            inner.frequent.refresh(&key);
            return Some(data);
        }
        None
    }

    pub fn insert(&self, hash: InfoHash, index: u32, data: Bytes) {
        if data.len() > self.capacity {
            return;
        }
        let key = (hash, index);
        let mut inner = self.inner.lock();

        if inner.ghost_recent.take(&key) {
            // Recently evicted from `recent`: it deserved more room.
            inner.target_recent =
                (inner.target_recent + data.len()).min(self.capacity);
            inner.frequent.insert(key, data);
        } else if inner.ghost_frequent.take(&key) {
            inner.target_recent = inner.target_recent.saturating_sub(data.len());
            inner.frequent.insert(key, data);
        } else {
            inner.recent.insert(key, data);
        }

        self.shrink(&mut inner);
    }

    /// Drops every cached piece of one torrent.
    pub fn remove_torrent(&self, hash: InfoHash) {
        let mut inner = self.inner.lock();
        let keys: Vec<CacheKey> = inner
            .recent
            .data
            .keys()
            .filter(|(h, _)| *h == hash)
            .copied()
            .collect();
        for key in keys {
            inner.recent.remove(&key);
        }
        let keys: Vec<CacheKey> = inner
            .frequent
            .data
            .keys()
            .filter(|(h, _)| *h == hash)
            .copied()
            .collect();
        for key in keys {
            inner.frequent.remove(&key);
        }
    }

    pub fn bytes_used(&self) -> usize {
        let inner = self.inner.lock();
        inner.recent.bytes + inner.frequent.bytes
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn shrink(&self, inner: &mut Inner) {
        while inner.recent.bytes + inner.frequent.bytes > self.capacity {
            let evict_recent = inner.recent.bytes > inner.target_recent
                || inner.frequent.bytes == 0;
            if evict_recent {
                if let Some((key, _)) = inner.recent.pop_oldest() {
                    inner.ghost_recent.insert(key);
                    continue;
                }
            }
            match inner.frequent.pop_oldest() {
                Some((key, _)) => inner.ghost_frequent.insert(key),
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(n: u8) -> InfoHash {
        InfoHash([n; 20])
    }

    fn piece(len: usize) -> Bytes {
        Bytes::from(vec![0u8; len])
    }

    #[test]
    fn test_get_after_insert() {
        let cache = PieceCache::new(1024);
        cache.insert(hash(1), 0, Bytes::from_static(b"data"));
        assert_eq!(cache.get(hash(1), 0), Some(Bytes::from_static(b"data")));
        assert_eq!(cache.get(hash(1), 1), None);
        assert_eq!(cache.get(hash(2), 0), None);
    }

    #[test]
    fn test_capacity_is_respected() {
        let cache = PieceCache::new(100);
        for i in 0..20 {
            cache.insert(hash(1), i, piece(10));
        }
        assert!(cache.bytes_used() <= 100);
    }

    #[test]
    fn test_repeated_hits_survive_a_scan() {
        let cache = PieceCache::new(100);
        cache.insert(hash(1), 0, piece(40));
        // Two hits promote the piece to the frequent tier.
        assert!(cache.get(hash(1), 0).is_some());
        assert!(cache.get(hash(1), 0).is_some());

        for i in 1..30 {
            cache.insert(hash(1), i, piece(10));
        }
        assert!(cache.get(hash(1), 0).is_some());
    }

    #[test]
    fn test_remove_torrent_drops_all_pieces() {
        let cache = PieceCache::new(1024);
        cache.insert(hash(1), 0, piece(16));
        cache.insert(hash(1), 1, piece(16));
        cache.insert(hash(2), 0, piece(16));

        cache.remove_torrent(hash(1));
        assert_eq!(cache.get(hash(1), 0), None);
        assert_eq!(cache.get(hash(1), 1), None);
        assert!(cache.get(hash(2), 0).is_some());
    }

    #[test]
    fn test_oversized_piece_is_not_cached() {
        let cache = PieceCache::new(8);
        cache.insert(hash(1), 0, piece(16));
        assert_eq!(cache.get(hash(1), 0), None);
        assert_eq!(cache.bytes_used(), 0);
    }
}
