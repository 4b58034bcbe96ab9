//! TTL + FIFO-approximate-LRU cache from a raw gateway URL path to its decoded [`GatewayPath`].

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::codec::GatewayPath;

const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);
const DEFAULT_CAPACITY: usize = 512;

struct Entry {
    value: GatewayPath,
    expires_at: Instant,
}

struct Inner {
    map: HashMap<String, Entry>,
    order: VecDeque<String>,
}

/// Shared, thread-safe cache. Cloning is cheap (wraps an `Arc` internally via the caller holding
/// an `Arc<AddressCache>`); reads never block writers for long since no I/O happens under lock.
pub struct AddressCache {
    inner: RwLock<Inner>,
    ttl: Duration,
    capacity: usize,
}

impl Default for AddressCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_CAPACITY)
    }
}

impl AddressCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
            ttl,
            capacity,
        }
    }

    /// Returns the cached value for `path`, or `None` on a miss (including an expired entry,
    /// which is treated as a miss without being evicted here — eviction happens opportunistically
    /// on insert).
    pub fn get(&self, path: &str) -> Option<GatewayPath> {
        let guard = self.inner.read();
        let entry = guard.map.get(path)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(entry.value.clone())
    }

    /// Inserts or replaces the entry for `path`. Sweeps expired entries and evicts the oldest
    /// insertion if the cache is at capacity.
    pub fn insert(&self, path: String, value: GatewayPath) {
        let mut guard = self.inner.write();

        let now = Instant::now();
        let ttl = self.ttl;

        // Opportunistic sweep of expired entries.
        while let Some(front) = guard.order.front() {
            let expired = match guard.map.get(front) {
                Some(e) => e.expires_at <= now,
                None => true,
            };
            if expired {
                let front = guard.order.pop_front().unwrap();
                guard.map.remove(&front);
            } else {
                break;
            }
        }

        if !guard.map.contains_key(&path) && guard.map.len() >= self.capacity {
            if let Some(oldest) = guard.order.pop_front() {
                guard.map.remove(&oldest);
            }
        }

        // A refresh of an already-cached key must not leave its old `order` entry behind, or the
        // stale duplicate can reach the front and evict the entry it was just refreshing.
        guard.order.retain(|existing| *existing != path);
        guard.order.push_back(path.clone());
        guard.map.insert(
            path,
            Entry {
                value,
                expires_at: now + ttl,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.inner.read().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::{Multiaddr, PeerId};

    fn sample_value() -> GatewayPath {
        let peer = PeerId::random();
        GatewayPath {
            peer,
            addrs: vec![format!("/ip4/127.0.0.1/tcp/4001/p2p/{peer}").parse::<Multiaddr>().unwrap()],
            service_path: "/svc/Method".to_owned(),
        }
    }

    #[test]
    fn miss_on_unknown_path() {
        let cache = AddressCache::default();
        assert!(cache.get("/@unknown").is_none());
    }

    #[test]
    fn hit_after_insert() {
        let cache = AddressCache::default();
        let value = sample_value();
        cache.insert("/@path".to_owned(), value.clone());
        assert_eq!(cache.get("/@path"), Some(value));
    }

    #[test]
    fn miss_after_ttl_elapses() {
        let cache = AddressCache::new(Duration::from_millis(1), DEFAULT_CAPACITY);
        cache.insert("/@path".to_owned(), sample_value());
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("/@path").is_none());
    }

    #[test]
    fn refreshing_a_key_does_not_leave_a_stale_order_entry_that_evicts_it() {
        let cache = AddressCache::new(DEFAULT_TTL, 2);
        cache.insert("/@a".to_owned(), sample_value());
        cache.insert("/@b".to_owned(), sample_value());
        // Refresh "/@a": without deduplicating its old `order` entry, the deque ends up with
        // ["/@a", "/@b", "/@a"], and the next insert's eviction pops the front "/@a" — leaving a
        // dangling entry in `order` for a key that's actually still live.
        cache.insert("/@a".to_owned(), sample_value());
        cache.insert("/@c".to_owned(), sample_value());

        assert!(cache.get("/@a").is_some(), "just-refreshed entry must survive the next eviction");
        assert!(cache.get("/@b").is_none());
        assert!(cache.get("/@c").is_some());
    }

    #[test]
    fn evicts_oldest_insertion_at_capacity() {
        let cache = AddressCache::new(DEFAULT_TTL, 2);
        cache.insert("/@a".to_owned(), sample_value());
        cache.insert("/@b".to_owned(), sample_value());
        cache.insert("/@c".to_owned(), sample_value());

        assert!(cache.get("/@a").is_none());
        assert!(cache.get("/@b").is_some());
        assert!(cache.get("/@c").is_some());
    }
}
