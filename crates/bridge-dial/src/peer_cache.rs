//! Rate-limited, TTL-evicted record of recent dial attempts per peer.
//!
//! Shared across the race-dialer and the discovery loops (mDNS, DHT, pubsub) so that all three
//! sources coordinate on the same "at most 3 attempts per TTL window" budget for a given peer.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use libp2p::{Multiaddr, PeerId};
use parking_lot::Mutex;

const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);
const MAX_ATTEMPTS: usize = 3;

struct Entry {
    addrs: Vec<Multiaddr>,
    first_seen_at: Instant,
    attempt_count: usize,
}

pub struct PeerCache {
    entries: Mutex<HashMap<PeerId, Entry>>,
    ttl: Duration,
}

impl Default for PeerCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl PeerCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn evict_if_expired(entries: &mut HashMap<PeerId, Entry>, peer: &PeerId, ttl: Duration) {
        if let Some(entry) = entries.get(peer) {
            if entry.first_seen_at.elapsed() > ttl {
                entries.remove(peer);
            }
        }
    }

    /// Records addresses learned for `peer` (from discovery or a gateway path), without consuming
    /// an attempt budget.
    pub fn note_addrs(&self, peer: PeerId, addrs: impl IntoIterator<Item = Multiaddr>) {
        let mut entries = self.entries.lock();
        Self::evict_if_expired(&mut entries, &peer, self.ttl);

        let entry = entries.entry(peer).or_insert_with(|| Entry {
            addrs: Vec::new(),
            first_seen_at: Instant::now(),
            attempt_count: 0,
        });

        for addr in addrs {
            if !entry.addrs.contains(&addr) {
                entry.addrs.push(addr);
            }
        }
    }

    /// Returns `true` and records an attempt iff `peer` has not exceeded its attempt budget within
    /// the current TTL window.
    pub fn try_reserve_attempt(&self, peer: PeerId) -> bool {
        let mut entries = self.entries.lock();
        Self::evict_if_expired(&mut entries, &peer, self.ttl);

        let entry = entries.entry(peer).or_insert_with(|| Entry {
            addrs: Vec::new(),
            first_seen_at: Instant::now(),
            attempt_count: 0,
        });

        if entry.attempt_count >= MAX_ATTEMPTS {
            return false;
        }

        entry.attempt_count += 1;
        true
    }

    pub fn known_addrs(&self, peer: &PeerId) -> Vec<Multiaddr> {
        let mut entries = self.entries.lock();
        Self::evict_if_expired(&mut entries, peer, self.ttl);
        entries.get(peer).map(|e| e.addrs.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limits_after_max_attempts() {
        let cache = PeerCache::new(Duration::from_secs(60));
        let peer = PeerId::random();

        for _ in 0..MAX_ATTEMPTS {
            assert!(cache.try_reserve_attempt(peer));
        }
        assert!(!cache.try_reserve_attempt(peer));
    }

    #[test]
    fn resets_after_ttl_elapses() {
        let cache = PeerCache::new(Duration::from_millis(1));
        let peer = PeerId::random();

        for _ in 0..MAX_ATTEMPTS {
            assert!(cache.try_reserve_attempt(peer));
        }
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.try_reserve_attempt(peer));
    }

    #[test]
    fn dedups_noted_addrs() {
        let cache = PeerCache::default();
        let peer = PeerId::random();
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/4001".parse().unwrap();

        cache.note_addrs(peer, [addr.clone(), addr.clone()]);
        assert_eq!(cache.known_addrs(&peer), vec![addr]);
    }
}
