use std::sync::Arc;
use std::time::Duration;

use bridge_dial::{Dialer, PeerCache};
use libp2p::{Multiaddr, PeerId};

/// A peer surfaced by one of the discovery sources, with whatever addresses came with it.
#[derive(Debug, Clone)]
pub struct DiscoveredPeer {
    pub peer: PeerId,
    pub addrs: Vec<Multiaddr>,
}

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(15);

/// Notes `found`'s addresses, reserves an attempt if the peer isn't rate-limited, and dials it.
/// Failures are logged at debug only — discovery dials are opportunistic.
pub(crate) async fn note_and_dial<D>(dialer: &Arc<D>, peer_cache: &Arc<PeerCache>, found: DiscoveredPeer, source: &'static str)
where
    D: Dialer + 'static,
{
    peer_cache.note_addrs(found.peer, found.addrs.iter().cloned());

    if dialer.is_connected(found.peer).await {
        tracing::debug!(peer = %found.peer, source, "skipping already-connected peer");
        return;
    }

    if !peer_cache.try_reserve_attempt(found.peer) {
        tracing::debug!(peer = %found.peer, source, "skipping rate-limited peer");
        return;
    }

    let peer = found.peer;
    let outcome = tokio::time::timeout(DIAL_TIMEOUT, dialer.dial(peer, &found.addrs)).await;
    match outcome {
        Ok(Ok(())) => tracing::debug!(%peer, source, "discovery dial succeeded"),
        Ok(Err(error)) => tracing::debug!(%peer, source, %error, "discovery dial failed"),
        Err(_) => tracing::debug!(%peer, source, "discovery dial timed out"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_dial::DialFailure;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDialer {
        already_connected: bool,
        call_count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Dialer for CountingDialer {
        async fn dial(&self, _peer: PeerId, _addrs: &[Multiaddr]) -> Result<(), DialFailure> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn is_connected(&self, _peer: PeerId) -> bool {
            self.already_connected
        }
    }

    #[tokio::test]
    async fn skips_dialing_an_already_connected_peer() {
        let call_count = Arc::new(AtomicUsize::new(0));
        let dialer = Arc::new(CountingDialer {
            already_connected: true,
            call_count: Arc::clone(&call_count),
        });
        let peer_cache = Arc::new(PeerCache::default());
        let found = DiscoveredPeer {
            peer: PeerId::random(),
            addrs: vec![],
        };

        note_and_dial(&dialer, &peer_cache, found, "test").await;

        assert_eq!(call_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dials_a_peer_that_is_not_yet_connected() {
        let call_count = Arc::new(AtomicUsize::new(0));
        let dialer = Arc::new(CountingDialer {
            already_connected: false,
            call_count: Arc::clone(&call_count),
        });
        let peer_cache = Arc::new(PeerCache::default());
        let found = DiscoveredPeer {
            peer: PeerId::random(),
            addrs: vec![],
        };

        note_and_dial(&dialer, &peer_cache, found, "test").await;

        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }
}
