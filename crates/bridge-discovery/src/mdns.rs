//! LAN peer discovery via mDNS.

use std::sync::Arc;

use async_trait::async_trait;
use bridge_dial::{Dialer, PeerCache};
use bridge_task::{ShutdownSignal, Task};
use tokio::sync::mpsc;

use crate::common::{note_and_dial, DiscoveredPeer};

/// Drives the mDNS "peer found" notifee: rate-limits and dials newly seen peers.
///
/// `events` is fed by whatever owns the libp2p swarm's `mdns::Behaviour`, translating its
/// `Event::Discovered` notifications into [`DiscoveredPeer`]s.
pub struct MdnsDiscoveryTask<D> {
    events: mpsc::UnboundedReceiver<DiscoveredPeer>,
    dialer: Arc<D>,
    peer_cache: Arc<PeerCache>,
}

impl<D> MdnsDiscoveryTask<D> {
    pub fn new(events: mpsc::UnboundedReceiver<DiscoveredPeer>, dialer: Arc<D>, peer_cache: Arc<PeerCache>) -> Self {
        Self { events, dialer, peer_cache }
    }
}

#[async_trait]
impl<D> Task for MdnsDiscoveryTask<D>
where
    D: Dialer + 'static,
{
    type Output = ();

    const NAME: &'static str = "mdns-discovery";

    async fn run(mut self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        loop {
            tokio::select! {
                _ = shutdown_signal.wait() => {
                    tracing::debug!("mDNS discovery task shutting down");
                    break;
                }
                found = self.events.recv() => {
                    let Some(found) = found else {
                        tracing::debug!("mDNS event channel closed");
                        break;
                    };
                    note_and_dial(&self.dialer, &self.peer_cache, found, "mdns").await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_dial::DialFailure;
    use bridge_task::ShutdownHandle;
    use libp2p::PeerId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDialer(Arc<AtomicUsize>);

    #[async_trait]
    impl Dialer for CountingDialer {
        async fn dial(&self, _peer: PeerId, _addrs: &[libp2p::Multiaddr]) -> Result<(), DialFailure> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn dials_newly_discovered_peer() {
        let (tx, rx) = mpsc::unbounded_channel();
        let count = Arc::new(AtomicUsize::new(0));
        let dialer = Arc::new(CountingDialer(Arc::clone(&count)));
        let peer_cache = Arc::new(PeerCache::default());

        let task = MdnsDiscoveryTask::new(rx, dialer, peer_cache);
        let (handle, signal) = ShutdownHandle::new();

        let peer = PeerId::random();
        tx.send(DiscoveredPeer { peer, addrs: vec![] }).unwrap();
        drop(tx);

        task.run(signal).await;
        drop(handle);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
