//! Periodic DHT-based peer discovery, advertising and querying a well-known provider tag.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bridge_dial::{Dialer, PeerCache};
use bridge_task::{ShutdownSignal, Task};

use crate::common::{note_and_dial, DiscoveredPeer};

pub const DEFAULT_QUERY_INTERVAL: Duration = Duration::from_secs(60);

/// Advertises our presence under the discovery tag and periodically queries for other
/// providers, grounded on the same provider-record mechanism the reference crate leans on
/// `libp2p::kad` for.
#[async_trait]
pub trait DhtProviderSource: Send + Sync {
    /// Publishes a provider record for the discovery tag. Called once at startup.
    async fn advertise(&self);

    /// Returns peers currently advertising the discovery tag (besides ourselves).
    async fn query_providers(&self) -> Vec<DiscoveredPeer>;
}

pub struct DhtDiscoveryTask<Q, D> {
    source: Arc<Q>,
    dialer: Arc<D>,
    peer_cache: Arc<PeerCache>,
    interval: Duration,
}

impl<Q, D> DhtDiscoveryTask<Q, D> {
    pub fn new(source: Arc<Q>, dialer: Arc<D>, peer_cache: Arc<PeerCache>) -> Self {
        Self {
            source,
            dialer,
            peer_cache,
            interval: DEFAULT_QUERY_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

#[async_trait]
impl<Q, D> Task for DhtDiscoveryTask<Q, D>
where
    Q: DhtProviderSource + 'static,
    D: Dialer + 'static,
{
    type Output = ();

    const NAME: &'static str = "dht-discovery";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        self.source.advertise().await;

        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_signal.wait() => {
                    tracing::debug!("DHT discovery task shutting down");
                    break;
                }
                _ = tick.tick() => {
                    for found in self.source.query_providers().await {
                        note_and_dial(&self.dialer, &self.peer_cache, found, "dht").await;
                    }
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
    use libp2p::{Multiaddr, PeerId};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    struct FixedSource {
        peers: Vec<PeerId>,
        advertised: AtomicUsize,
    }

    #[async_trait]
    impl DhtProviderSource for FixedSource {
        async fn advertise(&self) {
            self.advertised.fetch_add(1, Ordering::SeqCst);
        }

        async fn query_providers(&self) -> Vec<DiscoveredPeer> {
            self.peers
                .iter()
                .map(|&peer| DiscoveredPeer { peer, addrs: vec![] })
                .collect()
        }
    }

    struct RecordingDialer(Mutex<Vec<PeerId>>);

    #[async_trait]
    impl Dialer for RecordingDialer {
        async fn dial(&self, peer: PeerId, _addrs: &[Multiaddr]) -> Result<(), DialFailure> {
            self.0.lock().await.push(peer);
            Ok(())
        }
    }

    #[tokio::test]
    async fn advertises_once_then_dials_found_providers() {
        let peer = PeerId::random();
        let source = Arc::new(FixedSource {
            peers: vec![peer],
            advertised: AtomicUsize::new(0),
        });
        let dialer = Arc::new(RecordingDialer(Mutex::new(Vec::new())));
        let peer_cache = Arc::new(PeerCache::default());

        let task = DhtDiscoveryTask::new(Arc::clone(&source), Arc::clone(&dialer), peer_cache)
            .with_interval(Duration::from_millis(5));

        let (handle, signal) = ShutdownHandle::new();
        let run = tokio::spawn(task.run(signal));

        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.signal();
        run.await.unwrap();

        assert_eq!(source.advertised.load(Ordering::SeqCst), 1);
        assert!(dialer.0.lock().await.contains(&peer));
    }
}
