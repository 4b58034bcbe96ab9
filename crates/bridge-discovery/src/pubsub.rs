//! Presence advertisement and peer discovery over a well-known gossipsub topic.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bridge_dial::{Dialer, PeerCache};
use bridge_task::{ShutdownSignal, Task};

use crate::common::{note_and_dial, DiscoveredPeer};

pub const DEFAULT_BROADCAST_INTERVAL: Duration = Duration::from_secs(30);

/// Glue to a `libp2p::gossipsub::Behaviour` topic, grounded on the same "self-describing presence
/// record" idea as the DHT provider advertisement, but pushed rather than pulled.
#[async_trait]
pub trait PresenceChannel: Send + Sync {
    /// Whether the topic currently has any subscribers besides ourselves.
    async fn has_subscribers(&self) -> bool;

    /// Publishes a record describing our peer id, public key, and current listen addresses.
    async fn publish_self_record(&self);

    /// Awaits the next presence record received from another peer on the topic, or `None` once
    /// the underlying channel has closed.
    async fn recv_announcement(&self) -> Option<DiscoveredPeer>;
}

pub struct PresenceTask<P, D> {
    channel: Arc<P>,
    dialer: Arc<D>,
    peer_cache: Arc<PeerCache>,
    interval: Duration,
}

impl<P, D> PresenceTask<P, D> {
    pub fn new(channel: Arc<P>, dialer: Arc<D>, peer_cache: Arc<PeerCache>) -> Self {
        Self {
            channel,
            dialer,
            peer_cache,
            interval: DEFAULT_BROADCAST_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

#[async_trait]
impl<P, D> Task for PresenceTask<P, D>
where
    P: PresenceChannel + 'static,
    D: Dialer + 'static,
{
    type Output = ();

    const NAME: &'static str = "pubsub-presence";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_signal.wait() => {
                    tracing::debug!("pubsub presence task shutting down");
                    break;
                }
                _ = tick.tick() => {
                    if self.channel.has_subscribers().await {
                        self.channel.publish_self_record().await;
                    }
                }
                announcement = self.channel.recv_announcement() => {
                    let Some(found) = announcement else {
                        tracing::debug!("presence channel closed");
                        break;
                    };
                    note_and_dial(&self.dialer, &self.peer_cache, found, "pubsub").await;
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

    struct FakeChannel {
        subscribers: bool,
        publishes: AtomicUsize,
        announcements: Mutex<Vec<Option<DiscoveredPeer>>>,
    }

    #[async_trait]
    impl PresenceChannel for FakeChannel {
        async fn has_subscribers(&self) -> bool {
            self.subscribers
        }

        async fn publish_self_record(&self) {
            self.publishes.fetch_add(1, Ordering::SeqCst);
        }

        async fn recv_announcement(&self) -> Option<DiscoveredPeer> {
            let mut queue = self.announcements.lock().await;
            if queue.is_empty() {
                std::future::pending::<()>().await;
            }
            queue.remove(0)
        }
    }

    struct NullDialer;

    #[async_trait]
    impl Dialer for NullDialer {
        async fn dial(&self, _peer: PeerId, _addrs: &[Multiaddr]) -> Result<(), DialFailure> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn skips_publish_when_topic_has_no_subscribers() {
        let channel = Arc::new(FakeChannel {
            subscribers: false,
            publishes: AtomicUsize::new(0),
            announcements: Mutex::new(vec![None]),
        });
        let dialer = Arc::new(NullDialer);
        let peer_cache = Arc::new(PeerCache::default());

        let task = PresenceTask::new(Arc::clone(&channel), dialer, peer_cache).with_interval(Duration::from_millis(5));
        let (_handle, signal) = ShutdownHandle::new();

        let run = tokio::spawn(task.run(signal));
        tokio::time::timeout(Duration::from_millis(50), run).await.ok();

        assert_eq!(channel.publishes.load(Ordering::SeqCst), 0);
    }
}
