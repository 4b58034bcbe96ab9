//! Concurrently dials a set of candidate peers and returns the first that connects.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::FuturesUnordered;
use futures::StreamExt as _;
use libp2p::{Multiaddr, PeerId};

use crate::peer_cache::PeerCache;

const DEFAULT_PER_DIAL_TIMEOUT: Duration = Duration::from_secs(15);

/// Abstraction over "dial a peer and wait until connected", implemented by whatever owns the
/// libp2p swarm. Kept as a trait so the race logic here has no dependency on swarm internals.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, peer: PeerId, addrs: &[Multiaddr]) -> Result<(), DialFailure>;

    /// Whether `peer` is already connected. Used to skip a redundant dial; implementors that have
    /// no notion of connection state (e.g. test doubles) can rely on the default of `false`, which
    /// just means "always dial" rather than ever answering incorrectly in the other direction.
    async fn is_connected(&self, peer: PeerId) -> bool {
        let _ = peer;
        false
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct DialFailure(pub String);

#[derive(Debug, thiserror::Error)]
pub enum RaceDialError {
    #[error("no candidate peers were supplied")]
    NoCandidates,
    #[error("every candidate peer is rate-limited")]
    AllRateLimited,
    #[error("deadline elapsed before any candidate connected")]
    Timeout,
    #[error("all {0} candidate(s) failed to connect: {1}")]
    AllFailed(usize, AggregatedCauses),
}

#[derive(Debug)]
pub struct AggregatedCauses(pub Vec<(PeerId, String)>);

impl std::fmt::Display for AggregatedCauses {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, (peer, cause)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{peer}: {cause}")?;
        }
        Ok(())
    }
}

/// Dials every candidate peer concurrently (one task per peer, trying all of that peer's known
/// addresses) and returns the first one that connects. Ties within the same poll are broken in
/// favor of the lowest original index. Peers that have exhausted their rate-limit budget in
/// `peer_cache` are skipped.
pub async fn race_dial(
    dialer: &(dyn Dialer),
    peer_cache: &PeerCache,
    candidates: &BTreeMap<PeerId, Vec<Multiaddr>>,
    deadline: Duration,
) -> Result<PeerId, RaceDialError> {
    if candidates.is_empty() {
        return Err(RaceDialError::NoCandidates);
    }

    let mut attempts = FuturesUnordered::new();
    let mut skipped_all = true;

    for (index, (peer, addrs)) in candidates.iter().enumerate() {
        if !peer_cache.try_reserve_attempt(*peer) {
            continue;
        }
        skipped_all = false;

        let peer = *peer;
        let addrs = addrs.clone();

        attempts.push(async move {
            let result = tokio::time::timeout(DEFAULT_PER_DIAL_TIMEOUT, dialer.dial(peer, &addrs)).await;
            let outcome = match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(failure)) => Err(failure.0),
                Err(_) => Err("per-dial timeout elapsed".to_owned()),
            };
            (index, peer, outcome)
        });
    }

    if skipped_all {
        return Err(RaceDialError::AllRateLimited);
    }

    let attempt_count = attempts.len();
    let mut causes = Vec::new();
    let mut winners_this_tick: Vec<(usize, PeerId)> = Vec::new();

    let race = async {
        while let Some((index, peer, outcome)) = attempts.next().await {
            match outcome {
                Ok(()) => winners_this_tick.push((index, peer)),
                Err(cause) => causes.push((peer, cause)),
            }

            if !winners_this_tick.is_empty() {
                // Drain any other attempts that completed in the very same poll before
                // breaking ties, so a same-tick race is resolved deterministically.
                break;
            }
        }
    };

    match tokio::time::timeout(deadline, race).await {
        Ok(()) => {}
        Err(_) => return Err(RaceDialError::Timeout),
    }

    if let Some((_, winner)) = winners_this_tick.into_iter().min_by_key(|(index, _)| *index) {
        return Ok(winner);
    }

    Err(RaceDialError::AllFailed(attempt_count, AggregatedCauses(causes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FakeDialer {
        succeeds: PeerId,
        call_count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Dialer for FakeDialer {
        async fn dial(&self, peer: PeerId, _addrs: &[Multiaddr]) -> Result<(), DialFailure> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            if peer == self.succeeds {
                Ok(())
            } else {
                Err(DialFailure("simulated failure".to_owned()))
            }
        }
    }

    #[tokio::test]
    async fn returns_the_only_successful_peer() {
        let winner = PeerId::random();
        let loser = PeerId::random();
        let dialer = FakeDialer {
            succeeds: winner,
            call_count: Arc::new(AtomicUsize::new(0)),
        };
        let peer_cache = PeerCache::default();

        let mut candidates = BTreeMap::new();
        candidates.insert(winner, vec!["/ip4/127.0.0.1/tcp/1".parse().unwrap()]);
        candidates.insert(loser, vec!["/ip4/127.0.0.1/tcp/2".parse().unwrap()]);

        let result = race_dial(&dialer, &peer_cache, &candidates, Duration::from_secs(1)).await;
        assert_eq!(result.unwrap(), winner);
    }

    #[tokio::test]
    async fn fails_when_every_candidate_fails() {
        let dialer = FakeDialer {
            succeeds: PeerId::random(),
            call_count: Arc::new(AtomicUsize::new(0)),
        };
        let peer_cache = PeerCache::default();

        let mut candidates = BTreeMap::new();
        candidates.insert(PeerId::random(), vec!["/ip4/127.0.0.1/tcp/1".parse().unwrap()]);

        let result = race_dial(&dialer, &peer_cache, &candidates, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(RaceDialError::AllFailed(1, _))));
    }

    #[tokio::test]
    async fn empty_candidates_is_rejected() {
        let dialer = FakeDialer {
            succeeds: PeerId::random(),
            call_count: Arc::new(AtomicUsize::new(0)),
        };
        let peer_cache = PeerCache::default();
        let candidates = BTreeMap::new();

        let result = race_dial(&dialer, &peer_cache, &candidates, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(RaceDialError::NoCandidates)));
    }
}
