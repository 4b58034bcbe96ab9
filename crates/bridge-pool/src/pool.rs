//! Per-peer, per-protocol pool of libp2p streams.
//!
//! Assumes the caller already has (or has just established) a connection to the peer — this pool
//! only multiplexes *streams* over existing connections; connecting to a peer in the first place
//! is the race-dialer's job.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use bridge_io::Connection;
use libp2p::{PeerId, StreamProtocol};
use parking_lot::Mutex;

/// Idle streams older than this are discarded rather than reused, per this implementation's
/// resolution of the "pool eviction of idle streams" open question.
pub const MAX_IDLE_TIME: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("failed to open stream to {peer}: {source}")]
    OpenStream {
        peer: PeerId,
        #[source]
        source: libp2p_stream::OpenStreamError,
    },
}

struct Idle {
    conn: Connection,
    returned_at: Instant,
}

#[derive(Default)]
struct Queue {
    entries: VecDeque<Idle>,
    open_count: usize,
}

/// Process-wide (per host) connection and stream pool.
pub struct StreamPool {
    control: libp2p_stream::Control,
    queues: Mutex<HashMap<(PeerId, StreamProtocol), Queue>>,
}

impl StreamPool {
    pub fn new(control: libp2p_stream::Control) -> Self {
        Self {
            control,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a stream to `peer` on `protocol`, reusing an idle one when available and still
    /// fresh, otherwise opening a new one.
    pub async fn get_stream(&self, peer: PeerId, protocol: StreamProtocol) -> Result<Connection, PoolError> {
        if let Some(conn) = self.take_idle(peer, &protocol) {
            return Ok(conn);
        }

        let mut control = self.control.clone();
        let stream = control
            .open_stream(peer, protocol.clone())
            .await
            .map_err(|source| PoolError::OpenStream { peer, source })?;

        {
            let mut queues = self.queues.lock();
            queues.entry((peer, protocol)).or_default().open_count += 1;
        }

        Ok(Connection::new(stream, peer, None))
    }

    fn take_idle(&self, peer: PeerId, protocol: &StreamProtocol) -> Option<Connection> {
        let mut queues = self.queues.lock();
        let queue = queues.get_mut(&(peer, protocol.clone()))?;

        let now = Instant::now();
        while let Some(idle) = queue.entries.pop_front() {
            if now.duration_since(idle.returned_at) <= MAX_IDLE_TIME {
                return Some(idle.conn);
            }
            // Too old: drop it and keep looking.
            queue.open_count = queue.open_count.saturating_sub(1);
        }

        None
    }

    /// Returns a stream to the pool (if `keep` and `conn` is `Some`) or retires it. `conn` is
    /// `None` when the caller's transport (e.g. a handshaken HTTP/2 connection) has already
    /// consumed the original `Connection` and can't hand it back — the call still matters for
    /// `open_count` bookkeeping, it just has nothing to put in the idle queue.
    pub fn release(&self, peer: PeerId, protocol: StreamProtocol, conn: Option<Connection>, keep: bool) {
        match conn {
            Some(conn) if keep => {
                let mut queues = self.queues.lock();
                let queue = queues.entry((peer, protocol)).or_default();
                queue.entries.push_back(Idle {
                    conn,
                    returned_at: Instant::now(),
                });
            }
            _ => {
                let mut queues = self.queues.lock();
                if let Some(queue) = queues.get_mut(&(peer, protocol)) {
                    queue.open_count = queue.open_count.saturating_sub(1);
                }
            }
        }
    }

    /// Number of streams (idle + checked out) currently tracked for `(peer, protocol)`.
    pub fn open_count(&self, peer: PeerId, protocol: &StreamProtocol) -> usize {
        self.queues
            .lock()
            .get(&(peer, protocol.clone()))
            .map(|q| q.open_count)
            .unwrap_or(0)
    }
}
