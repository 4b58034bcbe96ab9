//! The two ways a request reaches this node's HTTP router: a plain TCP listener for local
//! clients, and a libp2p-stream listener (C2) for requests arriving from a remote peer.

use std::net::SocketAddr;

use anyhow::Context as _;
use async_trait::async_trait;
use axum::extract::connect_info::ConnectInfo;
use bridge_task::{ChildTask, ShutdownSignal, Task};
use futures::TryFutureExt as _;
use libp2p::{PeerId, StreamProtocol};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::Instrument as _;

use crate::GatewayState;

const REQUEST_TIMEOUT: tokio::time::Duration = tokio::time::Duration::from_secs(15);

/// Accepts plain TCP connections and serves the gateway's HTTP router on each one.
pub struct HttpListener {
    listener: TcpListener,
    addr: SocketAddr,
    state: GatewayState,
}

impl HttpListener {
    pub fn bind(addr: SocketAddr, state: GatewayState) -> anyhow::Result<Self> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4().context("failed to create IPv4 TCP socket")?
        } else {
            TcpSocket::new_v6().context("failed to create IPv6 TCP socket")?
        };

        socket.set_reuseaddr(true).context("set_reuseaddr")?;
        socket.bind(addr).context("failed to bind TCP socket")?;
        let listener = socket.listen(1024).context("failed to listen on TCP socket")?;
        let bound_addr = listener.local_addr().context("local_addr")?;

        Ok(Self {
            listener,
            addr: bound_addr,
            state,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn run(self) -> anyhow::Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let state = self.state.clone();

                    let fut = tokio::time::timeout(REQUEST_TIMEOUT, async move {
                        if let Err(error) = handle_http_peer(stream, state, peer_addr).await {
                            tracing::error!(%error, "HTTP connection failed");
                        }
                    })
                    .map_err(|_| tracing::warn!("request timed out"))
                    .instrument(tracing::info_span!("http", client = %peer_addr));

                    ChildTask::spawn(fut).detach();
                }
                Err(error) => tracing::error!(%error, "failed to accept TCP connection"),
            }
        }
    }
}

#[async_trait]
impl Task for HttpListener {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "http-listener";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        tokio::select! {
            result = self.run() => result,
            _ = shutdown_signal.wait() => Ok(()),
        }
    }
}

/// Accepts inbound libp2p streams opened against us for the bridge RPC protocol, and serves the
/// same HTTP router on each one — this is how a remote peer reaches our local application.
///
/// Two flavors share this loop: the normal bridge protocol, where the stream already carries raw
/// HTTP/2 bytes, and the envelope protocol (see [`crate::ws`]), where each stream instead carries
/// length-prefixed frames for clients that cannot negotiate HTTP/2 framing directly on a p2p
/// stream and need explicit message boundaries decoded back into a byte stream first.
pub struct P2pListener {
    incoming: libp2p_stream::IncomingStreams,
    protocol: StreamProtocol,
    state: GatewayState,
    envelope: bool,
}

impl P2pListener {
    pub fn new(incoming: libp2p_stream::IncomingStreams, protocol: StreamProtocol, state: GatewayState) -> Self {
        Self {
            incoming,
            protocol,
            state,
            envelope: false,
        }
    }

    /// Like [`Self::new`], but decodes each stream as length-prefixed envelope frames before
    /// handing the reassembled byte stream to the HTTP server.
    pub fn new_envelope(incoming: libp2p_stream::IncomingStreams, protocol: StreamProtocol, state: GatewayState) -> Self {
        Self {
            incoming,
            protocol,
            state,
            envelope: true,
        }
    }

    async fn run(mut self) -> anyhow::Result<()> {
        use futures::StreamExt as _;

        while let Some((peer, stream)) = self.incoming.next().await {
            let conn = bridge_io::Connection::new(stream, peer, None);
            let state = self.state.clone();
            let protocol = self.protocol.clone();
            let envelope = self.envelope;

            ChildTask::spawn(
                async move {
                    let result = if envelope {
                        handle_p2p_envelope_peer(conn, state, peer).await
                    } else {
                        handle_p2p_peer(conn, state, peer).await
                    };
                    if let Err(error) = result {
                        tracing::error!(%error, %peer, %protocol, "p2p stream failed");
                    }
                }
                .instrument(tracing::info_span!("p2p", %peer)),
            )
            .detach();
        }

        Ok(())
    }
}

#[async_trait]
impl Task for P2pListener {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "p2p-listener";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        tokio::select! {
            result = self.run() => result,
            _ = shutdown_signal.wait() => Ok(()),
        }
    }
}

/// Serves the gateway's HTTP router over any already-framed byte stream. Shared by the plain TCP
/// listener, the p2p listener, and the browser WebSocket upgrade route (see [`crate::ws`]).
pub(crate) async fn handle_http_peer<I>(io: I, state: GatewayState, peer_addr: SocketAddr) -> anyhow::Result<()>
where
    I: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let app = crate::build_router(state).layer(axum::Extension(ConnectInfo(peer_addr)));

    hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new())
        .serve_connection_with_upgrades(hyper_util::rt::TokioIo::new(io), hyper_util::service::TowerToHyperService::new(app))
        .await
        .map_err(|error| anyhow::anyhow!("HTTP server: {error}"))
}

async fn handle_p2p_peer(conn: bridge_io::Connection, state: GatewayState, peer: PeerId) -> anyhow::Result<()> {
    // Synthesize a display-only peer address; the real identity is `peer`, not this socket.
    let synthetic_addr: SocketAddr = conn.remote_addr();
    let _ = peer;
    handle_http_peer(conn, state, synthetic_addr).await
}

async fn handle_p2p_envelope_peer(conn: bridge_io::Connection, state: GatewayState, peer: PeerId) -> anyhow::Result<()> {
    let synthetic_addr: SocketAddr = conn.remote_addr();
    let _ = peer;
    let framed = bridge_io::FrameStream::new(bridge_io::EnvelopeFrames::new(conn));
    handle_http_peer(framed, state, synthetic_addr).await
}
