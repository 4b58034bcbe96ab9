//! Client assembly (C9): turns a target address — either an `http(s)://` URL or a multiaddress
//! carrying a peer identity — into a byte-oriented HTTP/2 transport a caller's own RPC factory
//! can build a typed client on top of.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use bridge_dial::{race_dial, DialFailure, Dialer, PeerCache};
use bridge_pool::StreamPool;
use bridge_task::{ChildTask, ShutdownHandle, ShutdownSignal, Task};
use hyper_util::rt::{TokioExecutor, TokioIo};
use libp2p::core::multiaddr::Protocol;
use libp2p::swarm::{NetworkBehaviour, SwarmEvent};
use libp2p::{dcutr, identify, kad, noise, ping, relay, yamux};
use libp2p::{Multiaddr, PeerId, Swarm, SwarmBuilder};
use tokio::sync::{mpsc, oneshot};
use url::Url;

use crate::config::ClientConf;
use crate::host::BRIDGE_PROTOCOL;

const IDENTIFY_PROTOCOL_VERSION: &str = "bridge-gateway/1.0.0";

/// Where a client's requests ultimately go, as determined by [`parse_target`].
#[derive(Debug, Clone)]
pub enum Target {
    Http(Url),
    P2p { peer: PeerId, addrs: Vec<Multiaddr> },
}

/// The transport handed to the caller's RPC client factory.
pub enum BridgeTransport {
    /// Plain HTTP/2 over TCP; no libp2p host was created.
    Http { base_url: Url },
    /// HTTP/2 over a libp2p stream, already handshaken.
    P2p {
        base_url: String,
        send_request: hyper::client::conn::http2::SendRequest<axum::body::Body>,
    },
}

/// Parses a target the same way the gateway path codec recognizes peer addresses: a bare
/// multiaddress carrying a `/p2p/<peerId>` component, or else a plain URL.
pub fn parse_target(target: &str) -> anyhow::Result<Target> {
    if let Ok(addr) = Multiaddr::from_str(target) {
        let peer = addr
            .iter()
            .find_map(|protocol| match protocol {
                Protocol::P2p(peer) => Some(peer),
                _ => None,
            })
            .context("multiaddress target is missing a /p2p/<peerId> component")?;
        return Ok(Target::P2p { peer, addrs: vec![addr] });
    }

    let url = Url::parse(target).context("target is neither a multiaddress nor a valid URL")?;
    Ok(Target::Http(url))
}

/// Tears down the minimal client-mode host (if one was created) when the client is done.
pub struct ClientHandle {
    shutdown: Option<ShutdownHandle>,
    task: Option<ChildTask<()>>,
}

impl ClientHandle {
    pub async fn close(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            shutdown.signal();
            let _ = tokio::time::timeout(Duration::from_secs(5), shutdown.all_closed()).await;
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Resolves `target`, builds the appropriate transport, and hands it to `factory`. For an HTTP
/// target, no libp2p host is created at all; for a p2p target, a minimal client-mode host is
/// spun up just long enough to dial the peer and open the bridge protocol stream.
pub async fn connect<T>(target: &str, conf: &ClientConf, factory: impl FnOnce(BridgeTransport) -> T) -> anyhow::Result<(T, ClientHandle)> {
    match parse_target(target)? {
        Target::Http(url) => {
            let transport = BridgeTransport::Http { base_url: url };
            Ok((
                factory(transport),
                ClientHandle {
                    shutdown: None,
                    task: None,
                },
            ))
        }
        Target::P2p { peer, addrs } => {
            let (handle, actor) = spawn_client_host(conf).context("failed to build client-mode libp2p host")?;
            let (shutdown, shutdown_signal) = ShutdownHandle::new();
            let task = ChildTask::spawn(actor.run(shutdown_signal));

            let peer_cache = PeerCache::default();
            let mut candidates = BTreeMap::new();
            candidates.insert(peer, addrs);
            race_dial(&handle, &peer_cache, &candidates, conf.connect_timeout)
                .await
                .context("failed to dial target peer")?;

            let pool = Arc::new(StreamPool::new(handle.stream_control()));
            let conn = pool
                .get_stream(peer, BRIDGE_PROTOCOL)
                .await
                .context("failed to open bridge protocol stream")?;

            let (send_request, connection) = hyper::client::conn::http2::Builder::new(TokioExecutor::new())
                .handshake(TokioIo::new(conn))
                .await
                .context("HTTP/2 handshake over p2p stream failed")?;

            tokio::spawn(async move {
                if let Err(error) = connection.await {
                    tracing::debug!(%error, %peer, "p2p HTTP/2 client connection closed");
                }
            });

            let transport = BridgeTransport::P2p {
                base_url: format!("http://{peer}"),
                send_request,
            };

            Ok((
                factory(transport),
                ClientHandle {
                    shutdown: Some(shutdown),
                    task: Some(task),
                },
            ))
        }
    }
}

#[derive(NetworkBehaviour)]
struct ClientBehaviour {
    stream: libp2p_stream::Behaviour,
    identify: identify::Behaviour,
    ping: ping::Behaviour,
    kad: kad::Behaviour<kad::store::MemoryStore>,
    relay_client: relay::client::Behaviour,
    dcutr: dcutr::Behaviour,
}

fn build_client_swarm(conf: &ClientConf) -> anyhow::Result<Swarm<ClientBehaviour>> {
    let mut swarm = SwarmBuilder::with_new_identity()
        .with_tokio()
        .with_tcp(libp2p::tcp::Config::default(), noise::Config::new, yamux::Config::default)?
        .with_quic()
        .with_dns()?
        .with_relay_client(noise::Config::new, yamux::Config::default)?
        .with_behaviour(|key, relay_client| {
            let peer_id = PeerId::from(key.public());
            let kad_store = kad::store::MemoryStore::new(peer_id);

            Ok(ClientBehaviour {
                stream: libp2p_stream::Behaviour::new(),
                identify: identify::Behaviour::new(identify::Config::new(IDENTIFY_PROTOCOL_VERSION.to_owned(), key.public())),
                ping: ping::Behaviour::default(),
                kad: kad::Behaviour::new(peer_id, kad_store),
                relay_client,
                dcutr: dcutr::Behaviour::new(peer_id),
            })
        })
        .map_err(|error| anyhow::anyhow!("failed to assemble client libp2p behaviour: {error}"))?
        .with_swarm_config(|swarm_config| swarm_config.with_idle_connection_timeout(conf.connect_timeout))
        .build();

    // Client mode: never answer DHT queries on behalf of others, only issue our own.
    swarm.behaviour_mut().kad.set_mode(Some(kad::Mode::Client));

    Ok(swarm)
}

enum ClientCommand {
    Dial {
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        respond: oneshot::Sender<Result<(), DialFailure>>,
    },
    IsConnected {
        peer: PeerId,
        respond: oneshot::Sender<bool>,
    },
}

#[derive(Clone)]
struct ClientHostHandle {
    commands: mpsc::Sender<ClientCommand>,
    control: libp2p_stream::Control,
}

impl ClientHostHandle {
    fn stream_control(&self) -> libp2p_stream::Control {
        self.control.clone()
    }
}

#[async_trait]
impl Dialer for ClientHostHandle {
    async fn dial(&self, peer: PeerId, addrs: &[Multiaddr]) -> Result<(), DialFailure> {
        let (respond, result) = oneshot::channel();
        self.commands
            .send(ClientCommand::Dial {
                peer,
                addrs: addrs.to_vec(),
                respond,
            })
            .await
            .map_err(|_| DialFailure("client host actor has shut down".to_owned()))?;

        result.await.map_err(|_| DialFailure("client host actor dropped the dial response".to_owned()))?
    }

    async fn is_connected(&self, peer: PeerId) -> bool {
        let (respond, result) = oneshot::channel();
        if self.commands.send(ClientCommand::IsConnected { peer, respond }).await.is_err() {
            return false;
        }
        result.await.unwrap_or(false)
    }
}

struct ClientHostActor {
    swarm: Swarm<ClientBehaviour>,
    commands: mpsc::Receiver<ClientCommand>,
    pending_dials: BTreeMap<PeerId, Vec<oneshot::Sender<Result<(), DialFailure>>>>,
}

impl ClientHostActor {
    fn handle_command(&mut self, command: ClientCommand) {
        match command {
            ClientCommand::Dial { peer, addrs, respond } => {
                for addr in &addrs {
                    self.swarm.add_peer_address(peer, addr.clone());
                }
                match self.swarm.dial(peer) {
                    Ok(()) => self.pending_dials.entry(peer).or_default().push(respond),
                    Err(error) => {
                        let _ = respond.send(Err(DialFailure(error.to_string())));
                    }
                }
            }
            ClientCommand::IsConnected { peer, respond } => {
                let _ = respond.send(self.swarm.is_connected(&peer));
            }
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<ClientBehaviourEvent>) {
        match event {
            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                if let Some(waiters) = self.pending_dials.remove(&peer_id) {
                    for waiter in waiters {
                        let _ = waiter.send(Ok(()));
                    }
                }
            }
            SwarmEvent::OutgoingConnectionError { peer_id: Some(peer_id), error, .. } => {
                if let Some(waiters) = self.pending_dials.remove(&peer_id) {
                    let message = error.to_string();
                    for waiter in waiters {
                        let _ = waiter.send(Err(DialFailure(message.clone())));
                    }
                }
            }
            _ => {}
        }
    }

    async fn run(mut self, mut shutdown_signal: ShutdownSignal) {
        use futures::StreamExt as _;

        loop {
            tokio::select! {
                _ = shutdown_signal.wait() => {
                    tracing::debug!("client host actor shutting down");
                    break;
                }
                command = self.commands.recv() => {
                    let Some(command) = command else { break };
                    self.handle_command(command);
                }
                event = self.swarm.select_next_some() => {
                    self.handle_swarm_event(event);
                }
            }
        }
    }
}

#[async_trait]
impl Task for ClientHostActor {
    type Output = ();

    const NAME: &'static str = "libp2p-client-host";

    async fn run(self, shutdown_signal: ShutdownSignal) -> Self::Output {
        self.run(shutdown_signal).await
    }
}

fn spawn_client_host(conf: &ClientConf) -> anyhow::Result<(ClientHostHandle, ClientHostActor)> {
    let swarm = build_client_swarm(conf)?;
    let (command_tx, command_rx) = mpsc::channel(32);

    let handle = ClientHostHandle {
        commands: command_tx,
        control: swarm.behaviour().stream.new_control(),
    };

    let actor = ClientHostActor {
        swarm,
        commands: command_rx,
        pending_dials: BTreeMap::new(),
    };

    Ok((handle, actor))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_http_url_target() {
        let target = parse_target("http://example.test:8080").unwrap();
        assert!(matches!(target, Target::Http(_)));
    }

    #[test]
    fn parses_p2p_multiaddr_target() {
        let addr = "/ip4/1.2.3.4/tcp/4001/p2p/12D3KooWAhUNbiqGKqnUfJDVmB3eMKgKJYTr45YXGCryQ8jUBqZm";
        let target = parse_target(addr).unwrap();
        assert!(matches!(target, Target::P2p { .. }));
    }

    #[test]
    fn rejects_multiaddr_without_peer_id() {
        let err = parse_target("/ip4/1.2.3.4/tcp/4001").unwrap_err();
        assert!(err.to_string().contains("p2p"));
    }
}
