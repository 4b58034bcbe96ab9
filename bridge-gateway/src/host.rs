//! The libp2p host: swarm construction, the dedicated task that drives it (a `Swarm` is `!Sync`
//! and cannot be shared by reference), and the cheaply-cloneable handle the rest of the bridge
//! uses to dial peers, query the DHT, and publish presence records.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bridge_dial::{DialFailure, Dialer};
use bridge_discovery::{DhtProviderSource, DiscoveredPeer, PresenceChannel};
use bridge_task::{ShutdownSignal, Task};
use libp2p::core::multiaddr::Protocol;
use libp2p::swarm::{NetworkBehaviour, SwarmEvent};
use libp2p::{autonat, dcutr, gossipsub, identify, kad, mdns, noise, ping, relay, yamux};
use libp2p::{Multiaddr, PeerId, StreamProtocol, Swarm, SwarmBuilder};
use tokio::sync::{mpsc, oneshot};

use crate::config::ServerConf;

/// Negotiated on every p2p stream that carries HTTP.
pub const BRIDGE_PROTOCOL: StreamProtocol = StreamProtocol::new("/bridge-rpc/1.0.0");
/// Reserved for the web-stream envelope variant used by browser clients (see `ws.rs`).
pub const BRIDGE_ENVELOPE_PROTOCOL: StreamProtocol = StreamProtocol::new("/bridge-rpc-envelope/1.0.0");

const PRESENCE_TOPIC: &str = "bridge-gateway/presence/1.0.0";
const DISCOVERY_KEY: &[u8] = b"bridge-gateway/discovery-tag";
const IDENTIFY_PROTOCOL_VERSION: &str = "bridge-gateway/1.0.0";

#[derive(NetworkBehaviour)]
pub struct BridgeBehaviour {
    stream: libp2p_stream::Behaviour,
    identify: identify::Behaviour,
    ping: ping::Behaviour,
    kad: kad::Behaviour<kad::store::MemoryStore>,
    mdns: mdns::tokio::Behaviour,
    gossipsub: gossipsub::Behaviour,
    relay: relay::Behaviour,
    dcutr: dcutr::Behaviour,
    autonat: autonat::Behaviour,
}

fn build_swarm(conf: &ServerConf) -> anyhow::Result<Swarm<BridgeBehaviour>> {
    let mut swarm = SwarmBuilder::with_new_identity()
        .with_tokio()
        .with_tcp(libp2p::tcp::Config::default(), noise::Config::new, yamux::Config::default)?
        .with_quic()
        .with_dns()?
        .with_behaviour(|key| {
            let peer_id = PeerId::from(key.public());

            let kad_store = kad::store::MemoryStore::new(peer_id);
            let mut kad_config = kad::Config::default();
            for hook in &conf.dht_options {
                hook(&mut kad_config);
            }
            let kad = kad::Behaviour::with_config(peer_id, kad_store, kad_config);

            let mut gossipsub_builder = gossipsub::ConfigBuilder::default();
            for hook in &conf.gossipsub_options {
                gossipsub_builder = hook(gossipsub_builder);
            }
            let gossipsub_config = gossipsub_builder
                .build()
                .map_err(|error| anyhow::anyhow!("gossipsub config: {error}"))?;
            let gossipsub = gossipsub::Behaviour::new(gossipsub::MessageAuthenticity::Signed(key.clone()), gossipsub_config)
                .map_err(|error| anyhow::anyhow!("gossipsub behaviour: {error}"))?;

            Ok(BridgeBehaviour {
                stream: libp2p_stream::Behaviour::new(),
                identify: identify::Behaviour::new(identify::Config::new(IDENTIFY_PROTOCOL_VERSION.to_owned(), key.public())),
                ping: ping::Behaviour::default(),
                kad,
                mdns: mdns::tokio::Behaviour::new(mdns::Config::default(), peer_id)?,
                gossipsub,
                relay: relay::Behaviour::new(peer_id, relay::Config::default()),
                dcutr: dcutr::Behaviour::new(peer_id),
                autonat: autonat::Behaviour::new(peer_id, autonat::Config::default()),
            })
        })
        .map_err(|error| anyhow::anyhow!("failed to assemble libp2p behaviour: {error}"))?
        .with_swarm_config(|swarm_config| {
            let swarm_config = swarm_config.with_idle_connection_timeout(Duration::from_secs(60));
            conf.libp2p_options.iter().fold(swarm_config, |cfg, hook| hook(cfg))
        })
        .build();

    swarm.behaviour_mut().kad.set_mode(Some(kad::Mode::Server));

    Ok(swarm)
}

/// A request sent to the swarm-driving task. Every variant carries its own response channel so
/// the caller can await the outcome without the actor needing to track pending callers itself.
enum HostCommand {
    Dial {
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        respond: oneshot::Sender<Result<(), DialFailure>>,
    },
    StartProviding {
        respond: oneshot::Sender<()>,
    },
    GetProviders {
        respond: oneshot::Sender<Vec<DiscoveredPeer>>,
    },
    HasGossipsubSubscribers {
        respond: oneshot::Sender<bool>,
    },
    IsConnected {
        peer: PeerId,
        respond: oneshot::Sender<bool>,
    },
    PublishPresence {
        respond: oneshot::Sender<()>,
    },
}

/// Cheaply-cloneable handle to the running host. Implements the trait seams `bridge-dial` and
/// `bridge-discovery` use, so neither crate needs to know libp2p's `Swarm` exists.
#[derive(Clone)]
pub struct HostHandle {
    local_peer_id: PeerId,
    commands: mpsc::Sender<HostCommand>,
    control: libp2p_stream::Control,
    mdns_events: std::sync::Arc<parking_lot::Mutex<Option<mpsc::UnboundedReceiver<DiscoveredPeer>>>>,
    announcements: std::sync::Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<DiscoveredPeer>>>,
    listen_addrs: std::sync::Arc<parking_lot::RwLock<Vec<Multiaddr>>>,
}

impl HostHandle {
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    pub fn stream_control(&self) -> libp2p_stream::Control {
        self.control.clone()
    }

    /// Current listen addresses, each with a `/p2p/<peerId>` component appended — ready to hand
    /// to a remote peer (e.g. the `/p2pinfo` endpoint).
    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.listen_addrs
            .read()
            .iter()
            .map(|addr| addr.clone().with(Protocol::P2p(self.local_peer_id)))
            .collect()
    }

    /// Takes ownership of the mDNS "peer found" event stream. Returns `None` if already taken;
    /// intended for a one-time handoff to a [`bridge_discovery::MdnsDiscoveryTask`].
    pub fn take_mdns_events(&self) -> Option<mpsc::UnboundedReceiver<DiscoveredPeer>> {
        self.mdns_events.lock().take()
    }
}

#[async_trait]
impl Dialer for HostHandle {
    async fn dial(&self, peer: PeerId, addrs: &[Multiaddr]) -> Result<(), DialFailure> {
        let (respond, result) = oneshot::channel();
        self.commands
            .send(HostCommand::Dial {
                peer,
                addrs: addrs.to_vec(),
                respond,
            })
            .await
            .map_err(|_| DialFailure("host actor has shut down".to_owned()))?;

        result.await.map_err(|_| DialFailure("host actor dropped the dial response".to_owned()))?
    }

    async fn is_connected(&self, peer: PeerId) -> bool {
        let (respond, result) = oneshot::channel();
        if self.commands.send(HostCommand::IsConnected { peer, respond }).await.is_err() {
            return false;
        }
        result.await.unwrap_or(false)
    }
}

#[async_trait]
impl DhtProviderSource for HostHandle {
    async fn advertise(&self) {
        let (respond, result) = oneshot::channel();
        if self.commands.send(HostCommand::StartProviding { respond }).await.is_ok() {
            let _ = result.await;
        }
    }

    async fn query_providers(&self) -> Vec<DiscoveredPeer> {
        let (respond, result) = oneshot::channel();
        if self.commands.send(HostCommand::GetProviders { respond }).await.is_err() {
            return Vec::new();
        }
        // The DHT query may never progress (no known peers yet); don't let a single discovery
        // tick block every subsequent tick forever.
        tokio::time::timeout(Duration::from_secs(20), result).await.ok().and_then(Result::ok).unwrap_or_default()
    }
}

#[async_trait]
impl PresenceChannel for HostHandle {
    async fn has_subscribers(&self) -> bool {
        let (respond, result) = oneshot::channel();
        if self.commands.send(HostCommand::HasGossipsubSubscribers { respond }).await.is_err() {
            return false;
        }
        result.await.unwrap_or(false)
    }

    async fn publish_self_record(&self) {
        let (respond, result) = oneshot::channel();
        if self.commands.send(HostCommand::PublishPresence { respond }).await.is_ok() {
            let _ = result.await;
        }
    }

    async fn recv_announcement(&self) -> Option<DiscoveredPeer> {
        let mut guard = self.announcements.lock().await;
        guard.recv().await
    }
}

/// Drives the `Swarm`, translating its events into the channels `HostHandle` exposes.
struct HostActor {
    swarm: Swarm<BridgeBehaviour>,
    commands: mpsc::Receiver<HostCommand>,
    mdns_tx: mpsc::UnboundedSender<DiscoveredPeer>,
    announce_tx: mpsc::UnboundedSender<DiscoveredPeer>,
    pending_dials: BTreeMap<PeerId, Vec<oneshot::Sender<Result<(), DialFailure>>>>,
    pending_providers: Vec<oneshot::Sender<Vec<DiscoveredPeer>>>,
    discovery_key: kad::RecordKey,
    presence_topic: gossipsub::IdentTopic,
    listen_addrs: std::sync::Arc<parking_lot::RwLock<Vec<Multiaddr>>>,
}

impl HostActor {
    fn handle_command(&mut self, command: HostCommand) {
        match command {
            HostCommand::Dial { peer, addrs, respond } => {
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
            HostCommand::StartProviding { respond } => {
                let _ = self.swarm.behaviour_mut().kad.start_providing(self.discovery_key.clone());
                let _ = respond.send(());
            }
            HostCommand::GetProviders { respond } => {
                self.swarm.behaviour_mut().kad.get_providers(self.discovery_key.clone());
                self.pending_providers.push(respond);
            }
            HostCommand::HasGossipsubSubscribers { respond } => {
                let has_subscribers = self
                    .swarm
                    .behaviour()
                    .gossipsub
                    .mesh_peers(&self.presence_topic.hash())
                    .next()
                    .is_some();
                let _ = respond.send(has_subscribers);
            }
            HostCommand::IsConnected { peer, respond } => {
                let _ = respond.send(self.swarm.is_connected(&peer));
            }
            HostCommand::PublishPresence { respond } => {
                let record = presence_record(*self.swarm.local_peer_id(), self.swarm.listeners().cloned().collect());
                let _ = self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .publish(self.presence_topic.clone(), record);
                let _ = respond.send(());
            }
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<BridgeBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                self.listen_addrs.write().push(address);
            }
            SwarmEvent::ExpiredListenAddr { address, .. } => {
                self.listen_addrs.write().retain(|existing| *existing != address);
            }
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
            SwarmEvent::Behaviour(BridgeBehaviourEvent::Mdns(mdns::Event::Discovered(found))) => {
                for (peer, addr) in found {
                    let _ = self.mdns_tx.send(DiscoveredPeer { peer, addrs: vec![addr] });
                }
            }
            SwarmEvent::Behaviour(BridgeBehaviourEvent::Kad(kad::Event::OutboundQueryProgressed {
                result: kad::QueryResult::GetProviders(Ok(kad::GetProvidersOk::FoundProviders { providers, .. })),
                ..
            })) => {
                let found: Vec<DiscoveredPeer> = providers
                    .into_iter()
                    .filter(|peer| *peer != *self.swarm.local_peer_id())
                    .map(|peer| DiscoveredPeer { peer, addrs: vec![] })
                    .collect();
                for respond in self.pending_providers.drain(..) {
                    let _ = respond.send(found.clone());
                }
            }
            SwarmEvent::Behaviour(BridgeBehaviourEvent::Kad(kad::Event::OutboundQueryProgressed {
                result: kad::QueryResult::GetProviders(Err(_)),
                ..
            })) => {
                for respond in self.pending_providers.drain(..) {
                    let _ = respond.send(Vec::new());
                }
            }
            SwarmEvent::Behaviour(BridgeBehaviourEvent::Gossipsub(gossipsub::Event::Message { message, .. })) => {
                if message.topic == self.presence_topic.hash() {
                    if let Some(found) = parse_presence_record(&message.data) {
                        let _ = self.announce_tx.send(found);
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
                    tracing::debug!("host actor shutting down");
                    break;
                }
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        tracing::debug!("host command channel closed");
                        break;
                    };
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
impl Task for HostActor {
    type Output = ();

    const NAME: &'static str = "libp2p-host";

    async fn run(self, shutdown_signal: ShutdownSignal) -> Self::Output {
        self.run(shutdown_signal).await
    }
}

fn push_length_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
}

/// Every field is length-prefixed so decoding never has to guess a peer id's byte length.
fn presence_record(peer: PeerId, addrs: Vec<Multiaddr>) -> Vec<u8> {
    let mut encoded = Vec::new();
    push_length_prefixed(&mut encoded, &peer.to_bytes());
    for addr in addrs {
        push_length_prefixed(&mut encoded, &addr.to_vec());
    }
    encoded
}

fn take_length_prefixed<'a>(rest: &mut &'a [u8]) -> Option<&'a [u8]> {
    if rest.len() < 4 {
        return None;
    }
    let len = u32::from_be_bytes(rest[..4].try_into().ok()?) as usize;
    let (head, tail) = rest.get(4..)?.split_at_checked(len)?;
    *rest = tail;
    Some(head)
}

fn parse_presence_record(data: &[u8]) -> Option<DiscoveredPeer> {
    let mut rest = data;
    let peer = PeerId::from_bytes(take_length_prefixed(&mut rest)?).ok()?;

    let mut addrs = Vec::new();
    while let Some(addr_bytes) = take_length_prefixed(&mut rest) {
        if let Ok(addr) = Multiaddr::try_from(addr_bytes.to_vec()) {
            addrs.push(addr);
        }
    }

    Some(DiscoveredPeer { peer, addrs })
}

/// Returns `true` iff `addr` routes through a relay (contains a `/p2p-circuit` component).
pub fn is_relay_address(addr: &Multiaddr) -> bool {
    addr.iter().any(|protocol| matches!(protocol, Protocol::P2pCircuit))
}

/// Builds the swarm, spawns its driving task, and returns a handle plus the task itself (the
/// caller registers the task with the rest of the server's `ShutdownHandle`-tied task set).
pub fn spawn_host(conf: &ServerConf) -> anyhow::Result<(HostHandle, impl Task<Output = ()>)> {
    let mut swarm = build_swarm(conf)?;
    let local_peer_id = *swarm.local_peer_id();

    let discovery_key = kad::RecordKey::new(&DISCOVERY_KEY);
    let presence_topic = gossipsub::IdentTopic::new(PRESENCE_TOPIC);
    swarm.behaviour_mut().gossipsub.subscribe(&presence_topic)?;

    let (command_tx, command_rx) = mpsc::channel(256);
    let (mdns_tx, mdns_rx) = mpsc::unbounded_channel();
    let (announce_tx, announce_rx) = mpsc::unbounded_channel();
    let listen_addrs = std::sync::Arc::new(parking_lot::RwLock::new(Vec::new()));

    let handle = HostHandle {
        local_peer_id,
        commands: command_tx,
        control: swarm.behaviour().stream.new_control(),
        mdns_events: std::sync::Arc::new(parking_lot::Mutex::new(Some(mdns_rx))),
        announcements: std::sync::Arc::new(tokio::sync::Mutex::new(announce_rx)),
        listen_addrs: std::sync::Arc::clone(&listen_addrs),
    };

    let actor = HostActor {
        swarm,
        commands: command_rx,
        mdns_tx,
        announce_tx,
        pending_dials: BTreeMap::new(),
        pending_providers: Vec::new(),
        discovery_key,
        presence_topic,
        listen_addrs,
    };

    Ok((handle, actor))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_address_is_detected_by_p2p_circuit_component() {
        let relay: Multiaddr = "/ip4/1.2.3.4/tcp/4001/p2p/12D3KooWAhUNbiqGKqnUfJDVmB3eMKgKJYTr45YXGCryQ8jUBqZm/p2p-circuit"
            .parse()
            .unwrap();
        let direct: Multiaddr = "/ip4/1.2.3.4/tcp/4001".parse().unwrap();

        assert!(is_relay_address(&relay));
        assert!(!is_relay_address(&direct));
    }

    #[test]
    fn presence_record_round_trips_peer_and_addrs() {
        let peer = PeerId::random();
        let addrs = vec!["/ip4/127.0.0.1/tcp/4001".parse().unwrap(), "/ip4/10.0.0.1/tcp/4002".parse().unwrap()];

        let encoded = presence_record(peer, addrs.clone());
        let decoded = parse_presence_record(&encoded).unwrap();

        assert_eq!(decoded.peer, peer);
        assert_eq!(decoded.addrs, addrs);
    }
}
