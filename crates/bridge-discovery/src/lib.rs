mod common;
mod dht;
mod mdns;
mod pubsub;

pub use common::DiscoveredPeer;
pub use dht::{DhtDiscoveryTask, DhtProviderSource, DEFAULT_QUERY_INTERVAL};
pub use mdns::MdnsDiscoveryTask;
pub use pubsub::{PresenceChannel, PresenceTask, DEFAULT_BROADCAST_INTERVAL};
