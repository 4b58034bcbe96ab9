//! Server and client configuration.

use std::sync::Arc;
use std::time::Duration;

use libp2p::gossipsub;
use libp2p::kad;
use libp2p::swarm;
use parking_lot::RwLock;
use tokio::sync::Notify;
use typed_builder::TypedBuilder;

/// Sentinel for [`ServerConf::http_port`]: disables the HTTP listener entirely.
pub const HTTP_PORT_DISABLED: i32 = -1;
/// Sentinel for [`ServerConf::http_port`]: binds an OS-assigned ephemeral port.
pub const HTTP_PORT_EPHEMERAL: i32 = 0;

const DEFAULT_LOG_DIRECTIVE: &str = "info";
const DEFAULT_DETACH_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// A customization hook applied to the `Swarm`'s configuration before it's built.
pub type SwarmConfigHook = Arc<dyn Fn(swarm::Config) -> swarm::Config + Send + Sync>;

/// A customization hook applied to the Kademlia DHT's configuration before it's built.
pub type DhtConfigHook = Arc<dyn Fn(&mut kad::Config) + Send + Sync>;

/// A customization hook applied to the gossipsub presence topic's configuration.
pub type GossipsubConfigHook = Arc<dyn Fn(gossipsub::ConfigBuilder) -> gossipsub::ConfigBuilder + Send + Sync>;

#[derive(Debug, Clone)]
pub struct CorsConf {
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub exposed_headers: Vec<String>,
}

impl Default for CorsConf {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_owned()],
            allowed_methods: vec!["GET".to_owned(), "POST".to_owned(), "OPTIONS".to_owned()],
            allowed_headers: vec![
                "Content-Type".to_owned(),
                "Accept".to_owned(),
                "Authorization".to_owned(),
                "Connect-Accept-Encoding".to_owned(),
                "Connect-Content-Encoding".to_owned(),
                "Connect-Protocol-Version".to_owned(),
                "Connect-Timeout-Ms".to_owned(),
            ],
            exposed_headers: vec!["Content-Type".to_owned(), "Connect-Content-Encoding".to_owned()],
        }
    }
}

/// Configuration for the server side of the bridge: hosts the libp2p node and the HTTP listener.
#[derive(Clone, TypedBuilder)]
pub struct ServerConf {
    /// -1 disables the HTTP listener, 0 binds an ephemeral port, 1..=65535 binds a fixed one.
    #[builder(default = HTTP_PORT_EPHEMERAL)]
    pub http_port: i32,

    #[builder(default = "0.0.0.0".to_owned())]
    pub http_host: String,

    #[builder(default = DEFAULT_LOG_DIRECTIVE.to_owned())]
    pub log_directive: String,

    /// Opaque customization hooks applied while building the libp2p `Swarm`.
    #[builder(default)]
    pub libp2p_options: Vec<SwarmConfigHook>,

    /// Opaque customization hooks applied while building the Kademlia DHT behaviour.
    #[builder(default)]
    pub dht_options: Vec<DhtConfigHook>,

    #[builder(default)]
    pub gossipsub_options: Vec<GossipsubConfigHook>,

    /// When `true`, binding the HTTP port forcibly closes whatever else is already listening on it.
    #[builder(default = false)]
    pub force_close_existing_port: bool,

    #[builder(default)]
    pub cors: CorsConf,

    /// When `true`, the server process detaches from its parent once `/p2pinfo` answers 200 OK
    /// (or `detach_ready_timeout` elapses, whichever comes first).
    #[builder(default = false)]
    pub is_detach_server: bool,

    #[builder(default = DEFAULT_DETACH_READY_TIMEOUT)]
    pub detach_ready_timeout: Duration,
}

impl core::fmt::Debug for ServerConf {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ServerConf")
            .field("http_port", &self.http_port)
            .field("http_host", &self.http_host)
            .field("log_directive", &self.log_directive)
            .field("force_close_existing_port", &self.force_close_existing_port)
            .field("cors", &self.cors)
            .field("is_detach_server", &self.is_detach_server)
            .field("detach_ready_timeout", &self.detach_ready_timeout)
            .finish_non_exhaustive()
    }
}

/// Configuration for the client side of the bridge: dials a server's p2p node on demand.
#[derive(Debug, Clone, TypedBuilder)]
pub struct ClientConf {
    #[builder(default = DEFAULT_LOG_DIRECTIVE.to_owned())]
    pub log_directive: String,

    /// Per-dial timeout used when connecting to the target peer.
    #[builder(default = Duration::from_secs(15))]
    pub connect_timeout: Duration,
}

/// Source of truth for the server's live configuration, shared across every component.
///
/// Mirrors the reference crate's `ConfHandle`: readers clone the `Arc<ServerConf>` out and never
/// hold a lock across `await`, writers replace the whole snapshot atomically.
#[derive(Clone)]
pub struct ConfHandle {
    inner: Arc<ConfHandleInner>,
}

struct ConfHandleInner {
    conf: RwLock<Arc<ServerConf>>,
    changed: Notify,
}

impl ConfHandle {
    pub fn new(conf: ServerConf) -> Self {
        Self {
            inner: Arc::new(ConfHandleInner {
                conf: RwLock::new(Arc::new(conf)),
                changed: Notify::new(),
            }),
        }
    }

    pub fn get_conf(&self) -> Arc<ServerConf> {
        self.inner.conf.read().clone()
    }

    pub fn replace(&self, conf: ServerConf) {
        *self.inner.conf.write() = Arc::new(conf);
        self.inner.changed.notify_waiters();
    }

    pub async fn change_notified(&self) {
        self.inner.changed.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_server_conf_has_ephemeral_http_port() {
        let conf = ServerConf::builder().build();
        assert_eq!(conf.http_port, HTTP_PORT_EPHEMERAL);
        assert_eq!(conf.cors.allowed_methods, vec!["GET", "POST", "OPTIONS"]);
    }

    #[test]
    fn conf_handle_reflects_replacement() {
        let handle = ConfHandle::new(ServerConf::builder().http_port(7171).build());
        assert_eq!(handle.get_conf().http_port, 7171);

        handle.replace(ServerConf::builder().http_port(8181).build());
        assert_eq!(handle.get_conf().http_port, 8181);
    }
}
