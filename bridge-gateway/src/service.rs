//! Brings every component up: the libp2p host, the HTTP and p2p listeners, and the discovery
//! loops that keep the DHT and gossipsub presence topic populated.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use bridge_dial::PeerCache;
use bridge_discovery::{DhtDiscoveryTask, MdnsDiscoveryTask, PresenceTask};
use bridge_task::{spawn_task, ChildTask, ShutdownHandle, ShutdownSignal, Task};

use crate::config::{ConfHandle, HTTP_PORT_DISABLED};
use crate::host::{self, BRIDGE_ENVELOPE_PROTOCOL, BRIDGE_PROTOCOL};
use crate::listener::{HttpListener, P2pListener};
use crate::GatewayState;

#[allow(clippy::large_enum_variant)]
enum RunState {
    Stopped,
    Running {
        shutdown_handle: ShutdownHandle,
        tasks: Vec<ChildTask<anyhow::Result<()>>>,
    },
}

/// Owns the running server: once [`GatewayService::start`] returns, the libp2p host, both
/// listeners, and every discovery loop are live and registered against a shared shutdown signal.
pub struct GatewayService {
    conf: ConfHandle,
    state: RunState,
}

impl GatewayService {
    pub fn new(conf: ConfHandle) -> Self {
        Self {
            conf,
            state: RunState::Stopped,
        }
    }

    pub async fn start(&mut self, app: axum::Router<GatewayState>) -> anyhow::Result<GatewayState> {
        let conf = self.conf.get_conf();

        let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();
        let mut tasks = Tasks::new(shutdown_signal.clone());

        let (host_handle, host_actor) = host::spawn_host(&conf).context("failed to build libp2p host")?;
        tasks.register_unit(host_actor);

        let peer_cache = Arc::new(PeerCache::default());
        let gateway_state =
            GatewayState::new(self.conf.clone(), host_handle.clone(), Arc::clone(&peer_cache)).with_app(app);

        if conf.http_port != HTTP_PORT_DISABLED {
            let addr: SocketAddr = format!("{}:{}", conf.http_host, conf.http_port.max(0))
                .parse()
                .context("invalid http_host/http_port")?;

            let http_listener = HttpListener::bind(addr, gateway_state.clone()).context("failed to bind HTTP listener")?;
            gateway_state.set_http_port(http_listener.addr().port());
            tasks.register(http_listener);
        }

        let mut control = host_handle.stream_control();
        let incoming = control
            .accept(BRIDGE_PROTOCOL)
            .map_err(|error| anyhow::anyhow!("bridge protocol already registered: {error}"))?;
        tasks.register(P2pListener::new(incoming, BRIDGE_PROTOCOL, gateway_state.clone()));

        let envelope_incoming = control
            .accept(BRIDGE_ENVELOPE_PROTOCOL)
            .map_err(|error| anyhow::anyhow!("bridge envelope protocol already registered: {error}"))?;
        tasks.register(P2pListener::new_envelope(envelope_incoming, BRIDGE_ENVELOPE_PROTOCOL, gateway_state.clone()));

        if let Some(mdns_events) = host_handle.take_mdns_events() {
            let task = MdnsDiscoveryTask::new(mdns_events, Arc::new(host_handle.clone()), Arc::clone(&peer_cache));
            tasks.register_unit(task);
        }

        tasks.register_unit(DhtDiscoveryTask::new(
            Arc::new(host_handle.clone()),
            Arc::new(host_handle.clone()),
            Arc::clone(&peer_cache),
        ));

        tasks.register_unit(PresenceTask::new(
            Arc::new(host_handle.clone()),
            Arc::new(host_handle.clone()),
            Arc::clone(&peer_cache),
        ));

        self.state = RunState::Running {
            shutdown_handle,
            tasks: tasks.inner,
        };

        Ok(gateway_state)
    }

    /// Signals every task to shut down and waits (up to 10s) for them to drain before giving up.
    pub async fn stop(&mut self) {
        match std::mem::replace(&mut self.state, RunState::Stopped) {
            RunState::Stopped => {
                tracing::info!("attempted to stop gateway service, but it's already stopped");
            }
            RunState::Running { shutdown_handle, tasks } => {
                tracing::info!("stopping gateway service");
                shutdown_handle.signal();

                tokio::select! {
                    _ = shutdown_handle.all_closed() => {
                        tracing::debug!("all tasks closed gracefully");
                    }
                    _ = tokio::time::sleep(Duration::from_secs(10)) => {
                        tracing::warn!("some tasks didn't terminate in time, forcing shutdown");
                    }
                }

                for task in tasks {
                    task.abort();
                }
            }
        }
    }
}

struct Tasks {
    inner: Vec<ChildTask<anyhow::Result<()>>>,
    shutdown_signal: ShutdownSignal,
}

impl Tasks {
    fn new(shutdown_signal: ShutdownSignal) -> Self {
        Self {
            inner: Vec::new(),
            shutdown_signal,
        }
    }

    /// Registers a task whose output is already `anyhow::Result<()>` (the listeners).
    fn register<T>(&mut self, task: T)
    where
        T: Task<Output = anyhow::Result<()>> + 'static,
    {
        self.inner.push(spawn_task(task, self.shutdown_signal.clone()));
    }

    /// Registers a task whose output is `()` (the host actor and the discovery loops), folding
    /// it into the same `anyhow::Result<()>`-returning join set as [`Tasks::register`].
    fn register_unit<T>(&mut self, task: T)
    where
        T: Task<Output = ()> + 'static,
    {
        let signal = self.shutdown_signal.clone();
        self.inner.push(ChildTask::spawn(async move {
            task.run(signal).await;
            Ok(())
        }));
    }
}
