//! Bidirectional RPC transport bridge between HTTP and libp2p.
//!
//! A node built on this crate is, simultaneously: an HTTP-facing client able to forward requests
//! addressed to a remote peer (the `"/@"` gateway path, see [`forwarder`]), and a p2p-facing
//! server exposing its own application to whichever peer dials it (see [`listener::P2pListener`]).

pub mod client;
pub mod config;
pub mod forwarder;
pub mod host;
pub mod http;
pub mod listener;
pub mod p2pinfo;
pub mod service;
pub mod ws;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::Response;
use axum::Router;
use bridge_dial::PeerCache;
use bridge_path::AddressCache;
use bridge_pool::StreamPool;
use tower_http::cors::CorsLayer;

use crate::config::ConfHandle;
use crate::host::HostHandle;

/// Everything an inbound request handler (whether served over plain TCP or a p2p stream) needs.
#[derive(Clone)]
pub struct GatewayState {
    pub conf: ConfHandle,
    pub host: HostHandle,
    pub pool: Arc<StreamPool>,
    pub addr_cache: Arc<AddressCache>,
    /// Shared with the discovery loops (C10), so rate limits are coordinated across every source
    /// of candidate peers, not just forwarder-driven dials.
    pub peer_cache: Arc<PeerCache>,
    /// The HTTP listener's bound port, once known. Zero until `HttpListener::bind` resolves
    /// (relevant when `http_port` was configured as the ephemeral sentinel).
    http_port: Arc<AtomicU16>,
    /// The embedding application's own router, merged alongside the gateway's built-in routes by
    /// both listeners (see [`build_router`]). Empty for a bridge node with no application of its
    /// own (a pure forwarder).
    app: Router<GatewayState>,
}

impl GatewayState {
    pub fn new(conf: ConfHandle, host: HostHandle, peer_cache: Arc<PeerCache>) -> Self {
        let pool = Arc::new(StreamPool::new(host.stream_control()));
        Self {
            conf,
            host,
            pool,
            addr_cache: Arc::new(AddressCache::default()),
            peer_cache,
            http_port: Arc::new(AtomicU16::new(0)),
            app: Router::new(),
        }
    }

    /// Attaches the embedding application's router. Must be called before the listeners start
    /// accepting connections, since each connection builds its router from this snapshot.
    pub fn with_app(mut self, app: Router<GatewayState>) -> Self {
        self.app = app;
        self
    }

    pub fn set_http_port(&self, port: u16) {
        self.http_port.store(port, Ordering::Relaxed);
    }

    pub fn http_port(&self) -> u16 {
        self.http_port.load(Ordering::Relaxed)
    }
}

/// Builds the HTTP router shared by the plain TCP listener and the p2p listener: the gateway
/// forwarder on `"/@"`, `/p2pinfo`, and whatever application router was attached via
/// [`GatewayState::with_app`].
pub fn build_router(state: GatewayState) -> Router {
    let app = state.app.clone();
    build_router_with_app(state, app)
}

/// Builds the HTTP router for a user application's own RPC mux, alongside the gateway's built-in
/// routes (the gateway forwarder on `"/@"`, and `/p2pinfo`).
pub fn build_router_with_app(state: GatewayState, app: Router<GatewayState>) -> Router {
    let cors = cors_layer(&state.conf.get_conf().cors);

    Router::new()
        .route("/p2pinfo", axum::routing::get(p2pinfo::p2pinfo))
        .route("/@{*rest}", axum::routing::any(forwarder::forward))
        .route("/ws", axum::routing::get(ws_upgrade))
        .merge(app)
        .layer(cors)
        .with_state(state)
}

/// Upgrades a browser WebSocket connection into the web-stream envelope variant (see [`ws`]),
/// then serves the same application router over the reassembled byte stream.
async fn ws_upgrade(State(state): State<GatewayState>, ConnectInfo(peer_addr): ConnectInfo<SocketAddr>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| async move {
        let io = ws::websocket_compat(socket);
        if let Err(error) = listener::handle_http_peer(io, state, peer_addr).await {
            tracing::error!(%error, "websocket bridge connection failed");
        }
    })
}

fn cors_layer(cors: &config::CorsConf) -> CorsLayer {
    use axum::http::{HeaderName, Method};

    let origins: Vec<&str> = cors.allowed_origins.iter().map(String::as_str).collect();
    let methods: Vec<Method> = cors.allowed_methods.iter().filter_map(|method| method.parse().ok()).collect();
    let headers: Vec<HeaderName> = cors.allowed_headers.iter().filter_map(|header| header.parse().ok()).collect();
    let exposed: Vec<HeaderName> = cors.exposed_headers.iter().filter_map(|header| header.parse().ok()).collect();

    let layer = if origins.iter().any(|origin| *origin == "*") {
        CorsLayer::new().allow_origin(tower_http::cors::Any)
    } else {
        let parsed: Vec<_> = origins.iter().filter_map(|origin| origin.parse().ok()).collect();
        CorsLayer::new().allow_origin(parsed)
    };

    layer.allow_methods(methods).allow_headers(headers).expose_headers(exposed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CorsConf;

    #[test]
    fn wildcard_origin_does_not_enumerate_allowed_origins() {
        let conf = CorsConf {
            allowed_origins: vec!["*".to_owned()],
            ..CorsConf::default()
        };

        // Builds without panicking: a wildcard origin takes the `tower_http::cors::Any` branch
        // rather than trying (and failing) to parse "*" as a `HeaderValue`.
        let _layer = cors_layer(&conf);
    }

    #[test]
    fn enumerated_origins_skip_ones_that_fail_to_parse() {
        let conf = CorsConf {
            allowed_origins: vec!["https://example.test".to_owned(), "not a valid origin".to_owned()],
            ..CorsConf::default()
        };

        let _layer = cors_layer(&conf);
    }
}
