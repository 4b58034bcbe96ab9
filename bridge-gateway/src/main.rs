//! Minimal demo binary: brings up a bridge node exposing a tiny JSON RPC handler, and prints
//! where it can be reached (both the HTTP address and the p2p multiaddress) before waiting for
//! Ctrl-C.

use anyhow::Context as _;
use axum::routing::post;
use axum::{Json, Router};
use bridge_gateway::config::{ConfHandle, ServerConf};
use bridge_gateway::service::GatewayService;
use bridge_gateway::GatewayState;
use serde::{Deserialize, Serialize};

#[derive(Deserialize)]
struct HelloRequest {
    name: String,
}

#[derive(Serialize)]
struct HelloResponse {
    message: String,
}

async fn say_hello(Json(request): Json<HelloRequest>) -> Json<HelloResponse> {
    Json(HelloResponse {
        message: format!("Hello, {}!", request.name),
    })
}

fn demo_app() -> Router<GatewayState> {
    Router::new().route("/greeter.v1.GreeterService/SayHello", post(say_hello))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _guard = bridge_log::init_stdout("info").context("failed to initialize logging")?;

    let conf = ServerConf::builder().build();
    let conf_handle = ConfHandle::new(conf);

    let mut service = GatewayService::new(conf_handle);
    let state = service.start(demo_app()).await.context("failed to start bridge node")?;

    tracing::info!(
        peer_id = %state.host.local_peer_id(),
        http_port = state.http_port(),
        "bridge node is up"
    );
    for addr in state.host.listen_addrs() {
        tracing::info!(%addr, "listening");
    }

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    tracing::info!("shutting down");
    service.stop().await;

    Ok(())
}
