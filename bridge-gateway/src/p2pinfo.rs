//! `GET /p2pinfo`: tells a client how to reach this node over the p2p transport, and what HTTP
//! port it's listening on (used by clients that must poll until the server is actually ready).

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::GatewayState;

#[derive(Serialize)]
pub struct P2pInfo {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Addrs")]
    addrs: Vec<String>,
    #[serde(rename = "Port")]
    port: String,
}

pub async fn p2pinfo(State(state): State<GatewayState>) -> Json<P2pInfo> {
    Json(P2pInfo {
        id: state.host.local_peer_id().to_string(),
        addrs: state.host.listen_addrs().iter().map(ToString::to_string).collect(),
        port: state.http_port().to_string(),
    })
}
