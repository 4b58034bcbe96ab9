//! The gateway forwarder: an `axum` handler mounted on `"/@..."` that relays a request to whatever
//! peer its path names, over a fresh HTTP/2-over-libp2p connection.

use std::collections::BTreeMap;
use std::io;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, header};
use axum::response::{IntoResponse, Response};
use bridge_dial::race_dial;
use bytes::Bytes;
use futures::channel::mpsc;
use futures::{SinkExt as _, StreamExt as _};
use http_body_util::BodyExt as _;
use hyper::client::conn::http2;
use hyper_util::rt::{TokioExecutor, TokioIo};
use libp2p::PeerId;

use crate::GatewayState;
use crate::host::BRIDGE_PROTOCOL;
use crate::http::HttpError;

const DIAL_DEADLINE: Duration = Duration::from_secs(15);

/// Bound on the number of response-body frames buffered between the upstream peer and the
/// caller, so a slow caller applies backpressure to `copy_adaptive` rather than letting an
/// unbounded queue build up in memory.
const RESPONSE_BODY_CHANNEL_CAPACITY: usize = 16;

pub async fn forward(State(state): State<GatewayState>, req: Request) -> Response {
    match forward_inner(state, req).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    }
}

async fn forward_inner(state: GatewayState, req: Request) -> Result<Response, HttpError> {
    let path = req.uri().path().to_owned();

    let gateway_path = match state.addr_cache.get(&path) {
        Some(cached) => cached,
        None => {
            let decoded = bridge_path::decode(&path).map_err(HttpError::bad_request().err())?;
            state.addr_cache.insert(path, decoded.clone());
            decoded
        }
    };

    let mut candidates = BTreeMap::new();
    candidates.insert(gateway_path.peer, gateway_path.addrs.clone());

    // No reachable peer for the target path is surfaced as a server-side failure, not a bad
    // request: the caller's request was well-formed, the bridge simply couldn't reach the peer
    // it names.
    let peer = race_dial(&state.host, &state.peer_cache, &candidates, DIAL_DEADLINE)
        .await
        .map_err(HttpError::internal().err())?;

    // One fresh stream (and H2 connection) per forwarded request: the pool hands out a stream,
    // but once handshaken it's a long-lived multiplexed connection rather than something that
    // goes back into the pool's idle queue, so it's always released with `keep = false` once the
    // connection is done — the release still matters for the pool's `open_count` bookkeeping.
    let conn = match state.pool.get_stream(peer, BRIDGE_PROTOCOL).await {
        Ok(conn) => conn,
        Err(error) => return Err(HttpError::internal().err()(error)),
    };

    let (mut send_request, connection) = match http2::Builder::new(TokioExecutor::new()).handshake(TokioIo::new(conn)).await {
        Ok(pair) => pair,
        Err(error) => {
            state.pool.release(peer, BRIDGE_PROTOCOL, None, false);
            return Err(HttpError::internal().err()(error));
        }
    };

    let pool = state.pool.clone();
    tokio::spawn(async move {
        if let Err(error) = connection.await {
            tracing::debug!(%error, %peer, "p2p HTTP/2 connection closed");
        }
        pool.release(peer, BRIDGE_PROTOCOL, None, false);
    });

    let (mut parts, body) = req.into_parts();

    parts.uri = gateway_path
        .service_path
        .parse()
        .map_err(HttpError::bad_request().err())?;
    parts.headers.remove(header::HOST);
    parts
        .headers
        .entry(header::CONTENT_TYPE)
        .or_insert_with(|| HeaderValue::from_static("application/grpc"));
    parts.headers.entry(header::ACCEPT).or_insert_with(|| HeaderValue::from_static("application/grpc"));

    let outbound_request = axum::http::Request::from_parts(parts, body);

    let response = send_request
        .send_request(outbound_request)
        .await
        .map_err(HttpError::internal().err())?;

    let (parts, incoming) = response.into_parts();
    Ok(Response::from_parts(parts, stream_response_body(incoming, peer)))
}

/// Streams `incoming`'s data frames to the caller through [`bridge_io::copy_adaptive`] instead of
/// handing the body through untouched, so every forwarded response goes through the same
/// adaptive-buffer strategy regardless of which side of the bridge produced it.
fn stream_response_body(incoming: hyper::body::Incoming, peer: PeerId) -> Body {
    let upstream = incoming.into_data_stream().map(|result| result.map_err(io::Error::other));
    let reader = bridge_io::FrameStream::new(upstream);

    let (frame_tx, frame_rx) = mpsc::channel::<io::Result<Bytes>>(RESPONSE_BODY_CHANNEL_CAPACITY);
    let sink = frame_tx.sink_map_err(io::Error::other);
    let writer = bridge_io::FrameStream::new(sink);

    tokio::spawn(async move {
        if let Err(error) = bridge_io::copy_adaptive(reader, writer).await {
            tracing::debug!(%error, %peer, "response body copy ended early");
        }
    });

    Body::from_stream(frame_rx)
}
