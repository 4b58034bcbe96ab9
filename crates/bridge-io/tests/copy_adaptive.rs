#![expect(clippy::unwrap_used, reason = "Test code can panic on errors")]

use anyhow::Context as _;
use bridge_io::copy_adaptive;
use futures_util::FutureExt as _;
use proptest::prelude::*;
use test_utils::{local_tcp_listener, payload, read_assert_payload, tcp_connect, write_payload};
use tokio::io::AsyncWriteExt as _;

/// Forwards one accepted inbound connection's bytes onto a freshly dialed upstream connection,
/// the same one-directional copy the gateway forwarder performs for a request/response body.
async fn relay(inbound: tokio::net::TcpStream, upstream_port: u16) -> anyhow::Result<()> {
    let mut outbound = tcp_connect(upstream_port).await.context("connect outbound")?;
    let (mut inbound_r, _inbound_w) = inbound.into_split();
    copy_adaptive(&mut inbound_r, &mut outbound).await.context("copy")?;
    outbound.shutdown().await.context("shutdown outbound")?;
    Ok(())
}

#[test]
fn relays_arbitrary_payload_end_to_end() {
    let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();

    proptest!(ProptestConfig::with_cases(10), |(payload in payload().no_shrink())| {
        rt.block_on(async {
            let (listener, listen_port) = local_tcp_listener().await.unwrap();
            let (upstream_listener, upstream_port) = local_tcp_listener().await.unwrap();

            let client_fut = async {
                let mut stream = tcp_connect(listen_port).await.context("client connect")?;
                write_payload(&mut stream, &payload.0).await.context("client write")?;
                stream.shutdown().await.context("client shutdown")?;
                anyhow::Ok(())
            };

            let relay_fut = async {
                let (inbound, _) = listener.accept().await.context("relay accept")?;
                relay(inbound, upstream_port).await.context("relay")?;
                anyhow::Ok(())
            };

            let upstream_fut = async {
                let (mut stream, _) = upstream_listener.accept().await.context("upstream accept")?;
                read_assert_payload(&mut stream, &payload.0).await.context("upstream read")?;
                anyhow::Ok(())
            };

            tokio::try_join!(
                client_fut.map(|r| r.context("client")),
                relay_fut.map(|r| r.context("relay")),
                upstream_fut.map(|r| r.context("upstream")),
            )
            .unwrap();
        });
    });
}
