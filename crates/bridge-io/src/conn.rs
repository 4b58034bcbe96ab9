//! Wraps a libp2p stream as a byte-oriented connection with socket-like address semantics.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use libp2p::{Multiaddr, PeerId};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Best-effort fallback used whenever a multiaddress cannot be converted into a [`SocketAddr`]
/// (relay hops, QUIC-only addresses, in-memory transports…). Display-only: nothing depends on its
/// correctness, only on `Connection` forwarding bytes correctly.
fn loopback_fallback() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
}

fn multiaddr_to_socket_addr(addr: &Multiaddr) -> Option<SocketAddr> {
    use libp2p::core::multiaddr::Protocol;

    let mut ip = None;
    let mut port = None;

    for protocol in addr.iter() {
        match protocol {
            Protocol::Ip4(v) => ip = Some(IpAddr::V4(v)),
            Protocol::Ip6(v) => ip = Some(IpAddr::V6(v)),
            Protocol::Tcp(p) | Protocol::Udp(p) => port = Some(p),
            _ => {}
        }
    }

    match (ip, port) {
        (Some(ip), Some(port)) => Some(SocketAddr::new(ip, port)),
        _ => None,
    }
}

/// A single libp2p stream, wrapped so that a generic HTTP/2 server or client transport can treat
/// it like any other byte-oriented connection.
///
/// Owns the underlying stream exclusively: dropping or closing the connection closes the stream.
pub struct Connection {
    stream: libp2p::Stream,
    peer: PeerId,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    closed: AtomicBool,
}

impl Connection {
    /// Wraps a stream opened or accepted for `peer`. `remote_multiaddr` is used on a best-effort
    /// basis to populate [`Connection::remote_addr`]; it is never required to be convertible.
    pub fn new(stream: libp2p::Stream, peer: PeerId, remote_multiaddr: Option<&Multiaddr>) -> Self {
        let remote_addr = remote_multiaddr
            .and_then(multiaddr_to_socket_addr)
            .unwrap_or_else(loopback_fallback);

        Self {
            stream,
            peer,
            remote_addr,
            local_addr: loopback_fallback(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Best-effort descriptor of the remote endpoint. Loopback with port 0 when unknown.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Best-effort descriptor of the local endpoint. Loopback with port 0: the bridge never binds
    /// a real socket per-stream, so there is no better value to report.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Closes both directions of the stream. Idempotent: calling this twice never errors.
    pub async fn close(&mut self) -> std::io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        tokio::io::AsyncWriteExt::shutdown(&mut self.stream).await
    }
}

impl AsyncRead for Connection {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        Pin::new(&mut this.stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        this.closed.store(true, Ordering::Release);
        Pin::new(&mut this.stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconvertible_multiaddr_falls_back_to_loopback() {
        let addr: Multiaddr = "/memory/1234".parse().unwrap();
        assert_eq!(multiaddr_to_socket_addr(&addr), None);
    }

    #[test]
    fn ip4_tcp_multiaddr_converts() {
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/4001".parse().unwrap();
        assert_eq!(
            multiaddr_to_socket_addr(&addr),
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4001))
        );
    }
}
