//! Parses and formats gateway URL paths of the form:
//!
//! ```text
//! /@<multiaddr-1>[@<multiaddr-2>...]@/<service>/<method>
//! ```
//!
//! The first multiaddress must carry a `/p2p/<peer>` component; later ones inherit it if absent.
//! Multi-peer paths (multiaddresses resolving to more than one distinct peer) are rejected, per
//! this implementation's resolution of the "multi-peer paths" open question.

use std::collections::BTreeMap;

use libp2p::core::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};

/// The literal delimiter that opens (and separates entries within) a gateway path.
pub const BRACKET_TOKEN: &str = "/@";

#[derive(Debug, thiserror::Error)]
pub enum PathParseError {
    #[error("path does not start with the bracket token")]
    NotAGatewayPath,
    #[error("no multiaddress segment found before the service path")]
    MissingMultiaddr,
    #[error("first multiaddress segment is missing a /p2p/<peer> component")]
    MissingPeerId,
    #[error("no syntactically valid multiaddress in the path")]
    NoValidMultiaddr,
    #[error("service path is empty")]
    EmptyServicePath,
    #[error("path addresses more than one distinct peer, which is not supported")]
    MultiplePeers,
}

/// A decoded gateway path: the peer to reach, the multiaddresses to try, and the RPC route to
/// forward to once connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayPath {
    pub peer: PeerId,
    pub addrs: Vec<Multiaddr>,
    pub service_path: String,
}

fn peer_of(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|p| match p {
        Protocol::P2p(peer) => Some(peer),
        _ => None,
    })
}

/// Decodes a gateway path per the grammar above. Returns [`PathParseError::NotAGatewayPath`] for
/// any path that is simply not one of ours (the caller should route it elsewhere, not treat it as
/// a failure).
pub fn decode(path: &str) -> Result<GatewayPath, PathParseError> {
    if !path.starts_with(BRACKET_TOKEN) {
        return Err(PathParseError::NotAGatewayPath);
    }

    // Strip the leading "/@" (one bracket token), then split the remainder on "@".
    let tail = &path[BRACKET_TOKEN.len()..];
    let mut segments: Vec<&str> = tail.split('@').collect();

    let service_path_raw = segments.pop().ok_or(PathParseError::MissingMultiaddr)?;
    if segments.is_empty() {
        return Err(PathParseError::MissingMultiaddr);
    }

    let service_path = if service_path_raw.starts_with('/') {
        service_path_raw.to_owned()
    } else {
        format!("/{service_path_raw}")
    };
    if service_path == "/" {
        return Err(PathParseError::EmptyServicePath);
    }

    let first: Multiaddr = segments[0].parse().map_err(|_| PathParseError::MissingMultiaddr)?;
    let peer = peer_of(&first).ok_or(PathParseError::MissingPeerId)?;

    let mut addrs = Vec::with_capacity(segments.len());
    let mut peers = BTreeMap::new();

    for segment in &segments {
        let Ok(mut addr): Result<Multiaddr, _> = segment.parse() else {
            // Syntactically invalid segments are discarded silently.
            continue;
        };

        let segment_peer = match peer_of(&addr) {
            Some(p) => p,
            None => {
                addr.push(Protocol::P2p(peer));
                peer
            }
        };

        *peers.entry(segment_peer).or_insert(0_usize) += 1;
        addrs.push(addr);
    }

    if addrs.is_empty() {
        return Err(PathParseError::NoValidMultiaddr);
    }

    if peers.len() > 1 {
        return Err(PathParseError::MultiplePeers);
    }

    Ok(GatewayPath {
        peer,
        addrs,
        service_path,
    })
}

/// Encodes a gateway path back into the bracketed URL form. Used to advertise a peer's own
/// gateway URL (the `/p2pinfo` endpoint and tests constructing request URLs).
pub fn encode(addrs: &[Multiaddr], service_path: &str) -> String {
    let mut out = String::from(BRACKET_TOKEN);
    for addr in addrs {
        out.push_str(&addr.to_string());
        out.push('@');
    }
    if service_path.starts_with('/') {
        out.push_str(service_path);
    } else {
        out.push('/');
        out.push_str(service_path);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_peer() -> PeerId {
        PeerId::random()
    }

    #[test]
    fn rejects_non_gateway_path() {
        assert!(matches!(decode("/hello"), Err(PathParseError::NotAGatewayPath)));
    }

    #[test]
    fn rejects_bare_bracket_token() {
        assert!(matches!(
            decode("/@"),
            Err(PathParseError::MissingMultiaddr) | Err(PathParseError::EmptyServicePath)
        ));
    }

    #[test]
    fn rejects_missing_peer_id() {
        assert!(matches!(
            decode("/@/ip4/127.0.0.1/tcp/4001@/svc/Method"),
            Err(PathParseError::MissingPeerId)
        ));
    }

    #[test]
    fn decodes_single_peer_path() {
        let peer = sample_peer();
        let addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/4001/p2p/{peer}").parse().unwrap();
        let path = format!("/@{addr}@/greeter.v1.GreeterService/SayHello");

        let decoded = decode(&path).unwrap();
        assert_eq!(decoded.peer, peer);
        assert_eq!(decoded.addrs, vec![addr]);
        assert_eq!(decoded.service_path, "/greeter.v1.GreeterService/SayHello");
    }

    #[test]
    fn rejects_multiple_distinct_peers() {
        let peer_a = sample_peer();
        let peer_b = sample_peer();
        let addr_a: Multiaddr = format!("/ip4/127.0.0.1/tcp/4001/p2p/{peer_a}").parse().unwrap();
        let addr_b: Multiaddr = format!("/ip4/127.0.0.1/tcp/4002/p2p/{peer_b}").parse().unwrap();
        let path = format!("/@{addr_a}@{addr_b}@/svc/Method");

        assert!(matches!(decode(&path), Err(PathParseError::MultiplePeers)));
    }

    proptest! {
        #[test]
        fn decode_then_encode_round_trips(service in "[a-zA-Z][a-zA-Z0-9_./]{1,40}") {
            let peer = PeerId::random();
            let addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/4001/p2p/{peer}").parse().unwrap();
            let service_path = format!("/{service}");
            let path = encode(&[addr.clone()], &service_path);

            let decoded = decode(&path).unwrap();
            let re_encoded = encode(&decoded.addrs, &decoded.service_path);
            let re_decoded = decode(&re_encoded).unwrap();

            prop_assert_eq!(decoded.peer, re_decoded.peer);
            prop_assert_eq!(decoded.service_path, re_decoded.service_path);
        }
    }
}
