//! Discovery wire format.
//!
//! Six messages flow between a peer and a discovery node, all framed with
//! the shared codec: the peer opens with Register, the node answers with
//! RegisterOk (its remote identifier) or RegisterFail (a reason), then a
//! PeerList snapshot, then pushes PeerJoined / PeerLeft for the rest of
//! the stream's life.

use std::collections::BTreeSet;
use std::net::SocketAddr;

use iroh::{NodeAddr, NodeId, RelayUrl};

use crate::network::wire::{PayloadReader, PayloadWriter, WireError};
use crate::security::identity::{KeyId, KEY_ID_LEN};

/// Protocol identifier for peer/node discovery streams.
pub const NODE_ALPN: &[u8] = b"skein/node/1.0.0";

// Message type tags.
pub const MSG_REGISTER: u8 = 1;
pub const MSG_REGISTER_OK: u8 = 2;
pub const MSG_REGISTER_FAIL: u8 = 3;
pub const MSG_PEER_LIST: u8 = 4;
pub const MSG_PEER_JOINED: u8 = 5;
pub const MSG_PEER_LEFT: u8 = 6;

/// Sent by a peer to authenticate with a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Register {
    pub nickname: String,
    pub token: String,
    pub kem_public: [u8; 32],
    pub key_id: KeyId,
}

/// Public roster entry for one online peer.
///
/// Also the payload of PeerJoined and of each PeerList element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub nickname: String,
    /// Remote identifier on the transport.
    pub node_id: NodeId,
    /// Transport addresses as observed by the node: relay URLs or socket
    /// addresses, rendered as strings.
    pub addresses: Vec<String>,
    pub kem_public: [u8; 32],
    pub key_id: KeyId,
}

impl PeerInfo {
    /// Rebuild a dialable address from the roster entry.
    pub fn node_addr(&self) -> NodeAddr {
        let mut relay: Option<RelayUrl> = None;
        let mut direct: BTreeSet<SocketAddr> = BTreeSet::new();

        for addr in &self.addresses {
            if let Ok(socket) = addr.parse::<SocketAddr>() {
                direct.insert(socket);
            } else if relay.is_none() {
                if let Ok(url) = addr.parse::<RelayUrl>() {
                    relay = Some(url);
                }
            }
        }

        let mut node_addr = NodeAddr::from(self.node_id);
        if let Some(relay) = relay {
            node_addr = node_addr.with_relay_url(relay);
        }
        if !direct.is_empty() {
            node_addr = node_addr.with_direct_addresses(direct);
        }
        node_addr
    }
}

pub fn encode_register(r: &Register) -> Vec<u8> {
    let mut w = PayloadWriter::new();
    w.blob(r.nickname.as_bytes())
        .blob(r.token.as_bytes())
        .blob(&r.kem_public)
        .blob(r.key_id.as_bytes());
    w.into_bytes()
}

pub fn decode_register(payload: &[u8]) -> Result<Register, WireError> {
    let mut r = PayloadReader::new(payload);
    let nickname = r.string()?;
    let token = r.string()?;
    let kem_public: [u8; 32] = r
        .fixed_blob("kem public key", 32)?
        .try_into()
        .map_err(|_| WireError::Truncated)?;
    let key_id = KeyId::from_slice(r.fixed_blob("key id", KEY_ID_LEN)?)
        .ok_or(WireError::BadFieldLength("key id", KEY_ID_LEN))?;
    Ok(Register {
        nickname,
        token,
        kem_public,
        key_id,
    })
}

/// RegisterOk carries the node's remote identifier as raw bytes.
pub fn encode_register_ok(node_id: &NodeId) -> Vec<u8> {
    node_id.as_bytes().to_vec()
}

pub fn decode_register_ok(payload: &[u8]) -> Result<NodeId, WireError> {
    let bytes: [u8; 32] = payload
        .try_into()
        .map_err(|_| WireError::BadFieldLength("node id", payload.len()))?;
    NodeId::from_bytes(&bytes).map_err(|_| WireError::BadFieldLength("node id", payload.len()))
}

/// RegisterFail carries a human-readable reason as raw bytes.
pub fn encode_register_fail(reason: &str) -> Vec<u8> {
    reason.as_bytes().to_vec()
}

pub fn decode_register_fail(payload: &[u8]) -> Result<String, WireError> {
    String::from_utf8(payload.to_vec()).map_err(|_| WireError::BadString)
}

pub fn encode_peer(p: &PeerInfo) -> Vec<u8> {
    let mut w = PayloadWriter::new();
    w.blob(p.nickname.as_bytes()).blob(p.node_id.as_bytes());
    w.u32(p.addresses.len() as u32);
    for addr in &p.addresses {
        w.blob(addr.as_bytes());
    }
    w.blob(&p.kem_public).blob(p.key_id.as_bytes());
    w.into_bytes()
}

pub fn decode_peer(payload: &[u8]) -> Result<PeerInfo, WireError> {
    let mut r = PayloadReader::new(payload);
    let nickname = r.string()?;
    let node_id_bytes: [u8; 32] = r
        .fixed_blob("node id", 32)?
        .try_into()
        .map_err(|_| WireError::Truncated)?;
    let node_id =
        NodeId::from_bytes(&node_id_bytes).map_err(|_| WireError::BadFieldLength("node id", 32))?;

    let count = r.u32()?;
    let mut addresses = Vec::new();
    for _ in 0..count {
        addresses.push(r.string()?);
    }

    let kem_public: [u8; 32] = r
        .fixed_blob("kem public key", 32)?
        .try_into()
        .map_err(|_| WireError::Truncated)?;
    let key_id = KeyId::from_slice(r.fixed_blob("key id", KEY_ID_LEN)?)
        .ok_or(WireError::BadFieldLength("key id", KEY_ID_LEN))?;

    Ok(PeerInfo {
        nickname,
        node_id,
        addresses,
        kem_public,
        key_id,
    })
}

/// PeerList: `u32` count, then that many blobs each holding a PeerJoined
/// payload.
pub fn encode_peer_list(peers: &[PeerInfo]) -> Vec<u8> {
    let mut w = PayloadWriter::new();
    w.u32(peers.len() as u32);
    for peer in peers {
        w.blob(&encode_peer(peer));
    }
    w.into_bytes()
}

pub fn decode_peer_list(payload: &[u8]) -> Result<Vec<PeerInfo>, WireError> {
    let mut r = PayloadReader::new(payload);
    let count = r.u32()?;
    let mut peers = Vec::new();
    for _ in 0..count {
        peers.push(decode_peer(r.blob()?)?);
    }
    Ok(peers)
}

/// PeerLeft carries the nickname as raw bytes.
pub fn encode_peer_left(nickname: &str) -> Vec<u8> {
    nickname.as_bytes().to_vec()
}

pub fn decode_peer_left(payload: &[u8]) -> Result<String, WireError> {
    String::from_utf8(payload.to_vec()).map_err(|_| WireError::BadString)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_node_id(seed: u8) -> NodeId {
        iroh::SecretKey::from_bytes(&[seed; 32]).public()
    }

    fn test_key_id(seed: u8) -> KeyId {
        KeyId::from_bytes([seed; 8])
    }

    #[test]
    fn test_register_round_trip() {
        let orig = Register {
            nickname: "alice".to_string(),
            token: "secret-token".to_string(),
            kem_public: [4u8; 32],
            key_id: test_key_id(0x7a),
        };

        let decoded = decode_register(&encode_register(&orig)).unwrap();
        assert_eq!(decoded, orig);
    }

    #[test]
    fn test_register_rejects_one_byte_key_id() {
        // Legacy single-byte fingerprints are not accepted.
        let mut w = PayloadWriter::new();
        w.blob(b"alice").blob(b"t").blob(&[0u8; 32]).blob(&[0x7a]);

        match decode_register(&w.into_bytes()) {
            Err(WireError::BadFieldLength("key id", 1)) => {}
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_register_rejects_truncation() {
        let orig = Register {
            nickname: "alice".to_string(),
            token: "t".to_string(),
            kem_public: [0u8; 32],
            key_id: test_key_id(1),
        };
        let bytes = encode_register(&orig);

        for cut in [1, bytes.len() / 2, bytes.len() - 1] {
            assert!(decode_register(&bytes[..cut]).is_err());
        }
    }

    #[test]
    fn test_register_ok_round_trip() {
        let id = test_node_id(1);
        let decoded = decode_register_ok(&encode_register_ok(&id)).unwrap();
        assert_eq!(decoded, id);
    }

    #[test]
    fn test_register_ok_rejects_short_payload() {
        assert!(decode_register_ok(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_register_fail_round_trip() {
        let reason = "invalid token";
        let decoded = decode_register_fail(&encode_register_fail(reason)).unwrap();
        assert_eq!(decoded, reason);
    }

    #[test]
    fn test_peer_round_trip() {
        let orig = PeerInfo {
            nickname: "bob".to_string(),
            node_id: test_node_id(2),
            addresses: vec![
                "127.0.0.1:9000".to_string(),
                "https://relay.example.com./".to_string(),
            ],
            kem_public: [5u8; 32],
            key_id: test_key_id(0x42),
        };

        let decoded = decode_peer(&encode_peer(&orig)).unwrap();
        assert_eq!(decoded, orig);
    }

    #[test]
    fn test_peer_with_no_addresses() {
        let orig = PeerInfo {
            nickname: "carol".to_string(),
            node_id: test_node_id(3),
            addresses: vec![],
            kem_public: [6u8; 32],
            key_id: test_key_id(3),
        };

        let decoded = decode_peer(&encode_peer(&orig)).unwrap();
        assert_eq!(decoded, orig);
    }

    #[test]
    fn test_peer_list_round_trip() {
        let peers = vec![
            PeerInfo {
                nickname: "alice".to_string(),
                node_id: test_node_id(1),
                addresses: vec!["127.0.0.1:9001".to_string()],
                kem_public: [1u8; 32],
                key_id: test_key_id(1),
            },
            PeerInfo {
                nickname: "bob".to_string(),
                node_id: test_node_id(2),
                addresses: vec!["127.0.0.1:9002".to_string()],
                kem_public: [2u8; 32],
                key_id: test_key_id(2),
            },
        ];

        let decoded = decode_peer_list(&encode_peer_list(&peers)).unwrap();
        assert_eq!(decoded, peers);
    }

    #[test]
    fn test_empty_peer_list_round_trip() {
        let decoded = decode_peer_list(&encode_peer_list(&[])).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_peer_list_rejects_overdeclared_count() {
        // Claims 5 peers but carries none.
        let mut w = PayloadWriter::new();
        w.u32(5);
        assert!(decode_peer_list(&w.into_bytes()).is_err());
    }

    #[test]
    fn test_peer_left_round_trip() {
        let decoded = decode_peer_left(&encode_peer_left("carol")).unwrap();
        assert_eq!(decoded, "carol");
    }

    #[test]
    fn test_node_addr_reconstruction() {
        let info = PeerInfo {
            nickname: "dave".to_string(),
            node_id: test_node_id(4),
            addresses: vec![
                "https://relay.example.com./".to_string(),
                "127.0.0.1:4433".to_string(),
                "not an address".to_string(),
            ],
            kem_public: [0u8; 32],
            key_id: test_key_id(4),
        };

        let addr = info.node_addr();
        assert_eq!(addr.node_id, info.node_id);
        assert!(addr.relay_url.is_some());
        assert_eq!(addr.direct_addresses.len(), 1);
    }
}
