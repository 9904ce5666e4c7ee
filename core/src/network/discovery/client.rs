//! Discovery client.
//!
//! Registers with one or more discovery nodes in parallel and merges
//! their rosters into a single tracked view: each tracked peer remembers
//! which nodes currently report it online (`SeenBy`) and is dropped only
//! when the last reference goes away. Roster changes are pushed into the
//! shared [`PeerTable`] and surfaced to a [`PeerHandler`]; handler
//! callbacks always run while no client lock is held.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::join_all;
use iroh::endpoint::{Connection, RecvStream, SendStream};
use iroh::{Endpoint, NodeAddr, NodeId, RelayUrl};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::data::peer_table::PeerTable;
use crate::network::discovery::protocol::{
    decode_peer, decode_peer_left, decode_peer_list, decode_register_fail, decode_register_ok,
    encode_register, PeerInfo, Register, MSG_PEER_JOINED, MSG_PEER_LEFT, MSG_PEER_LIST,
    MSG_REGISTER, MSG_REGISTER_FAIL, MSG_REGISTER_OK, NODE_ALPN,
};
use crate::network::discovery::DiscoveryError;
use crate::network::wire::{read_frame, write_frame};
use crate::security::identity::KeyId;

/// Per-node timeout inside [`DiscoveryClient::connect_all`].
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Receives roster events. Callbacks are invoked outside every client
/// lock; implementations may call back into the client freely.
pub trait PeerHandler: Send + Sync {
    fn on_peer_joined(&self, peer: &PeerInfo, node_id: NodeId);
    fn on_peer_left(&self, nickname: &str, node_id: NodeId);
    fn on_node_connected(&self, node_id: NodeId);
    fn on_node_disconnected(&self, node_id: NodeId);
}

/// A peer as reported by one or more nodes.
#[derive(Debug, Clone)]
pub struct TrackedPeer {
    pub info: PeerInfo,
    /// Nodes currently reporting this peer online. Never empty while the
    /// entry exists.
    pub seen_by: HashSet<NodeId>,
}

/// Merge state for the tracked roster. Pure bookkeeping, no I/O.
#[derive(Default)]
struct RosterState {
    peers: HashMap<String, TrackedPeer>,
}

impl RosterState {
    /// PeerJoined / PeerList entry from `node`: create the entry or add
    /// the node to `seen_by`, refreshing addresses from this report.
    fn apply_joined(&mut self, info: PeerInfo, node: NodeId) {
        match self.peers.get_mut(&info.nickname) {
            Some(tracked) => {
                tracked.seen_by.insert(node);
                tracked.info.addresses = info.addresses;
            }
            None => {
                self.peers.insert(
                    info.nickname.clone(),
                    TrackedPeer {
                        info,
                        seen_by: HashSet::from([node]),
                    },
                );
            }
        }
    }

    /// PeerLeft from `node`. Returns `None` when the nickname was not
    /// tracked (no event fires), otherwise whether the entry is now gone.
    fn apply_left(&mut self, nickname: &str, node: NodeId) -> Option<bool> {
        let tracked = self.peers.get_mut(nickname)?;
        tracked.seen_by.remove(&node);
        if tracked.seen_by.is_empty() {
            self.peers.remove(nickname);
            Some(true)
        } else {
            Some(false)
        }
    }

    /// A node went away: drop it from every `seen_by`, returning the
    /// nicknames whose entries disappeared.
    fn apply_node_gone(&mut self, node: NodeId) -> Vec<String> {
        let mut dropped = Vec::new();
        self.peers.retain(|nickname, tracked| {
            tracked.seen_by.remove(&node);
            if tracked.seen_by.is_empty() {
                dropped.push(nickname.clone());
                false
            } else {
                true
            }
        });
        dropped
    }

    fn get(&self, nickname: &str) -> Option<&TrackedPeer> {
        self.peers.get(nickname)
    }
}

struct NodeHandle {
    cancel: CancellationToken,
    conn: Connection,
    /// Held open for the connection's lifetime; the node reads this
    /// stream only to notice when we go away.
    _send: SendStream,
}

struct Inner {
    nodes: HashMap<NodeId, NodeHandle>,
    roster: RosterState,
}

/// Client side of the discovery protocol. Cloning shares the client.
#[derive(Clone)]
pub struct DiscoveryClient {
    endpoint: Endpoint,
    nickname: String,
    token: String,
    kem_public: [u8; 32],
    key_id: KeyId,
    table: PeerTable,
    handler: Arc<dyn PeerHandler>,
    inner: Arc<RwLock<Inner>>,
}

impl DiscoveryClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        endpoint: Endpoint,
        nickname: String,
        token: String,
        kem_public: [u8; 32],
        key_id: KeyId,
        table: PeerTable,
        handler: Arc<dyn PeerHandler>,
    ) -> Self {
        Self {
            endpoint,
            nickname,
            token,
            kem_public,
            key_id,
            table,
            handler,
            inner: Arc::new(RwLock::new(Inner {
                nodes: HashMap::new(),
                roster: RosterState::default(),
            })),
        }
    }

    /// Register with one node and start tracking its pushes.
    pub async fn connect(&self, node_addr: &str) -> Result<(), DiscoveryError> {
        let addr = parse_node_ticket(node_addr)?;
        let _ = self.endpoint.add_node_addr(addr.clone());

        let conn = self
            .endpoint
            .connect(addr, NODE_ALPN)
            .await
            .map_err(|e| DiscoveryError::Transport(e.to_string()))?;
        let (mut send, mut recv) = conn
            .open_bi()
            .await
            .map_err(|e| DiscoveryError::Transport(e.to_string()))?;

        let register = Register {
            nickname: self.nickname.clone(),
            token: self.token.clone(),
            kem_public: self.kem_public,
            key_id: self.key_id,
        };
        write_frame(&mut send, MSG_REGISTER, &encode_register(&register)).await?;

        // RegisterOk or RegisterFail must come first.
        let (tag, payload) = read_frame(&mut recv).await?;
        match tag {
            MSG_REGISTER_OK => {
                decode_register_ok(&payload)?;
            }
            MSG_REGISTER_FAIL => {
                return Err(DiscoveryError::Registration(decode_register_fail(&payload)?));
            }
            other => {
                return Err(DiscoveryError::Unexpected(format!(
                    "expected RegisterOk, got {}",
                    other
                )));
            }
        }

        // The snapshot PeerList must be the next message.
        let (tag, payload) = read_frame(&mut recv).await?;
        if tag != MSG_PEER_LIST {
            return Err(DiscoveryError::Unexpected(format!(
                "expected PeerList, got {}",
                tag
            )));
        }
        let peers = decode_peer_list(&payload)?;

        let node_id = iroh::endpoint::get_remote_node_id(&conn)
            .map_err(|e| DiscoveryError::Transport(e.to_string()))?;
        let cancel = CancellationToken::new();

        // Seed the roster under the lock; fire callbacks after releasing.
        let joined: Vec<PeerInfo> = {
            let mut inner = self.inner.write().expect("client lock poisoned");
            inner.nodes.insert(
                node_id,
                NodeHandle {
                    cancel: cancel.clone(),
                    conn: conn.clone(),
                    _send: send,
                },
            );
            for peer in &peers {
                inner.roster.apply_joined(peer.clone(), node_id);
                self.table.insert(peer.clone());
            }
            peers
        };

        self.handler.on_node_connected(node_id);
        for peer in &joined {
            self.handler.on_peer_joined(peer, node_id);
        }

        info!(
            node = %node_id.fmt_short(),
            peers = joined.len(),
            "registered with discovery node"
        );

        let client = self.clone();
        tokio::spawn(async move {
            client.read_loop(node_id, cancel, recv).await;
        });

        Ok(())
    }

    /// Connect to several nodes in parallel, each with its own timeout.
    /// Partial success is success; an error is returned only when no
    /// node was reached.
    pub async fn connect_all(&self, node_addrs: &[String]) -> Result<(), DiscoveryError> {
        let attempts = node_addrs.iter().map(|addr| async move {
            match tokio::time::timeout(CONNECT_TIMEOUT, self.connect(addr)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    warn!(node = %addr, error = %e, "node connect failed");
                    Err(e)
                }
                Err(_) => {
                    warn!(node = %addr, "node connect timed out");
                    Err(DiscoveryError::Timeout(addr.clone()))
                }
            }
        });

        let results = join_all(attempts).await;
        if results.iter().any(|r| r.is_ok()) {
            return Ok(());
        }
        match results.into_iter().find_map(|r| r.err()) {
            Some(first) => Err(DiscoveryError::NoNodesReached(first.to_string())),
            None => Ok(()), // empty address list
        }
    }

    /// Snapshot of one tracked peer.
    pub fn get_peer(&self, nickname: &str) -> Option<PeerInfo> {
        let inner = self.inner.read().expect("client lock poisoned");
        inner.roster.get(nickname).map(|t| t.info.clone())
    }

    /// Snapshot of all tracked peers.
    pub fn get_all_peers(&self) -> Vec<PeerInfo> {
        let inner = self.inner.read().expect("client lock poisoned");
        inner.roster.peers.values().map(|t| t.info.clone()).collect()
    }

    /// Nodes this client is currently registered with.
    pub fn connected_nodes(&self) -> Vec<NodeId> {
        let inner = self.inner.read().expect("client lock poisoned");
        inner.nodes.keys().copied().collect()
    }

    /// Cancel every read loop and close every node stream.
    pub fn close(&self) {
        let inner = self.inner.read().expect("client lock poisoned");
        for handle in inner.nodes.values() {
            handle.cancel.cancel();
            handle.conn.close(0u32.into(), b"client closed");
        }
    }

    /// Receive PeerJoined / PeerLeft pushes until cancellation or stream
    /// death, then undo this node's contribution to the roster.
    async fn read_loop(&self, node_id: NodeId, cancel: CancellationToken, mut recv: RecvStream) {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = read_frame(&mut recv) => frame,
            };

            match frame {
                Ok((MSG_PEER_JOINED, payload)) => {
                    let peer = match decode_peer(&payload) {
                        Ok(p) => p,
                        Err(e) => {
                            debug!(node = %node_id.fmt_short(), error = %e, "bad peer joined push");
                            continue;
                        }
                    };
                    {
                        let mut inner = self.inner.write().expect("client lock poisoned");
                        inner.roster.apply_joined(peer.clone(), node_id);
                        self.table.insert(peer.clone());
                    }
                    self.handler.on_peer_joined(&peer, node_id);
                }
                Ok((MSG_PEER_LEFT, payload)) => {
                    let nickname = match decode_peer_left(&payload) {
                        Ok(n) => n,
                        Err(e) => {
                            debug!(node = %node_id.fmt_short(), error = %e, "bad peer left push");
                            continue;
                        }
                    };
                    let effect = {
                        let mut inner = self.inner.write().expect("client lock poisoned");
                        let effect = inner.roster.apply_left(&nickname, node_id);
                        if effect == Some(true) {
                            self.table.remove(&nickname);
                        }
                        effect
                    };
                    if effect.is_some() {
                        self.handler.on_peer_left(&nickname, node_id);
                    }
                }
                Ok((tag, _)) => {
                    debug!(node = %node_id.fmt_short(), tag, "ignoring unexpected push");
                }
                Err(e) => {
                    debug!(node = %node_id.fmt_short(), error = %e, "node stream ended");
                    break;
                }
            }
        }

        // Drop everything this node was vouching for.
        let dropped = {
            let mut inner = self.inner.write().expect("client lock poisoned");
            inner.nodes.remove(&node_id);
            let dropped = inner.roster.apply_node_gone(node_id);
            for nickname in &dropped {
                self.table.remove(nickname);
            }
            dropped
        };
        if !dropped.is_empty() {
            debug!(
                node = %node_id.fmt_short(),
                dropped = dropped.len(),
                "peers lost their last reporting node"
            );
        }
        self.handler.on_node_disconnected(node_id);
    }
}

/// Parse a node address string: 64 hex chars of node id, optionally
/// followed by `@`-separated relay URLs or socket addresses.
pub fn parse_node_ticket(s: &str) -> Result<NodeAddr, DiscoveryError> {
    let mut parts = s.split('@');
    let id_part = parts.next().unwrap_or_default();

    let id_bytes = hex::decode(id_part)
        .map_err(|_| DiscoveryError::BadAddress(format!("invalid node id in {:?}", s)))?;
    let id_bytes: [u8; 32] = id_bytes
        .as_slice()
        .try_into()
        .map_err(|_| DiscoveryError::BadAddress(format!("invalid node id in {:?}", s)))?;
    let node_id = NodeId::from_bytes(&id_bytes)
        .map_err(|_| DiscoveryError::BadAddress(format!("invalid node id in {:?}", s)))?;

    let mut addr = NodeAddr::from(node_id);
    let mut direct = Vec::new();
    for part in parts {
        if let Ok(socket) = part.parse::<SocketAddr>() {
            direct.push(socket);
        } else if let Ok(relay) = part.parse::<RelayUrl>() {
            addr = addr.with_relay_url(relay);
        } else {
            return Err(DiscoveryError::BadAddress(format!(
                "unparseable address part {:?}",
                part
            )));
        }
    }
    if !direct.is_empty() {
        addr = addr.with_direct_addresses(direct);
    }
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::identity::KeyId;

    fn node(seed: u8) -> NodeId {
        iroh::SecretKey::from_bytes(&[seed; 32]).public()
    }

    fn peer(nickname: &str, seed: u8) -> PeerInfo {
        PeerInfo {
            nickname: nickname.to_string(),
            node_id: node(seed),
            addresses: vec![format!("127.0.0.1:{}", 9000 + seed as u16)],
            kem_public: [seed; 32],
            key_id: KeyId::from_bytes([seed; 8]),
        }
    }

    #[test]
    fn test_merge_from_two_nodes() {
        // Scenario: bob is reported by two nodes, then leaves them one at
        // a time.
        let mut roster = RosterState::default();
        let (n1, n2) = (node(1), node(2));

        roster.apply_joined(peer("bob", 10), n1);
        roster.apply_joined(peer("bob", 10), n2);
        let tracked = roster.get("bob").unwrap();
        assert_eq!(tracked.seen_by.len(), 2);

        // First PeerLeft: still visible through n2.
        assert_eq!(roster.apply_left("bob", n1), Some(false));
        let tracked = roster.get("bob").unwrap();
        assert_eq!(tracked.seen_by, HashSet::from([n2]));

        // Second PeerLeft: gone.
        assert_eq!(roster.apply_left("bob", n2), Some(true));
        assert!(roster.get("bob").is_none());
    }

    #[test]
    fn test_left_for_untracked_peer_is_noop() {
        let mut roster = RosterState::default();
        assert_eq!(roster.apply_left("ghost", node(1)), None);
    }

    #[test]
    fn test_left_from_node_that_never_reported_keeps_entry() {
        let mut roster = RosterState::default();
        let (n1, n2) = (node(1), node(2));

        roster.apply_joined(peer("bob", 10), n1);

        // n2 never reported bob; the entry must survive unchanged.
        assert_eq!(roster.apply_left("bob", n2), Some(false));
        let tracked = roster.get("bob").unwrap();
        assert_eq!(tracked.seen_by, HashSet::from([n1]));
    }

    #[test]
    fn test_joined_refreshes_addresses() {
        let mut roster = RosterState::default();
        let n1 = node(1);

        roster.apply_joined(peer("bob", 10), n1);
        let mut fresher = peer("bob", 10);
        fresher.addresses = vec!["10.0.0.1:1234".to_string()];
        roster.apply_joined(fresher, n1);

        let tracked = roster.get("bob").unwrap();
        assert_eq!(tracked.info.addresses, vec!["10.0.0.1:1234".to_string()]);
        assert_eq!(tracked.seen_by.len(), 1);
    }

    #[test]
    fn test_node_gone_drops_only_orphaned_entries() {
        let mut roster = RosterState::default();
        let (n1, n2) = (node(1), node(2));

        roster.apply_joined(peer("bob", 10), n1);
        roster.apply_joined(peer("bob", 10), n2);
        roster.apply_joined(peer("carol", 11), n1);

        let dropped = roster.apply_node_gone(n1);
        assert_eq!(dropped, vec!["carol".to_string()]);
        assert!(roster.get("carol").is_none());

        // bob survives via n2, and his seen_by stays non-empty.
        let bob = roster.get("bob").unwrap();
        assert_eq!(bob.seen_by, HashSet::from([n2]));
    }

    #[test]
    fn test_seen_by_never_empty_while_tracked() {
        let mut roster = RosterState::default();
        let n1 = node(1);
        roster.apply_joined(peer("bob", 10), n1);

        assert!(!roster.get("bob").unwrap().seen_by.is_empty());
        roster.apply_left("bob", n1);
        assert!(roster.get("bob").is_none());
    }

    #[test]
    fn test_parse_node_ticket_id_only() {
        let id = node(3);
        let addr = parse_node_ticket(&hex::encode(id.as_bytes())).unwrap();
        assert_eq!(addr.node_id, id);
        assert!(addr.relay_url.is_none());
        assert!(addr.direct_addresses.is_empty());
    }

    #[test]
    fn test_parse_node_ticket_with_addresses() {
        let id = node(4);
        let s = format!(
            "{}@https://relay.example.com./@127.0.0.1:4433",
            hex::encode(id.as_bytes())
        );
        let addr = parse_node_ticket(&s).unwrap();
        assert_eq!(addr.node_id, id);
        assert!(addr.relay_url.is_some());
        assert_eq!(addr.direct_addresses.len(), 1);
    }

    #[test]
    fn test_parse_node_ticket_rejects_garbage() {
        assert!(parse_node_ticket("not-hex").is_err());
        assert!(parse_node_ticket("abcd").is_err());
        let id = node(5);
        let s = format!("{}@nonsense", hex::encode(id.as_bytes()));
        assert!(parse_node_ticket(&s).is_err());
    }
}
