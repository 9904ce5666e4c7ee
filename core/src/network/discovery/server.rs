//! Discovery node server.
//!
//! Keeps the live table of online peers for a fixed set of authorized
//! nicknames. Each inbound stream must open with Register; after token
//! validation the peer receives RegisterOk plus a snapshot PeerList and
//! is pushed PeerJoined/PeerLeft events until its stream dies. The push
//! streams are held in an indexed table beside the online map; both maps
//! always cover the same nicknames.

use std::collections::HashMap;
use std::sync::Arc;

use iroh::endpoint::{Connection, SendStream};
use iroh::{Endpoint, NodeId, RelayMode};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::network::discovery::protocol::{
    encode_peer, encode_peer_left, encode_peer_list, encode_register_fail, encode_register_ok,
    decode_register, PeerInfo, MSG_PEER_JOINED, MSG_PEER_LEFT, MSG_PEER_LIST, MSG_REGISTER,
    MSG_REGISTER_FAIL, MSG_REGISTER_OK, NODE_ALPN,
};
use crate::network::discovery::DiscoveryError;
use crate::network::wire::{read_frame, write_frame};
use crate::protocol::config::NodeConfig;
use crate::security::identity::DerivedKeys;

type PushStream = Arc<Mutex<SendStream>>;

#[derive(Default)]
struct ServerState {
    /// nickname -> roster entry for every online peer.
    online: HashMap<String, PeerInfo>,
    /// nickname -> push stream, same key domain as `online`.
    streams: HashMap<String, PushStream>,
}

/// A running discovery node.
pub struct NodeServer {
    endpoint: Endpoint,
    state: Arc<RwLock<ServerState>>,
    accept_task: JoinHandle<()>,
}

impl NodeServer {
    /// Bind the endpoint and start accepting registrations.
    pub async fn start(identity: &DerivedKeys, config: NodeConfig) -> Result<Self, DiscoveryError> {
        let mut builder = Endpoint::builder()
            .secret_key(identity.transport.clone())
            .alpns(vec![NODE_ALPN.to_vec()]);
        if config.disable_relay {
            builder = builder.relay_mode(RelayMode::Disabled);
        }
        if let Some(listen) = &config.listen {
            let addr = listen
                .parse()
                .map_err(|_| DiscoveryError::BadAddress(listen.clone()))?;
            builder = builder.bind_addr_v4(addr);
        }
        let endpoint = builder
            .bind()
            .await
            .map_err(|e| DiscoveryError::Bind(e.to_string()))?;

        info!(
            node_id = %endpoint.node_id().fmt_short(),
            peers = config.peers.len(),
            "discovery node started"
        );

        let state = Arc::new(RwLock::new(ServerState::default()));
        let accept_task = tokio::spawn(Self::run_accept(
            endpoint.clone(),
            Arc::new(config),
            state.clone(),
        ));

        Ok(Self {
            endpoint,
            state,
            accept_task,
        })
    }

    /// The node's remote identifier.
    pub fn node_id(&self) -> NodeId {
        self.endpoint.node_id()
    }

    /// Address string clients can pass to `DiscoveryClient::connect`:
    /// hex node id followed by `@`-separated dialable addresses.
    pub async fn ticket(&self) -> Result<String, DiscoveryError> {
        let addr = self
            .endpoint
            .node_addr()
            .await
            .map_err(|e| DiscoveryError::Transport(e.to_string()))?;

        let mut ticket = hex::encode(self.endpoint.node_id().as_bytes());
        if let Some(relay) = &addr.relay_url {
            ticket.push('@');
            ticket.push_str(relay.as_str());
        }
        for direct in &addr.direct_addresses {
            ticket.push('@');
            ticket.push_str(&direct.to_string());
        }
        Ok(ticket)
    }

    /// Number of currently online peers.
    pub async fn online_count(&self) -> usize {
        self.state.read().await.online.len()
    }

    /// Nicknames of currently online peers.
    pub async fn online_peers(&self) -> Vec<String> {
        self.state.read().await.online.keys().cloned().collect()
    }

    /// Stop accepting new registrations and drop the endpoint.
    pub fn shutdown(&self) {
        self.accept_task.abort();
    }

    async fn run_accept(endpoint: Endpoint, config: Arc<NodeConfig>, state: Arc<RwLock<ServerState>>) {
        while let Some(incoming) = endpoint.accept().await {
            let mut connecting = match incoming.accept() {
                Ok(connecting) => connecting,
                Err(e) => {
                    debug!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            let alpn = connecting.alpn().await.ok();
            if alpn.as_deref() != Some(NODE_ALPN) {
                debug!(?alpn, "ignoring unknown ALPN");
                continue;
            }

            let conn = match connecting.await {
                Ok(conn) => conn,
                Err(e) => {
                    debug!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            let endpoint = endpoint.clone();
            let config = config.clone();
            let state = state.clone();
            tokio::spawn(async move {
                handle_stream(endpoint, config, state, conn).await;
            });
        }

        info!("discovery accept loop stopped");
    }
}

impl Drop for NodeServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Serve one registration stream for its lifetime.
async fn handle_stream(
    endpoint: Endpoint,
    config: Arc<NodeConfig>,
    state: Arc<RwLock<ServerState>>,
    conn: Connection,
) {
    let (mut send, mut recv) = match conn.accept_bi().await {
        Ok(pair) => pair,
        Err(e) => {
            debug!(error = %e, "failed to accept stream");
            return;
        }
    };

    // 1) The stream must open with Register.
    let (tag, payload) = match read_frame(&mut recv).await {
        Ok(frame) => frame,
        Err(e) => {
            debug!(error = %e, "registration read failed");
            return;
        }
    };
    if tag != MSG_REGISTER {
        send_fail(&mut send, "expected Register").await;
        return;
    }
    let register = match decode_register(&payload) {
        Ok(r) => r,
        Err(e) => {
            debug!(error = %e, "bad register payload");
            send_fail(&mut send, "invalid Register message").await;
            return;
        }
    };

    // 2) Token check against the configured roster.
    let Some(expected_token) = config.peers.get(&register.nickname) else {
        warn!(nickname = %register.nickname, "register from unknown nickname");
        send_fail(&mut send, "unknown nickname").await;
        return;
    };
    if register.token != *expected_token {
        warn!(nickname = %register.nickname, "register with invalid token");
        send_fail(&mut send, "invalid token").await;
        return;
    }

    let remote = match iroh::endpoint::get_remote_node_id(&conn) {
        Ok(id) => id,
        Err(e) => {
            debug!(error = %e, "failed to get remote node id");
            return;
        }
    };

    // 3) Observe the peer's transport addresses from the connection.
    let addresses = observed_addresses(&endpoint, remote);
    let peer = PeerInfo {
        nickname: register.nickname.clone(),
        node_id: remote,
        addresses,
        kem_public: register.kem_public,
        key_id: register.key_id,
    };

    // 4) Snapshot the current roster and insert the newcomer under one
    // write lock, so the snapshot never includes the peer itself. The
    // newcomer's stream lock is taken before the state lock drops, so no
    // concurrent broadcast can push anything ahead of RegisterOk.
    let send = Arc::new(Mutex::new(send));
    let (snapshot, mut first_writes) = {
        let mut st = state.write().await;
        if st.online.contains_key(&register.nickname) {
            drop(st);
            warn!(nickname = %register.nickname, "register for nickname already online");
            send_fail(&mut *send.lock().await, "nickname already in use").await;
            return;
        }
        let snapshot: Vec<PeerInfo> = st.online.values().cloned().collect();
        st.online.insert(register.nickname.clone(), peer.clone());
        st.streams.insert(register.nickname.clone(), send.clone());
        let guard = send.clone().lock_owned().await;
        (snapshot, guard)
    };

    // 5) RegisterOk, then the snapshot PeerList.
    if let Err(e) = write_frame(
        &mut *first_writes,
        MSG_REGISTER_OK,
        &encode_register_ok(&endpoint.node_id()),
    )
    .await
    {
        debug!(nickname = %register.nickname, error = %e, "register ok write failed");
        drop(first_writes);
        remove_peer(&state, &register.nickname).await;
        return;
    }
    if let Err(e) = write_frame(&mut *first_writes, MSG_PEER_LIST, &encode_peer_list(&snapshot)).await
    {
        debug!(nickname = %register.nickname, error = %e, "peer list write failed");
        drop(first_writes);
        remove_peer(&state, &register.nickname).await;
        return;
    }
    drop(first_writes);

    // 6) Tell everyone else.
    broadcast_joined(&state, &peer).await;
    info!(nickname = %register.nickname, remote = %remote.fmt_short(), "peer online");

    // 7) Reads serve only to detect the stream's death.
    let mut buf = [0u8; 1];
    loop {
        match recv.read(&mut buf).await {
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => break,
        }
    }

    remove_peer(&state, &register.nickname).await;
    broadcast_left(&state, &register.nickname).await;
    info!(nickname = %register.nickname, "peer offline");
}

async fn send_fail(send: &mut SendStream, reason: &str) {
    if let Err(e) = write_frame(send, MSG_REGISTER_FAIL, &encode_register_fail(reason)).await {
        debug!(error = %e, "register fail write failed");
        return;
    }
    // Flush before the stream drops so the reason reaches the peer.
    if send.finish().is_ok() {
        let _ = send.stopped().await;
    }
}

/// Relay URL and direct addresses the endpoint currently knows for
/// `node_id`, rendered as strings.
fn observed_addresses(endpoint: &Endpoint, node_id: NodeId) -> Vec<String> {
    let mut addresses = Vec::new();
    if let Some(info) = endpoint.remote_info(node_id) {
        if let Some(relay) = info.relay_url {
            addresses.push(relay.relay_url.to_string());
        }
        for direct in info.addrs {
            addresses.push(direct.addr.to_string());
        }
    }
    addresses
}

async fn remove_peer(state: &Arc<RwLock<ServerState>>, nickname: &str) {
    let mut st = state.write().await;
    st.online.remove(nickname);
    st.streams.remove(nickname);
}

/// Push PeerJoined to every registered peer except the newcomer.
/// Best-effort: a failed write only loses that peer's notification.
async fn broadcast_joined(state: &Arc<RwLock<ServerState>>, peer: &PeerInfo) {
    let encoded = encode_peer(peer);
    let st = state.read().await;
    for (nickname, stream) in &st.streams {
        if nickname == &peer.nickname {
            continue;
        }
        let mut s = stream.lock().await;
        if let Err(e) = write_frame(&mut *s, MSG_PEER_JOINED, &encoded).await {
            debug!(nickname = %nickname, error = %e, "peer joined push failed");
        }
    }
}

/// Push PeerLeft to every remaining registered peer.
async fn broadcast_left(state: &Arc<RwLock<ServerState>>, nickname: &str) {
    let encoded = encode_peer_left(nickname);
    let st = state.read().await;
    for (other, stream) in &st.streams {
        let mut s = stream.lock().await;
        if let Err(e) = write_frame(&mut *s, MSG_PEER_LEFT, &encoded).await {
            debug!(nickname = %other, error = %e, "peer left push failed");
        }
    }
}
