//! Public messenger interface.
//!
//! [`Messenger`] assembles the whole stack: identity derivation, the
//! transport endpoint, the inbound session handler, the discovery client
//! and the session pool. External collaborators (TUI, CLI) drive it
//! through this module alone.

pub mod config;
pub mod error;
pub mod events;

use std::sync::{Arc, Mutex as StdMutex};

use iroh::{Endpoint, NodeId, RelayMode};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::data::peer_table::PeerTable;
use crate::network::discovery::client::DiscoveryClient;
use crate::network::discovery::protocol::PeerInfo;
use crate::network::session::incoming::{run_inbound, FixedReply};
use crate::network::session::pool::SessionPool;
use crate::network::session::protocol::MSG_ALPN;
use crate::security::identity::{derive, DerivedKeys, KeyId};

pub use config::{MessengerConfig, NodeConfig};
pub use error::MessengerError;
pub use events::MessengerEvent;

/// A running peer: one identity, one endpoint, one roster, many
/// sessions.
pub struct Messenger {
    identity: Arc<DerivedKeys>,
    endpoint: Endpoint,
    nickname: String,
    table: PeerTable,
    pool: Arc<SessionPool>,
    discovery: DiscoveryClient,
    events: StdMutex<Option<mpsc::UnboundedReceiver<MessengerEvent>>>,
    inbound_task: JoinHandle<()>,
}

impl Messenger {
    /// Derive keys, bind the endpoint, start serving inbound sessions,
    /// and register with the configured discovery nodes.
    ///
    /// Reaching no node at all is an error; partial success is success.
    pub async fn start(config: MessengerConfig) -> Result<Self, MessengerError> {
        let identity = Arc::new(derive(&config.seed)?);

        let mut builder = Endpoint::builder()
            .secret_key(identity.transport.clone())
            .alpns(vec![MSG_ALPN.to_vec()]);
        if config.disable_relay {
            builder = builder.relay_mode(RelayMode::Disabled);
        }
        if let Some(addr) = config.bind_addr {
            builder = builder.bind_addr_v4(addr);
        }
        let endpoint = builder
            .bind()
            .await
            .map_err(|e| MessengerError::StartFailed(format!("failed to create endpoint: {}", e)))?;

        info!(
            nickname = %config.nickname,
            node_id = %endpoint.node_id().fmt_short(),
            key_id = %identity.key_id,
            "messenger started"
        );

        let table = PeerTable::new();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let reply = config.reply.unwrap_or_else(|| Arc::new(FixedReply));

        let pool = SessionPool::new(
            endpoint.clone(),
            table.clone(),
            identity.clone(),
            config.nickname.clone(),
            event_tx.clone(),
            reply,
        );

        let inbound_task = tokio::spawn(run_inbound(pool.clone(), endpoint.clone()));

        let bridge = Arc::new(events::EventBridge {
            table: table.clone(),
            pool: pool.clone(),
            events: event_tx,
        });
        let discovery = DiscoveryClient::new(
            endpoint.clone(),
            config.nickname.clone(),
            config.token.clone(),
            identity.kem_public,
            identity.key_id,
            table.clone(),
            bridge,
        );

        if !config.nodes.is_empty() {
            discovery.connect_all(&config.nodes).await?;
        }

        Ok(Self {
            identity,
            endpoint,
            nickname: config.nickname,
            table,
            pool,
            discovery,
            events: StdMutex::new(Some(event_rx)),
            inbound_task,
        })
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    /// Our remote identifier on the transport.
    pub fn node_id(&self) -> NodeId {
        self.endpoint.node_id()
    }

    /// Our KEM key fingerprint.
    pub fn key_id(&self) -> KeyId {
        self.identity.key_id
    }

    /// Snapshot of all currently known peers.
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.table.all()
    }

    /// Snapshot of one peer.
    pub fn peer(&self, nickname: &str) -> Option<PeerInfo> {
        self.table.get(nickname)
    }

    /// Nicknames with a live outbound session.
    pub fn active_sessions(&self) -> Vec<String> {
        self.pool.active_sessions()
    }

    /// Take the event stream. Yields `None` after the first call.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<MessengerEvent>> {
        self.events.lock().expect("events lock poisoned").take()
    }

    /// Send a sealed request to a known peer and return the opened
    /// reply.
    pub async fn send_to(&self, nickname: &str, text: &str) -> Result<String, MessengerError> {
        let peer = self
            .table
            .get(nickname)
            .ok_or_else(|| MessengerError::UnknownPeer(nickname.to_string()))?;
        Ok(self.pool.send_request(&peer, text).await?)
    }

    /// Fan a message out to every known peer; waits for all deliveries
    /// and returns the first failure, if any.
    pub async fn broadcast(&self, text: &str) -> Result<(), MessengerError> {
        Ok(self.pool.broadcast(text).await?)
    }

    /// Dial every known peer once so they see us online. Per-peer
    /// failures are ignored.
    pub async fn announce_presence(&self) {
        self.pool.announce_presence().await;
    }

    /// Orderly shutdown: Goodbye on every live session, then close
    /// discovery streams and stop serving inbound sessions.
    pub async fn shutdown(&self) {
        self.pool.announce_disconnection().await;
        self.discovery.close();
        self.inbound_task.abort();
        info!(nickname = %self.nickname, "messenger stopped");
    }
}

impl Drop for Messenger {
    fn drop(&mut self) {
        self.inbound_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use std::time::Duration;

    async fn messenger_via(node_ticket: &str, seed: u8, nickname: &str, token: &str) -> Messenger {
        let config =
            MessengerConfig::for_testing(testing::test_seed(seed), nickname, token)
                .with_nodes(vec![node_ticket.to_string()]);
        Messenger::start(config).await.unwrap()
    }

    async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_two_peers_exchange_messages() {
        let node = testing::test_node(30, &[("alice", "t-a"), ("bob", "t-b")]).await;
        let ticket = node.ticket().await.unwrap();

        let alice = messenger_via(&ticket, 31, "alice", "t-a").await;
        let bob = messenger_via(&ticket, 32, "bob", "t-b").await;
        let mut bob_events = bob.events().unwrap();

        // Alice learns about bob through the node's push.
        wait_until("alice to see bob", || alice.peer("bob").is_some()).await;

        let reply = alice.send_to("bob", "hi bob").await.unwrap();
        assert_eq!(reply, "message received");

        // Bob's responder surfaced the plaintext as a direct message.
        let event = tokio::time::timeout(Duration::from_secs(5), bob_events.recv())
            .await
            .unwrap()
            .unwrap();
        let mut seen = vec![event];
        while let Ok(event) = bob_events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&MessengerEvent::DirectMessage {
            from: "alice".to_string(),
            text: "hi bob".to_string(),
        }));

        alice.shutdown().await;
        bob.shutdown().await;
        node.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_broadcast_reaches_all_peers() {
        let node =
            testing::test_node(33, &[("alice", "t-a"), ("bob", "t-b"), ("carol", "t-c")]).await;
        let ticket = node.ticket().await.unwrap();

        let alice = messenger_via(&ticket, 34, "alice", "t-a").await;
        let bob = messenger_via(&ticket, 35, "bob", "t-b").await;
        let carol = messenger_via(&ticket, 36, "carol", "t-c").await;

        let mut bob_events = bob.events().unwrap();
        let mut carol_events = carol.events().unwrap();

        wait_until("alice to see both peers", || {
            alice.peer("bob").is_some() && alice.peer("carol").is_some()
        })
        .await;

        // Pre-establish sessions; the broadcast then reuses them.
        alice.announce_presence().await;
        assert_eq!(alice.active_sessions().len(), 2);

        alice.broadcast("all hands").await.unwrap();

        for (name, events) in [("bob", &mut bob_events), ("carol", &mut carol_events)] {
            let mut found = false;
            for _ in 0..10 {
                match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
                    Ok(Some(MessengerEvent::Broadcast { from, text })) => {
                        assert_eq!(from, "alice");
                        assert_eq!(text, "all hands");
                        found = true;
                        break;
                    }
                    Ok(Some(_)) => continue,
                    _ => break,
                }
            }
            assert!(found, "{} missed the broadcast", name);
        }

        alice.shutdown().await;
        bob.shutdown().await;
        carol.shutdown().await;
        node.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_goodbye_tears_down_mirror_session() {
        let node = testing::test_node(37, &[("alice", "t-a"), ("bob", "t-b")]).await;
        let ticket = node.ticket().await.unwrap();

        let alice = messenger_via(&ticket, 38, "alice", "t-a").await;
        let bob = messenger_via(&ticket, 39, "bob", "t-b").await;

        wait_until("roster convergence", || {
            alice.peer("bob").is_some() && bob.peer("alice").is_some()
        })
        .await;

        // Both directions get a session.
        alice.send_to("bob", "ping").await.unwrap();
        bob.send_to("alice", "pong").await.unwrap();
        assert_eq!(alice.active_sessions(), vec!["bob".to_string()]);
        assert_eq!(bob.active_sessions(), vec!["alice".to_string()]);

        // Alice's shutdown sends Goodbye; bob must drop his mirror
        // session to alice.
        alice.shutdown().await;
        wait_until("bob to drop his session to alice", || {
            bob.active_sessions().is_empty()
        })
        .await;

        bob.shutdown().await;
        node.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unknown_peer_is_an_error() {
        let node = testing::test_node(40, &[("alice", "t-a")]).await;
        let ticket = node.ticket().await.unwrap();
        let alice = messenger_via(&ticket, 41, "alice", "t-a").await;

        match alice.send_to("nobody", "hello?").await {
            Err(MessengerError::UnknownPeer(nick)) => assert_eq!(nick, "nobody"),
            other => panic!("unexpected result: {:?}", other),
        }

        alice.shutdown().await;
        node.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_registration_with_bad_token_fails() {
        let node = testing::test_node(42, &[("alice", "t-a")]).await;
        let ticket = node.ticket().await.unwrap();

        let config =
            MessengerConfig::for_testing(testing::test_seed(43), "alice", "wrong")
                .with_nodes(vec![ticket]);
        match Messenger::start(config).await {
            Err(MessengerError::Discovery(_)) => {}
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }

        node.shutdown();
    }
}
