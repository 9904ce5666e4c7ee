//! Events surfaced to the embedding application.

use std::sync::Arc;

use iroh::NodeId;
use tokio::sync::mpsc;
use tracing::trace;

use crate::data::peer_table::PeerTable;
use crate::network::discovery::client::PeerHandler;
use crate::network::discovery::protocol::PeerInfo;
use crate::network::session::pool::SessionPool;

/// What the messenger reports upward. The UI drains these from
/// [`crate::protocol::Messenger::events`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessengerEvent {
    /// A sealed request addressed to us alone.
    DirectMessage { from: String, text: String },
    /// A fan-out notification (the `[BROADCAST]` prefix is stripped).
    Broadcast { from: String, text: String },
    /// A node reported this peer online.
    PeerJoined { nickname: String },
    /// A node reported this peer gone.
    PeerLeft { nickname: String },
    /// Registered with a discovery node.
    NodeConnected { node_id: NodeId },
    /// Lost a discovery node.
    NodeDisconnected { node_id: NodeId },
}

/// Bridges discovery callbacks into the peer table, session pool and
/// event stream. The discovery client already maintains the table; the
/// bridge reacts to membership changes and forwards events.
pub(crate) struct EventBridge {
    pub(crate) table: PeerTable,
    pub(crate) pool: Arc<SessionPool>,
    pub(crate) events: mpsc::UnboundedSender<MessengerEvent>,
}

impl EventBridge {
    fn emit(&self, event: MessengerEvent) {
        if self.events.send(event).is_err() {
            trace!("event channel closed, dropping event");
        }
    }
}

impl PeerHandler for EventBridge {
    fn on_peer_joined(&self, peer: &PeerInfo, _node_id: NodeId) {
        self.emit(MessengerEvent::PeerJoined {
            nickname: peer.nickname.clone(),
        });
    }

    fn on_peer_left(&self, nickname: &str, _node_id: NodeId) {
        // Tear the session down only when no node reports the peer
        // anymore; a peer leaving one of several nodes is still online.
        if self.table.get(nickname).is_none() {
            self.pool.remove_session(nickname);
        }
        self.emit(MessengerEvent::PeerLeft {
            nickname: nickname.to_string(),
        });
    }

    fn on_node_connected(&self, node_id: NodeId) {
        self.emit(MessengerEvent::NodeConnected { node_id });
    }

    fn on_node_disconnected(&self, node_id: NodeId) {
        self.emit(MessengerEvent::NodeDisconnected { node_id });
    }
}
