//! Peer/node discovery.
//!
//! Discovery nodes ([`server`]) hold the set of currently online peers
//! for a fixed roster of authorized nicknames and push join/leave events
//! to every registered peer. The [`client`] registers with one or more
//! nodes in parallel and merges their rosters into a single tracked view.
//! [`protocol`] defines the shared wire format.

pub mod client;
pub mod protocol;
pub mod server;

use crate::network::wire::WireError;

/// Errors from the discovery layer.
#[derive(Debug)]
pub enum DiscoveryError {
    /// Endpoint could not be created or bound.
    Bind(String),
    /// A node address string could not be parsed.
    BadAddress(String),
    /// Dial, read or write failure on the transport.
    Transport(String),
    /// The node rejected our Register; carries the wire reason.
    Registration(String),
    /// A message arrived out of protocol order.
    Unexpected(String),
    /// Malformed or unreadable frame.
    Wire(WireError),
    /// One node's connect attempt timed out.
    Timeout(String),
    /// `connect_all` reached no node at all; carries the first error.
    NoNodesReached(String),
}

impl std::fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscoveryError::Bind(e) => write!(f, "failed to bind endpoint: {}", e),
            DiscoveryError::BadAddress(e) => write!(f, "bad node address: {}", e),
            DiscoveryError::Transport(e) => write!(f, "transport error: {}", e),
            DiscoveryError::Registration(e) => write!(f, "registration failed: {}", e),
            DiscoveryError::Unexpected(e) => write!(f, "protocol violation: {}", e),
            DiscoveryError::Wire(e) => write!(f, "{}", e),
            DiscoveryError::Timeout(addr) => write!(f, "node {} timed out", addr),
            DiscoveryError::NoNodesReached(e) => {
                write!(f, "failed to connect to any node: {}", e)
            }
        }
    }
}

impl std::error::Error for DiscoveryError {}

impl From<WireError> for DiscoveryError {
    fn from(e: WireError) -> Self {
        DiscoveryError::Wire(e)
    }
}
