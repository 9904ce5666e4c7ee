//! Peer-to-peer session layer.
//!
//! One authenticated stream per peer pair, reused for many multiplexed
//! request/response exchanges. The initiator side lives in [`pool`] and
//! [`session`]; the responder side in [`incoming`]; the wire format and
//! handshake verification in [`protocol`].

pub mod incoming;
pub mod pool;
pub mod protocol;
pub mod session;

use crate::network::wire::WireError;
use crate::security::envelope::EnvelopeError;

/// Errors from the session layer.
#[derive(Debug)]
pub enum SessionError {
    /// Malformed or unreadable frame.
    Wire(WireError),
    /// Protocol violation during the Challenge/Hello exchange.
    Handshake(String),
    /// Hello signature invalid, or identity disagrees with the roster.
    IdentityMismatch(String),
    /// Request addressed to a different recipient KeyId.
    WrongRecipient,
    /// Envelope seal/open failure.
    Envelope(EnvelopeError),
    /// Dial, read or write failure on the transport.
    Transport(String),
    /// The session died while a request was outstanding.
    ConnectionClosed,
    /// A broadcast fan-out failed for at least one peer.
    Broadcast(String),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Wire(e) => write!(f, "{}", e),
            SessionError::Handshake(e) => write!(f, "handshake failed: {}", e),
            SessionError::IdentityMismatch(e) => write!(f, "identity mismatch: {}", e),
            SessionError::WrongRecipient => write!(f, "request for a different recipient"),
            SessionError::Envelope(e) => write!(f, "{}", e),
            SessionError::Transport(e) => write!(f, "transport error: {}", e),
            SessionError::ConnectionClosed => write!(f, "connection closed"),
            SessionError::Broadcast(e) => write!(f, "broadcast failed: {}", e),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<WireError> for SessionError {
    fn from(e: WireError) -> Self {
        SessionError::Wire(e)
    }
}

impl From<EnvelopeError> for SessionError {
    fn from(e: EnvelopeError) -> Self {
        SessionError::Envelope(e)
    }
}
