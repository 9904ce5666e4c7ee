//! Top-level errors for the messenger API.

use crate::network::discovery::DiscoveryError;
use crate::network::session::SessionError;
use crate::security::identity::IdentityError;

/// Errors surfaced by [`crate::protocol::Messenger`].
#[derive(Debug)]
pub enum MessengerError {
    /// Seed or key derivation failure.
    Identity(IdentityError),
    /// Discovery layer failure.
    Discovery(DiscoveryError),
    /// Session layer failure.
    Session(SessionError),
    /// Configuration file failure.
    Config(String),
    /// Endpoint could not be created.
    StartFailed(String),
    /// The nickname is not in the tracked roster.
    UnknownPeer(String),
}

impl std::fmt::Display for MessengerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessengerError::Identity(e) => write!(f, "{}", e),
            MessengerError::Discovery(e) => write!(f, "{}", e),
            MessengerError::Session(e) => write!(f, "{}", e),
            MessengerError::Config(e) => write!(f, "config error: {}", e),
            MessengerError::StartFailed(e) => write!(f, "failed to start messenger: {}", e),
            MessengerError::UnknownPeer(nick) => write!(f, "unknown peer: {}", nick),
        }
    }
}

impl std::error::Error for MessengerError {}

impl From<IdentityError> for MessengerError {
    fn from(e: IdentityError) -> Self {
        MessengerError::Identity(e)
    }
}

impl From<DiscoveryError> for MessengerError {
    fn from(e: DiscoveryError) -> Self {
        MessengerError::Discovery(e)
    }
}

impl From<SessionError> for MessengerError {
    fn from(e: SessionError) -> Self {
        MessengerError::Session(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = MessengerError::UnknownPeer("mallory".to_string());
        assert_eq!(err.to_string(), "unknown peer: mallory");

        let err = MessengerError::Config("bad json".to_string());
        assert_eq!(err.to_string(), "config error: bad json");

        let err: MessengerError = SessionError::ConnectionClosed.into();
        assert_eq!(err.to_string(), "connection closed");
    }

    #[test]
    fn test_is_error_trait() {
        let err: Box<dyn std::error::Error> =
            Box::new(MessengerError::StartFailed("no endpoint".to_string()));
        assert!(!err.to_string().is_empty());
    }
}
