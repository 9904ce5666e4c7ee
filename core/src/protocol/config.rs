//! Configuration for messengers and discovery nodes.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::network::session::incoming::ReplyProvider;
use crate::protocol::error::MessengerError;
use crate::security::identity::SEED_LEN;

/// Configuration for [`crate::protocol::Messenger`].
#[derive(Clone)]
pub struct MessengerConfig {
    /// 32-byte identity seed.
    pub seed: [u8; SEED_LEN],
    /// Nickname to register under.
    pub nickname: String,
    /// Shared token expected by the discovery nodes for this nickname.
    pub token: String,
    /// Discovery node addresses (see
    /// [`crate::network::discovery::client::parse_node_ticket`]).
    pub nodes: Vec<String>,
    /// Optional UDP bind address; random port when unset.
    pub bind_addr: Option<SocketAddrV4>,
    /// Disable the transport relay; loopback/direct connectivity only.
    pub disable_relay: bool,
    /// Application reply hook for the responder. Defaults to the fixed
    /// acknowledgement.
    pub reply: Option<Arc<dyn ReplyProvider>>,
}

impl MessengerConfig {
    pub fn new(seed: [u8; SEED_LEN], nickname: &str, token: &str) -> Self {
        Self {
            seed,
            nickname: nickname.to_string(),
            token: token.to_string(),
            nodes: Vec::new(),
            bind_addr: None,
            disable_relay: false,
            reply: None,
        }
    }

    pub fn with_nodes(mut self, nodes: Vec<String>) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn with_reply_provider(mut self, reply: Arc<dyn ReplyProvider>) -> Self {
        self.reply = Some(reply);
        self
    }

    /// Loopback-only configuration for tests.
    pub fn for_testing(seed: [u8; SEED_LEN], nickname: &str, token: &str) -> Self {
        let mut config = Self::new(seed, nickname, token);
        config.disable_relay = true;
        config
    }
}

impl std::fmt::Debug for MessengerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessengerConfig")
            .field("seed", &"[REDACTED]")
            .field("nickname", &self.nickname)
            .field("token", &"[REDACTED]")
            .field("nodes", &self.nodes)
            .field("bind_addr", &self.bind_addr)
            .field("disable_relay", &self.disable_relay)
            .finish()
    }
}

/// Discovery node configuration, loaded from a JSON file:
///
/// ```json
/// { "listen": "0.0.0.0:9200", "peers": { "alice": "t-a" } }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Optional UDP bind address; random port when unset.
    #[serde(default)]
    pub listen: Option<String>,
    /// Authorized nicknames and their shared tokens.
    pub peers: HashMap<String, String>,
    /// Disable the transport relay; loopback/direct connectivity only.
    #[serde(default)]
    pub disable_relay: bool,
}

impl NodeConfig {
    /// Load the config from a JSON file.
    pub fn load(path: &Path) -> Result<Self, MessengerError> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| MessengerError::Config(format!("read config: {}", e)))?;
        serde_json::from_str(&data)
            .map_err(|e| MessengerError::Config(format!("parse config: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_config_parses_documented_shape() {
        let json = r#"{ "listen": "0.0.0.0:9200", "peers": { "alice": "t-a", "bob": "t-b" } }"#;
        let config: NodeConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.listen.as_deref(), Some("0.0.0.0:9200"));
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.peers["alice"], "t-a");
        assert!(!config.disable_relay);
    }

    #[test]
    fn test_node_config_listen_optional() {
        let json = r#"{ "peers": {} }"#;
        let config: NodeConfig = serde_json::from_str(json).unwrap();
        assert!(config.listen.is_none());
    }

    #[test]
    fn test_node_config_load_rejects_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(&path, "{ not json").unwrap();

        match NodeConfig::load(&path) {
            Err(MessengerError::Config(_)) => {}
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_messenger_config_debug_redacts_secrets() {
        let config = MessengerConfig::new([7u8; 32], "alice", "t-a");
        let debug_output = format!("{:?}", config);

        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("t-a"));
    }
}
