//! Test utilities.
//!
//! Deterministic identities from patterned seeds and loopback endpoints
//! with the relay disabled, so tests exercise the real transport without
//! leaving the machine.

use std::collections::HashMap;

use iroh::{Endpoint, RelayMode};

use crate::network::discovery::server::NodeServer;
use crate::protocol::config::NodeConfig;
use crate::security::identity::{derive, DerivedKeys};

/// A seed filled with one byte value.
pub fn test_seed(byte: u8) -> [u8; 32] {
    [byte; 32]
}

/// Deterministic identity for tests.
pub fn test_identity(byte: u8) -> DerivedKeys {
    derive(&test_seed(byte)).expect("test seed has the right length")
}

/// Endpoint bound to loopback-reachable sockets with no relay.
pub async fn test_endpoint(identity: &DerivedKeys, alpns: Vec<Vec<u8>>) -> Endpoint {
    Endpoint::builder()
        .secret_key(identity.transport.clone())
        .alpns(alpns)
        .relay_mode(RelayMode::Disabled)
        .bind()
        .await
        .expect("failed to bind test endpoint")
}

/// Node config for tests: given nickname/token pairs, no relay.
pub fn test_node_config(peers: &[(&str, &str)]) -> NodeConfig {
    NodeConfig {
        listen: None,
        peers: peers
            .iter()
            .map(|(nick, token)| (nick.to_string(), token.to_string()))
            .collect::<HashMap<String, String>>(),
        disable_relay: true,
    }
}

/// Running discovery node for tests.
pub async fn test_node(seed: u8, peers: &[(&str, &str)]) -> NodeServer {
    let identity = test_identity(seed);
    NodeServer::start(&identity, test_node_config(peers))
        .await
        .expect("failed to start test node")
}
