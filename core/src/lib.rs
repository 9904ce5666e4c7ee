//! Skein Core
//!
//! A small peer-to-peer encrypted messaging fabric. Peers derive all of
//! their long-term keys from a single 32-byte seed, register with
//! token-gated discovery nodes to learn who else is online, and open
//! direct end-to-end encrypted sessions to one another, multiplexing
//! request/response messages over one stream per peer pair.
//!
//! # Module Structure
//!
//! - `protocol/`: public interface (Messenger, config, errors, events)
//! - `network/`: wire framing, discovery protocol, session protocol
//! - `security/`: identity derivation and the message envelope
//! - `data/`: shared peer table
//! - `testing/`: test utilities
//!
//! # Quick Start
//!
//! ```ignore
//! use skein_core::{Messenger, MessengerConfig};
//!
//! let seed = skein_core::security::identity::load_seed("seed.key".as_ref())?;
//! let config = MessengerConfig::new(seed, "alice", "t-a")
//!     .with_nodes(vec![node_ticket]);
//! let messenger = Messenger::start(config).await?;
//!
//! let reply = messenger.send_to("bob", "hello").await?;
//!
//! let mut events = messenger.events().unwrap();
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! ```

// Public interface
pub mod protocol;

// Infrastructure modules
pub mod data;
pub mod network;
pub mod security;
pub mod testing;

// Re-export main API types for convenience
pub use network::discovery::client::{DiscoveryClient, PeerHandler, TrackedPeer};
pub use network::discovery::server::NodeServer;
pub use network::discovery::protocol::PeerInfo;
pub use network::discovery::DiscoveryError;
pub use network::session::incoming::{FixedReply, ReplyProvider};
pub use network::session::SessionError;
pub use protocol::{Messenger, MessengerConfig, MessengerError, MessengerEvent, NodeConfig};
pub use security::identity::{DerivedKeys, IdentityError, KeyId};
