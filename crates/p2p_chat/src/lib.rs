//! P2P Chat: serverless text chat between nearby peers.
//!
//! Peers find each other on the local network, one invites the other into a
//! session, and both exchange short text messages until either side leaves.
//!
//! # Architecture
//!
//! - **State machine**: [`ConnectionStateMachine`] drives discovery, the
//!   invitation handshake, the session and the message log. It is owned by a
//!   single task, so every input is applied in order.
//! - **Node**: [`ChatNode`] runs that task and hands out [`ChatHandle`]s for
//!   the UI: async requests, a watchable [`Snapshot`], and [`NodeEvent`]s.
//! - **Transport**: anything implementing [`Transport`]. The LAN transport
//!   uses UDP broadcast for discovery and WebSocket links (via
//!   `tokio-tungstenite`) for sessions; the memory transport connects nodes
//!   in one process.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use p2p_chat::transport::{event_channel, lan::LanTransport};
//! use p2p_chat::{ChatConfig, ChatNode, ConnectionState, PeerIdentity};
//!
//! # async fn example() -> Result<(), p2p_chat::NetworkError> {
//! let identity = PeerIdentity::generate("my-laptop");
//! let config = ChatConfig::default();
//! let (events_tx, events_rx) = event_channel(config.event_queue_capacity);
//! let transport = LanTransport::new(identity.clone(), config.lan.clone(), events_tx);
//!
//! let mut node = ChatNode::new(identity, config);
//! let handle = node.start(Arc::new(transport), events_rx)?;
//!
//! handle.request_browse().await?;
//! handle
//!     .wait_for(|s| matches!(s.state, ConnectionState::Connected(_)))
//!     .await?;
//! handle.send_message("hello").await?;
//!
//! node.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod invitation;
pub mod logging;
pub mod machine;
pub mod node;
pub mod session;
pub mod state;
pub mod transport;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use channel::{Message, MessageOrigin};
pub use config::{ChatConfig, LanConfig};
pub use discovery::DiscoveredPeer;
pub use error::NetworkError;
pub use identity::{PeerId, PeerIdentity};
pub use invitation::Invitation;
pub use machine::{ConnectionStateMachine, InvitationOutcome, NodeEvent};
pub use node::{ChatHandle, ChatNode, Snapshot};
pub use session::PeerSessionState;
pub use state::{ConnectionState, PrimaryAction, StatusView};
pub use transport::{SendMode, Transport, TransportEvent};
