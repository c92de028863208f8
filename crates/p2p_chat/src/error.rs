//! Network and chat error types.

use std::time::Duration;

/// Errors that can occur in the p2p_chat crate.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// Attempted to send a message with no text.
    #[error("Message is empty")]
    EmptyMessage,

    /// Attempted to send while no peer is in the session.
    #[error("No connected peers")]
    NoConnectedPeers,

    /// A transport-level error (connect/send/receive).
    #[error("Transport error: {0}")]
    Transport(String),

    /// A received payload could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Discovery subsystem error.
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// The configured service type is not a valid service identifier.
    #[error("Invalid service type: {0}")]
    InvalidServiceType(String),

    /// The referenced peer is unknown to the session or handshake.
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    /// A configuration value the node cannot run with.
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// The request is not allowed in the current connection state.
    #[error("Not allowed while {0}")]
    InvalidState(String),

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An operation timed out.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// The node is not running.
    #[error("Node not running")]
    NotRunning,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetworkError {
    /// Whether this error was caught by local validation before anything
    /// reached the transport.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::EmptyMessage | Self::NoConnectedPeers | Self::InvalidState(_)
        )
    }
}
