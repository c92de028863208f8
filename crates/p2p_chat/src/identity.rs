//! Peer identity: unique node identification.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A unique identifier for a peer node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    /// Generate a new random peer ID (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Create a PeerId from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Return the inner string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The identity of a node on the network. Created once per process and
/// never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerIdentity {
    /// Unique peer identifier.
    pub id: PeerId,
    /// Human-readable name shown to other peers (e.g. the device name).
    pub display_name: String,
}

impl PeerIdentity {
    /// Create a new identity with a fresh PeerId.
    pub fn generate(display_name: impl Into<String>) -> Self {
        Self {
            id: PeerId::generate(),
            display_name: display_name.into(),
        }
    }

    /// Create an identity with a known id.
    pub fn new(id: PeerId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
        }
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, self.id)
    }
}
