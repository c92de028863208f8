//! Message channel: text messages over an established session.
//!
//! Payloads on the wire are plain UTF-8 text. The channel keeps the ordered
//! log of what was sent and received; entries are never edited, and the
//! whole log is dropped when the session ends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::NetworkError;
use crate::identity::PeerIdentity;
use crate::session::Session;
use crate::transport::{SendMode, Transport};

/// Who wrote a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "peer")]
pub enum MessageOrigin {
    /// Sent by this node.
    Local,
    /// Received from a session peer.
    Remote(PeerIdentity),
}

/// One entry in the message log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier (UUID v4).
    pub id: String,
    /// Message text; never empty.
    pub text: String,
    pub origin: MessageOrigin,
    /// When the message entered the log.
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn new(text: String, origin: MessageOrigin) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text,
            origin,
            timestamp: Utc::now(),
        }
    }

    /// Whether this node sent the message.
    pub fn is_local(&self) -> bool {
        self.origin == MessageOrigin::Local
    }
}

/// Encode text as a wire payload.
pub fn encode_text(text: &str) -> Vec<u8> {
    text.as_bytes().to_vec()
}

/// Decode a wire payload as text.
pub fn decode_text(bytes: &[u8]) -> Result<String, NetworkError> {
    String::from_utf8(bytes.to_vec()).map_err(|e| NetworkError::Decode(e.to_string()))
}

/// Ordered, append-only log of sent and received messages.
#[derive(Debug, Default)]
pub struct MessageChannel {
    log: Vec<Message>,
}

impl MessageChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send `text` to every connected peer and log it once the transport
    /// has taken it. Nothing is logged if validation or the transport fails.
    pub fn send(
        &mut self,
        text: &str,
        session: &Session,
        transport: &dyn Transport,
    ) -> Result<Message, NetworkError> {
        if text.is_empty() {
            return Err(NetworkError::EmptyMessage);
        }
        if session.is_empty() {
            return Err(NetworkError::NoConnectedPeers);
        }

        let peers = session.connected_ids();
        transport
            .send(&encode_text(text), &peers, SendMode::Reliable)
            .inspect_err(|e| warn!("Send to {} peer(s) failed: {e}", peers.len()))?;

        Ok(self.append(Message::new(text.to_string(), MessageOrigin::Local)))
    }

    /// Log a payload received from `from`. Undecodable or empty payloads
    /// are dropped.
    pub fn receive(&mut self, bytes: &[u8], from: &PeerIdentity) -> Option<Message> {
        let text = match decode_text(bytes) {
            Ok(text) => text,
            Err(e) => {
                debug!("Dropping payload from {from}: {e}");
                return None;
            }
        };
        if text.is_empty() {
            debug!("Dropping empty payload from {from}");
            return None;
        }

        Some(self.append(Message::new(text, MessageOrigin::Remote(from.clone()))))
    }

    fn append(&mut self, message: Message) -> Message {
        self.log.push(message.clone());
        message
    }

    pub fn messages(&self) -> &[Message] {
        &self.log
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    pub fn clear(&mut self) {
        self.log.clear();
    }
}
