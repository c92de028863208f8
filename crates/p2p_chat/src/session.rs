//! Session: the local node's view of its connected peers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::{PeerId, PeerIdentity};

/// Per-peer session state as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerSessionState {
    /// The peer left the session or never made it in.
    NotConnected,
    /// The peer is joining the session.
    Connecting,
    /// The peer has fully joined.
    Connected,
}

/// A peer that has joined the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionPeer {
    pub identity: PeerIdentity,
    pub connected_at: DateTime<Utc>,
}

/// The set of peers joining or joined to the local session.
///
/// Only the node's sequencing loop mutates a `Session`.
#[derive(Debug)]
pub struct Session {
    local: PeerIdentity,
    connecting: BTreeMap<PeerId, PeerIdentity>,
    connected: BTreeMap<PeerId, SessionPeer>,
    last_joined: Option<PeerId>,
}

impl Session {
    /// Create an empty session for the local identity.
    pub fn new(local: PeerIdentity) -> Self {
        Self {
            local,
            connecting: BTreeMap::new(),
            connected: BTreeMap::new(),
            last_joined: None,
        }
    }

    /// The local node's identity.
    pub fn local(&self) -> &PeerIdentity {
        &self.local
    }

    /// Apply a transport-reported state change for a peer.
    pub fn update(&mut self, peer: &PeerIdentity, state: PeerSessionState) {
        match state {
            PeerSessionState::Connecting => {
                if !self.connected.contains_key(&peer.id) {
                    self.connecting.insert(peer.id.clone(), peer.clone());
                }
            }
            PeerSessionState::Connected => {
                self.connecting.remove(&peer.id);
                self.connected.insert(
                    peer.id.clone(),
                    SessionPeer {
                        identity: peer.clone(),
                        connected_at: Utc::now(),
                    },
                );
                self.last_joined = Some(peer.id.clone());
            }
            PeerSessionState::NotConnected => {
                self.connecting.remove(&peer.id);
                self.connected.remove(&peer.id);
                if self.last_joined.as_ref() == Some(&peer.id) {
                    self.last_joined = self.latest_connected();
                }
            }
        }
    }

    /// Whether the peer is joining or joined.
    pub fn involves(&self, peer_id: &PeerId) -> bool {
        self.connecting.contains_key(peer_id) || self.connected.contains_key(peer_id)
    }

    /// Whether the peer has fully joined.
    pub fn is_connected(&self, peer_id: &PeerId) -> bool {
        self.connected.contains_key(peer_id)
    }

    /// Whether no peer has joined.
    pub fn is_empty(&self) -> bool {
        self.connected.is_empty()
    }

    /// Whether any peer is still joining.
    pub fn has_connecting(&self) -> bool {
        !self.connecting.is_empty()
    }

    /// Ids of all joined peers, in stable order.
    pub fn connected_ids(&self) -> Vec<PeerId> {
        self.connected.keys().cloned().collect()
    }

    /// Identities of all joined peers.
    pub fn connected_peers(&self) -> Vec<PeerIdentity> {
        self.connected.values().map(|p| p.identity.clone()).collect()
    }

    /// Number of joined peers.
    pub fn connected_count(&self) -> usize {
        self.connected.len()
    }

    /// The most recently joined peer still in the session.
    pub fn last_joined(&self) -> Option<&PeerIdentity> {
        self.last_joined
            .as_ref()
            .and_then(|id| self.connected.get(id))
            .map(|p| &p.identity)
    }

    /// Drop every peer from the session.
    pub fn clear(&mut self) {
        self.connecting.clear();
        self.connected.clear();
        self.last_joined = None;
    }

    fn latest_connected(&self) -> Option<PeerId> {
        self.connected
            .values()
            .max_by_key(|p| p.connected_at)
            .map(|p| p.identity.id.clone())
    }
}
