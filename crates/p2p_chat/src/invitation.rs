//! Invitation handshake: the invitee side of joining a session.
//!
//! The transport hands the node an [`Invitation`] carrying a one-shot
//! responder. [`InvitationHandshake`] keeps at most one pending invitation
//! per inviting peer until it is accepted, declined, or lapses.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::error::NetworkError;
use crate::identity::{PeerId, PeerIdentity};

/// An invitation from a remote peer to join its session.
#[derive(Debug)]
pub struct Invitation {
    /// The inviting peer.
    pub from: PeerIdentity,
    /// Opaque bytes the inviter attached.
    pub context: Option<Vec<u8>>,
    responder: oneshot::Sender<bool>,
}

impl Invitation {
    /// Create an invitation and the receiver its answer arrives on.
    pub fn new(from: PeerIdentity, context: Option<Vec<u8>>) -> (Self, oneshot::Receiver<bool>) {
        let (responder, answer) = oneshot::channel();
        (
            Self {
                from,
                context,
                responder,
            },
            answer,
        )
    }

    /// Answer the invitation. Returns `false` if the transport stopped
    /// waiting for an answer.
    pub fn respond(self, accept: bool) -> bool {
        self.responder.send(accept).is_ok()
    }

    /// Whether the transport has given up on this invitation.
    pub fn is_abandoned(&self) -> bool {
        self.responder.is_closed()
    }
}

/// Result of receiving an invitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Stored; waiting for a decision.
    Pending,
    /// The peer already has one pending; this one was declined.
    Duplicate,
}

#[derive(Debug)]
struct PendingInvitation {
    invitation: Invitation,
    expires_at: Instant,
}

/// Pending invitations keyed by inviting peer.
#[derive(Debug)]
pub struct InvitationHandshake {
    timeout: Duration,
    pending: BTreeMap<PeerId, PendingInvitation>,
}

impl InvitationHandshake {
    /// Invitations not answered within `timeout` lapse.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            pending: BTreeMap::new(),
        }
    }

    /// Surface a new invitation. A second invitation from a peer that
    /// already has one pending is declined on the spot.
    pub fn receive(&mut self, invitation: Invitation, now: Instant) -> ReceiveOutcome {
        let from = invitation.from.id.clone();
        if self.pending.contains_key(&from) {
            debug!("Declining duplicate invitation from {}", invitation.from);
            invitation.respond(false);
            return ReceiveOutcome::Duplicate;
        }

        info!("Invitation from {}", invitation.from);
        self.pending.insert(
            from,
            PendingInvitation {
                invitation,
                expires_at: now + self.timeout,
            },
        );
        ReceiveOutcome::Pending
    }

    /// Accept the pending invitation from `peer_id`.
    pub fn accept(&mut self, peer_id: &PeerId) -> Result<PeerIdentity, NetworkError> {
        self.resolve(peer_id, true)
    }

    /// Decline the pending invitation from `peer_id`.
    pub fn decline(&mut self, peer_id: &PeerId) -> Result<PeerIdentity, NetworkError> {
        self.resolve(peer_id, false)
    }

    fn resolve(&mut self, peer_id: &PeerId, accept: bool) -> Result<PeerIdentity, NetworkError> {
        let pending = self
            .pending
            .remove(peer_id)
            .ok_or_else(|| NetworkError::UnknownPeer(peer_id.to_string()))?;
        let from = pending.invitation.from.clone();
        if !pending.invitation.respond(accept) {
            return Err(NetworkError::Timeout(self.timeout));
        }
        info!(
            "{} invitation from {from}",
            if accept { "Accepted" } else { "Declined" }
        );
        Ok(from)
    }

    /// Drop the pending invitation from `peer_id` without answering.
    pub fn withdraw(&mut self, peer_id: &PeerId) -> Option<PeerIdentity> {
        self.pending
            .remove(peer_id)
            .map(|pending| pending.invitation.from)
    }

    /// Remove invitations past their deadline or abandoned by the
    /// transport. Returns the peers whose invitations lapsed.
    pub fn expire(&mut self, now: Instant) -> Vec<PeerIdentity> {
        let lapsed: Vec<PeerId> = self
            .pending
            .iter()
            .filter(|(_, p)| now >= p.expires_at || p.invitation.is_abandoned())
            .map(|(id, _)| id.clone())
            .collect();

        lapsed
            .into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .map(|pending| {
                debug!("Invitation from {} lapsed", pending.invitation.from);
                pending.invitation.from
            })
            .collect()
    }

    /// Decline every pending invitation.
    pub fn decline_all(&mut self) -> Vec<PeerIdentity> {
        std::mem::take(&mut self.pending)
            .into_values()
            .map(|pending| {
                let from = pending.invitation.from.clone();
                pending.invitation.respond(false);
                from
            })
            .collect()
    }

    /// The inviting peer's identity, if it has an invitation pending.
    pub fn get(&self, peer_id: &PeerId) -> Option<&PeerIdentity> {
        self.pending.get(peer_id).map(|p| &p.invitation.from)
    }

    pub fn is_pending(&self, peer_id: &PeerId) -> bool {
        self.pending.contains_key(peer_id)
    }

    /// Peers with an invitation awaiting a decision.
    pub fn pending(&self) -> Vec<PeerIdentity> {
        self.pending
            .values()
            .map(|p| p.invitation.from.clone())
            .collect()
    }
}
