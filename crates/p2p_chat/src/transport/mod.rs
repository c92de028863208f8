//! Transport abstraction: the networking layer underneath a chat node.
//!
//! A [`Transport`] takes requests (browse, advertise, invite, send,
//! disconnect) without blocking and reports what happens later as
//! [`TransportEvent`]s on a bounded mpsc channel. Events may be produced on
//! any task; the node's sequencing loop is their only consumer.
//!
//! Implementations:
//! - [`memory::MemoryNetwork`]: in-process hub, used by tests and embedders.
//! - [`lan::LanTransport`]: UDP broadcast discovery plus WebSocket links.

pub mod lan;
pub mod memory;

use std::time::Duration;

use tokio::sync::mpsc;

use crate::discovery::DiscoveredPeer;
use crate::error::NetworkError;
use crate::identity::{PeerId, PeerIdentity};
use crate::invitation::Invitation;
use crate::session::PeerSessionState;

/// Delivery guarantee requested for a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// At-least-once, in order per sender.
    Reliable,
    /// Best effort.
    Unreliable,
}

/// An event reported by the transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// The browser found a peer advertising the same service.
    PeerFound(DiscoveredPeer),
    /// A previously found peer stopped advertising or went away.
    PeerLost(PeerId),
    /// A peer invited us into its session. Resolve it with
    /// [`Invitation::respond`].
    InvitationReceived(Invitation),
    /// A peer's session state changed.
    SessionStateChanged {
        peer: PeerIdentity,
        state: PeerSessionState,
    },
    /// A payload arrived from a session peer.
    DataReceived { bytes: Vec<u8>, from: PeerIdentity },
}

/// Requests the chat core makes of the networking layer.
///
/// Every method returns immediately; outcomes arrive as
/// [`TransportEvent`]s. Stopping a role is best-effort, so a final event
/// from it may still be delivered afterwards.
pub trait Transport: Send + Sync {
    /// Start searching for peers advertising `service_type`.
    fn start_browsing(&self, service_type: &str, local: &PeerIdentity) -> Result<(), NetworkError>;

    /// Stop searching. Safe to call when not browsing.
    fn stop_browsing(&self);

    /// Start announcing `local` under `service_type` and accept invitations.
    fn start_advertising(
        &self,
        service_type: &str,
        local: &PeerIdentity,
    ) -> Result<(), NetworkError>;

    /// Stop announcing. Safe to call when not advertising.
    fn stop_advertising(&self);

    /// Invite a found peer into the session. The outcome arrives as
    /// session state changes for that peer.
    fn invite(
        &self,
        peer: &PeerId,
        context: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<(), NetworkError>;

    /// Queue a payload for every peer in `to`.
    fn send(&self, payload: &[u8], to: &[PeerId], mode: SendMode) -> Result<(), NetworkError>;

    /// Leave the session, dropping every link. In-flight invitations are
    /// abandoned.
    fn disconnect(&self);
}

/// Create the channel a transport reports into.
pub fn event_channel(
    capacity: usize,
) -> (mpsc::Sender<TransportEvent>, mpsc::Receiver<TransportEvent>) {
    mpsc::channel(capacity)
}
