//! Connection state machine: the single owner of a node's mutable state.
//!
//! [`ConnectionStateMachine`] applies user requests and transport events one
//! at a time and records the resulting [`NodeEvent`]s for the UI. It never
//! blocks: every transport call is a request whose outcome comes back later
//! as another event.
//!
//! Invariant after every step: the state is `Connected` exactly when the
//! session has a joined peer, and `NotConnected` implies an empty session.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::channel::{Message, MessageChannel};
use crate::config::ChatConfig;
use crate::discovery::{DiscoveredPeer, DiscoveryService, FoundOutcome};
use crate::error::NetworkError;
use crate::identity::{PeerId, PeerIdentity};
use crate::invitation::{Invitation, InvitationHandshake, ReceiveOutcome};
use crate::session::{PeerSessionState, Session};
use crate::state::ConnectionState;
use crate::transport::{Transport, TransportEvent};

/// How a pending invitation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvitationOutcome {
    Accepted,
    Declined,
    /// A second invitation from a peer that already had one pending.
    Duplicate,
    /// Not answered in time, or withdrawn by the inviter.
    Expired,
}

/// Notifications for the UI collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    StateChanged(ConnectionState),
    PeerFound(DiscoveredPeer),
    PeerLost(PeerId),
    InvitationPending(PeerIdentity),
    InvitationResolved {
        from: PeerIdentity,
        outcome: InvitationOutcome,
    },
    MessageAppended(Message),
    LogCleared,
}

/// Drives discovery, the invitation handshake, the session and the message
/// log from a single sequencing context.
pub struct ConnectionStateMachine {
    transport: Arc<dyn Transport>,
    invite_timeout: Duration,
    auto_accept: bool,
    state: ConnectionState,
    session: Session,
    discovery: DiscoveryService,
    handshake: InvitationHandshake,
    channel: MessageChannel,
    outbox: Vec<NodeEvent>,
}

impl ConnectionStateMachine {
    pub fn new(local: PeerIdentity, config: &ChatConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            invite_timeout: config.invite_timeout,
            auto_accept: config.auto_accept_invitations,
            state: ConnectionState::NotConnected,
            discovery: DiscoveryService::new(config.service_type.clone(), local.clone()),
            session: Session::new(local),
            handshake: InvitationHandshake::new(config.invite_timeout),
            channel: MessageChannel::new(),
            outbox: Vec::new(),
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn discovery(&self) -> &DiscoveryService {
        &self.discovery
    }

    pub fn messages(&self) -> &[Message] {
        self.channel.messages()
    }

    pub fn pending_invitations(&self) -> Vec<PeerIdentity> {
        self.handshake.pending()
    }

    /// Drain the events produced since the last call.
    pub fn take_events(&mut self) -> Vec<NodeEvent> {
        std::mem::take(&mut self.outbox)
    }

    // -----------------------------------------------------------------------
    // User requests
    // -----------------------------------------------------------------------

    /// Browse for peers (advertising as a side effect).
    ///
    /// If the transport cannot start, the node falls back to `NotConnected`
    /// with both discovery roles stopped.
    pub fn request_browse(&mut self) -> Result<(), NetworkError> {
        self.ensure_can_search()?;
        if let Err(e) = self.discovery.start_browsing(self.transport.as_ref()) {
            warn!("Browse failed: {e}");
            self.teardown();
            return Err(e);
        }
        self.set_state(ConnectionState::Browsing);
        Ok(())
    }

    /// Advertise and wait to be invited. Stops any running browser.
    pub fn request_advertise(&mut self) -> Result<(), NetworkError> {
        self.ensure_can_search()?;
        if let Err(e) = self.discovery.start_advertising(self.transport.as_ref()) {
            warn!("Advertise failed: {e}");
            self.teardown();
            return Err(e);
        }
        self.set_state(ConnectionState::Advertising);
        Ok(())
    }

    /// Leave the session from any state.
    pub fn request_disconnect(&mut self) {
        info!("Disconnect requested while {}", self.state);
        self.teardown();
    }

    /// Send a text message to every connected peer.
    pub fn send_message(&mut self, text: &str) -> Result<Message, NetworkError> {
        let message = self
            .channel
            .send(text, &self.session, self.transport.as_ref())?;
        self.outbox.push(NodeEvent::MessageAppended(message.clone()));
        Ok(message)
    }

    /// Accept the pending invitation from `peer_id`.
    pub fn accept_invitation(&mut self, peer_id: &PeerId) -> Result<(), NetworkError> {
        self.resolve_invitation(peer_id, true)
    }

    /// Decline the pending invitation from `peer_id`.
    pub fn decline_invitation(&mut self, peer_id: &PeerId) -> Result<(), NetworkError> {
        self.resolve_invitation(peer_id, false)
    }

    fn resolve_invitation(&mut self, peer_id: &PeerId, accept: bool) -> Result<(), NetworkError> {
        let inviter = self.handshake.get(peer_id).cloned();
        let result = if accept {
            self.handshake.accept(peer_id)
        } else {
            self.handshake.decline(peer_id)
        };

        match result {
            Ok(from) => {
                let outcome = if accept {
                    InvitationOutcome::Accepted
                } else {
                    InvitationOutcome::Declined
                };
                self.outbox
                    .push(NodeEvent::InvitationResolved { from, outcome });
                Ok(())
            }
            Err(NetworkError::Timeout(timeout)) => {
                // The transport stopped waiting before we answered.
                if let Some(from) = inviter {
                    self.outbox.push(NodeEvent::InvitationResolved {
                        from,
                        outcome: InvitationOutcome::Expired,
                    });
                }
                Err(NetworkError::Timeout(timeout))
            }
            Err(e) => Err(e),
        }
    }

    /// Drop invitations that were not answered in time.
    pub fn expire_invitations(&mut self, now: Instant) {
        for from in self.handshake.expire(now) {
            self.outbox.push(NodeEvent::InvitationResolved {
                from,
                outcome: InvitationOutcome::Expired,
            });
        }
    }

    // -----------------------------------------------------------------------
    // Transport events
    // -----------------------------------------------------------------------

    /// Apply one transport event.
    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::PeerFound(peer) => self.on_peer_found(peer),
            TransportEvent::PeerLost(peer_id) => {
                if self.discovery.peer_lost(&peer_id) {
                    debug!("Lost peer {peer_id}");
                    self.outbox.push(NodeEvent::PeerLost(peer_id));
                }
            }
            TransportEvent::InvitationReceived(invitation) => self.on_invitation(invitation),
            TransportEvent::SessionStateChanged { peer, state } => {
                self.on_session_state(peer, state)
            }
            TransportEvent::DataReceived { bytes, from } => {
                if !self.session.is_connected(&from.id) {
                    debug!("Dropping data from {from}: not in session");
                    return;
                }
                if let Some(message) = self.channel.receive(&bytes, &from) {
                    self.outbox.push(NodeEvent::MessageAppended(message));
                }
            }
        }
    }

    fn on_peer_found(&mut self, peer: DiscoveredPeer) {
        let id = peer.identity.id.clone();
        match self.discovery.peer_found(peer.clone()) {
            FoundOutcome::Invite => {
                info!("Found {}, inviting", peer.identity);
                self.outbox.push(NodeEvent::PeerFound(peer));
                if let Err(e) = self.transport.invite(&id, None, self.invite_timeout) {
                    warn!("Invite to {id} failed: {e}");
                }
            }
            FoundOutcome::AlreadyInvited => {
                debug!("Found {} again; invitation already out", peer.identity);
            }
            FoundOutcome::Ignored => {}
        }
    }

    fn on_invitation(&mut self, invitation: Invitation) {
        if !matches!(
            self.state,
            ConnectionState::Advertising | ConnectionState::Browsing
        ) {
            debug!(
                "Declining invitation from {} while {}",
                invitation.from, self.state
            );
            invitation.respond(false);
            return;
        }

        let from = invitation.from.clone();
        match self.handshake.receive(invitation, Instant::now()) {
            ReceiveOutcome::Duplicate => {
                self.outbox.push(NodeEvent::InvitationResolved {
                    from,
                    outcome: InvitationOutcome::Duplicate,
                });
            }
            ReceiveOutcome::Pending => {
                self.outbox.push(NodeEvent::InvitationPending(from.clone()));
                if self.auto_accept {
                    if let Err(e) = self.accept_invitation(&from.id) {
                        warn!("Auto-accept of {from} failed: {e}");
                    }
                }
            }
        }
    }

    fn on_session_state(&mut self, peer: PeerIdentity, state: PeerSessionState) {
        debug!("Session peer {peer} is now {state:?}");
        match state {
            PeerSessionState::Connecting => {
                if self.state == ConnectionState::NotConnected {
                    debug!("Ignoring late connecting report for {peer}");
                    return;
                }
                self.session.update(&peer, state);
                if self.session.is_empty() {
                    self.set_state(ConnectionState::Connecting);
                }
            }
            PeerSessionState::Connected => {
                if self.state == ConnectionState::NotConnected {
                    debug!("Ignoring late connected report for {peer}");
                    return;
                }
                self.session.update(&peer, state);
                self.discovery.resolve(&peer.id);
                self.discovery.stop_all(self.transport.as_ref());
                self.set_state(ConnectionState::Connected(peer.display_name.clone()));
            }
            PeerSessionState::NotConnected => {
                let known = self.session.involves(&peer.id)
                    || self.discovery.knows(&peer.id)
                    || self.handshake.is_pending(&peer.id);
                if !known {
                    debug!("Ignoring disconnect of unknown peer {peer}");
                    return;
                }

                self.discovery.resolve(&peer.id);
                if let Some(from) = self.handshake.withdraw(&peer.id) {
                    self.outbox.push(NodeEvent::InvitationResolved {
                        from,
                        outcome: InvitationOutcome::Expired,
                    });
                }
                self.session.update(&peer, state);

                if let Some(last) = self.session.last_joined() {
                    let name = last.display_name.clone();
                    self.set_state(ConnectionState::Connected(name));
                } else if self.session.has_connecting() {
                    self.set_state(ConnectionState::Connecting);
                } else {
                    info!("Session with {peer} ended");
                    self.teardown();
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn ensure_can_search(&self) -> Result<(), NetworkError> {
        if self.state.can_search() {
            Ok(())
        } else {
            warn!("Search requested while {}; ignoring", self.state);
            Err(NetworkError::InvalidState(self.state.to_string()))
        }
    }

    /// Return to `NotConnected`: stop discovery, refuse pending invitations,
    /// leave the session and clear the log.
    fn teardown(&mut self) {
        self.discovery.stop_all(self.transport.as_ref());
        for from in self.handshake.decline_all() {
            self.outbox.push(NodeEvent::InvitationResolved {
                from,
                outcome: InvitationOutcome::Declined,
            });
        }
        self.transport.disconnect();
        self.session.clear();
        if !self.channel.is_empty() {
            self.channel.clear();
            self.outbox.push(NodeEvent::LogCleared);
        }
        self.set_state(ConnectionState::NotConnected);
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            info!("State: {} -> {}", self.state, state);
            self.state = state.clone();
            self.outbox.push(NodeEvent::StateChanged(state));
        }
        debug_assert_eq!(self.state.is_connected(), !self.session.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::{Call, RecordingTransport};

    struct Fixture {
        transport: Arc<RecordingTransport>,
        machine: ConnectionStateMachine,
    }

    fn fixture_with(config: ChatConfig) -> Fixture {
        let transport = Arc::new(RecordingTransport::default());
        let machine = ConnectionStateMachine::new(
            PeerIdentity::new(PeerId::from_string("me"), "me"),
            &config,
            transport.clone(),
        );
        Fixture { transport, machine }
    }

    fn fixture() -> Fixture {
        fixture_with(ChatConfig::default())
    }

    fn peer(name: &str) -> PeerIdentity {
        PeerIdentity::new(PeerId::from_string(name), name)
    }

    fn session_event(name: &str, state: PeerSessionState) -> TransportEvent {
        TransportEvent::SessionStateChanged {
            peer: peer(name),
            state,
        }
    }

    fn assert_invariant(machine: &ConnectionStateMachine) {
        assert_eq!(machine.state().is_connected(), !machine.session().is_empty());
        if *machine.state() == ConnectionState::NotConnected {
            assert!(machine.session().is_empty());
        }
    }

    fn connect(f: &mut Fixture, name: &str) {
        f.machine.request_browse().unwrap();
        f.machine
            .handle_transport_event(TransportEvent::PeerFound(DiscoveredPeer::new(peer(name))));
        f.machine
            .handle_transport_event(session_event(name, PeerSessionState::Connecting));
        f.machine
            .handle_transport_event(session_event(name, PeerSessionState::Connected));
    }

    #[test]
    fn test_browse_scenario() {
        let mut f = fixture();
        assert_eq!(*f.machine.state(), ConnectionState::NotConnected);

        f.machine.request_browse().unwrap();
        assert_eq!(*f.machine.state(), ConnectionState::Browsing);
        assert_eq!(
            f.transport.calls(),
            vec![Call::StartAdvertising, Call::StartBrowsing]
        );
        f.transport.clear();

        f.machine
            .handle_transport_event(TransportEvent::PeerFound(DiscoveredPeer::new(peer("P"))));
        assert_eq!(
            f.transport.calls(),
            vec![Call::Invite(PeerId::from_string("P"))]
        );
        f.transport.clear();

        f.machine
            .handle_transport_event(session_event("P", PeerSessionState::Connecting));
        assert_eq!(*f.machine.state(), ConnectionState::Connecting);
        assert_invariant(&f.machine);

        f.machine
            .handle_transport_event(session_event("P", PeerSessionState::Connected));
        assert_eq!(*f.machine.state(), ConnectionState::Connected("P".into()));
        assert_eq!(
            f.transport.calls(),
            vec![Call::StopBrowsing, Call::StopAdvertising]
        );
        assert!(!f.machine.discovery().is_browsing());
        assert!(!f.machine.discovery().is_advertising());
        assert_invariant(&f.machine);
    }

    #[test]
    fn test_advertise_stops_browsing() {
        let mut f = fixture();
        f.machine.request_browse().unwrap();
        f.transport.clear();

        f.machine.request_advertise().unwrap();
        assert_eq!(*f.machine.state(), ConnectionState::Advertising);
        assert!(!f.machine.discovery().is_browsing());
        assert!(f.machine.discovery().is_advertising());
        assert_eq!(f.transport.calls()[0], Call::StopBrowsing);
    }

    #[test]
    fn test_failed_browse_falls_back_to_idle() {
        let mut f = fixture();
        f.transport.fail_browsing(true);

        assert!(matches!(
            f.machine.request_browse(),
            Err(NetworkError::Discovery(_))
        ));
        assert_eq!(*f.machine.state(), ConnectionState::NotConnected);
        assert!(!f.machine.discovery().is_browsing());
        assert!(!f.machine.discovery().is_advertising());
        assert_eq!(
            f.transport.calls(),
            vec![
                Call::StartAdvertising,
                Call::StartBrowsing,
                Call::StopAdvertising,
                Call::Disconnect
            ]
        );
        assert_invariant(&f.machine);

        f.transport.fail_browsing(false);
        f.machine.request_browse().unwrap();
        assert_eq!(*f.machine.state(), ConnectionState::Browsing);
    }

    #[test]
    fn test_failed_browse_while_advertising_stops_advertiser() {
        let mut f = fixture();
        f.machine.request_advertise().unwrap();
        f.transport.fail_browsing(true);
        let _ = f.machine.take_events();

        assert!(f.machine.request_browse().is_err());
        assert_eq!(*f.machine.state(), ConnectionState::NotConnected);
        assert!(!f.machine.discovery().is_advertising());
        assert_eq!(
            f.machine.take_events(),
            vec![NodeEvent::StateChanged(ConnectionState::NotConnected)]
        );
    }

    #[test]
    fn test_failed_advertise_falls_back_to_idle() {
        let mut f = fixture();
        f.machine.request_browse().unwrap();
        f.transport.fail_advertising(true);

        assert!(f.machine.request_advertise().is_err());
        assert_eq!(*f.machine.state(), ConnectionState::NotConnected);
        assert!(!f.machine.discovery().is_browsing());
        assert!(!f.machine.discovery().is_advertising());
        assert_invariant(&f.machine);
    }

    #[test]
    fn test_search_rejected_while_connected() {
        let mut f = fixture();
        connect(&mut f, "P");

        let result = f.machine.request_browse();
        assert!(matches!(result, Err(NetworkError::InvalidState(_))));
        assert!(f.machine.state().is_connected());
    }

    #[test]
    fn test_disconnect_clears_everything() {
        let mut f = fixture();
        connect(&mut f, "P");
        f.machine.send_message("hi").unwrap();
        f.machine.handle_transport_event(TransportEvent::DataReceived {
            bytes: b"yo".to_vec(),
            from: peer("P"),
        });
        assert_eq!(f.machine.messages().len(), 2);
        f.machine.take_events();
        f.transport.clear();

        f.machine.request_disconnect();
        assert_eq!(*f.machine.state(), ConnectionState::NotConnected);
        assert!(f.machine.session().is_empty());
        assert!(f.machine.messages().is_empty());
        assert!(f.transport.calls().contains(&Call::Disconnect));
        assert_eq!(
            f.machine.take_events(),
            vec![
                NodeEvent::LogCleared,
                NodeEvent::StateChanged(ConnectionState::NotConnected)
            ]
        );
        assert_invariant(&f.machine);
    }

    #[test]
    fn test_remote_disconnect_returns_to_idle() {
        let mut f = fixture();
        connect(&mut f, "P");
        f.machine.send_message("hi").unwrap();

        f.machine
            .handle_transport_event(session_event("P", PeerSessionState::NotConnected));
        assert_eq!(*f.machine.state(), ConnectionState::NotConnected);
        assert!(f.machine.messages().is_empty());
        assert_invariant(&f.machine);
    }

    #[test]
    fn test_declined_invite_while_browsing() {
        let mut f = fixture();
        f.machine.request_browse().unwrap();
        f.machine
            .handle_transport_event(TransportEvent::PeerFound(DiscoveredPeer::new(peer("P"))));

        f.machine
            .handle_transport_event(session_event("P", PeerSessionState::NotConnected));
        assert_eq!(*f.machine.state(), ConnectionState::NotConnected);
        assert!(!f.machine.discovery().is_browsing());
    }

    #[test]
    fn test_unknown_peer_disconnect_is_ignored() {
        let mut f = fixture();
        f.machine.request_browse().unwrap();

        f.machine
            .handle_transport_event(session_event("ghost", PeerSessionState::NotConnected));
        assert_eq!(*f.machine.state(), ConnectionState::Browsing);
    }

    #[test]
    fn test_late_events_after_disconnect_are_ignored() {
        let mut f = fixture();
        connect(&mut f, "P");
        f.machine.request_disconnect();
        f.machine.take_events();

        f.machine
            .handle_transport_event(TransportEvent::PeerFound(DiscoveredPeer::new(peer("Q"))));
        f.machine
            .handle_transport_event(session_event("P", PeerSessionState::NotConnected));
        f.machine
            .handle_transport_event(session_event("Q", PeerSessionState::Connected));
        f.machine.handle_transport_event(TransportEvent::DataReceived {
            bytes: b"late".to_vec(),
            from: peer("P"),
        });

        assert_eq!(*f.machine.state(), ConnectionState::NotConnected);
        assert!(f.machine.messages().is_empty());
        assert!(f.machine.take_events().is_empty());
        assert_invariant(&f.machine);
    }

    #[test]
    fn test_second_peer_churn_keeps_connected() {
        let mut f = fixture();
        connect(&mut f, "A");
        f.machine
            .handle_transport_event(session_event("B", PeerSessionState::Connecting));
        assert_eq!(*f.machine.state(), ConnectionState::Connected("A".into()));

        f.machine
            .handle_transport_event(session_event("B", PeerSessionState::Connected));
        assert_eq!(*f.machine.state(), ConnectionState::Connected("B".into()));

        f.machine
            .handle_transport_event(session_event("B", PeerSessionState::NotConnected));
        assert_eq!(*f.machine.state(), ConnectionState::Connected("A".into()));
        assert_invariant(&f.machine);

        f.machine
            .handle_transport_event(session_event("A", PeerSessionState::NotConnected));
        assert_eq!(*f.machine.state(), ConnectionState::NotConnected);
        assert_invariant(&f.machine);
    }

    #[test]
    fn test_send_validation() {
        let mut f = fixture();
        assert!(matches!(
            f.machine.send_message("hi"),
            Err(NetworkError::NoConnectedPeers)
        ));

        connect(&mut f, "P");
        assert!(matches!(
            f.machine.send_message(""),
            Err(NetworkError::EmptyMessage)
        ));
        assert!(f.machine.messages().is_empty());
    }

    #[test]
    fn test_send_transport_error_not_logged() {
        let mut f = fixture();
        connect(&mut f, "P");
        f.transport.fail_sends(true);

        assert!(matches!(
            f.machine.send_message("hi"),
            Err(NetworkError::Transport(_))
        ));
        assert!(f.machine.messages().is_empty());
    }

    #[test]
    fn test_invitation_accept_flow() {
        let mut f = fixture();
        f.machine.request_advertise().unwrap();

        let (invitation, mut answer) = Invitation::new(peer("P"), None);
        f.machine
            .handle_transport_event(TransportEvent::InvitationReceived(invitation));
        assert_eq!(f.machine.pending_invitations(), vec![peer("P")]);

        f.machine
            .accept_invitation(&PeerId::from_string("P"))
            .unwrap();
        assert_eq!(answer.try_recv(), Ok(true));
        assert!(f.machine.pending_invitations().is_empty());
        assert!(f.machine.take_events().contains(&NodeEvent::InvitationResolved {
            from: peer("P"),
            outcome: InvitationOutcome::Accepted,
        }));

        f.machine
            .handle_transport_event(session_event("P", PeerSessionState::Connecting));
        f.machine
            .handle_transport_event(session_event("P", PeerSessionState::Connected));
        assert_eq!(*f.machine.state(), ConnectionState::Connected("P".into()));
    }

    #[test]
    fn test_invitation_decline_changes_nothing() {
        let mut f = fixture();
        f.machine.request_advertise().unwrap();
        let (invitation, mut answer) = Invitation::new(peer("P"), None);
        f.machine
            .handle_transport_event(TransportEvent::InvitationReceived(invitation));

        f.machine
            .decline_invitation(&PeerId::from_string("P"))
            .unwrap();
        assert_eq!(answer.try_recv(), Ok(false));
        assert_eq!(*f.machine.state(), ConnectionState::Advertising);
        assert!(f.machine.session().is_empty());
    }

    #[test]
    fn test_invitation_while_idle_is_declined() {
        let mut f = fixture();
        let (invitation, mut answer) = Invitation::new(peer("P"), None);
        f.machine
            .handle_transport_event(TransportEvent::InvitationReceived(invitation));
        assert_eq!(answer.try_recv(), Ok(false));
        assert!(f.machine.pending_invitations().is_empty());
    }

    #[test]
    fn test_auto_accept() {
        let mut config = ChatConfig::default();
        config.auto_accept_invitations = true;
        let mut f = fixture_with(config);
        f.machine.request_advertise().unwrap();

        let (invitation, mut answer) = Invitation::new(peer("P"), None);
        f.machine
            .handle_transport_event(TransportEvent::InvitationReceived(invitation));
        assert_eq!(answer.try_recv(), Ok(true));
    }

    #[test]
    fn test_invitation_expiry() {
        let mut f = fixture();
        f.machine.request_advertise().unwrap();
        let (invitation, _answer) = Invitation::new(peer("P"), None);
        f.machine
            .handle_transport_event(TransportEvent::InvitationReceived(invitation));
        f.machine.take_events();

        f.machine
            .expire_invitations(Instant::now() + Duration::from_secs(11));
        assert!(f.machine.pending_invitations().is_empty());
        assert_eq!(
            f.machine.take_events(),
            vec![NodeEvent::InvitationResolved {
                from: peer("P"),
                outcome: InvitationOutcome::Expired,
            }]
        );
    }

    #[test]
    fn test_invariant_under_random_walk() {
        let mut f = fixture();
        let names = ["a", "b", "c"];
        let states = [
            PeerSessionState::Connecting,
            PeerSessionState::Connected,
            PeerSessionState::NotConnected,
        ];

        // Deterministic pseudo-random walk over requests and session reports.
        let mut seed: u64 = 0x5eed;
        for _ in 0..500 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let pick = (seed >> 33) as usize;
            match pick % 6 {
                0 => {
                    let _ = f.machine.request_browse();
                }
                1 => {
                    let _ = f.machine.request_advertise();
                }
                2 => f.machine.request_disconnect(),
                3 => f.machine.handle_transport_event(TransportEvent::PeerFound(
                    DiscoveredPeer::new(peer(names[pick % 3])),
                )),
                _ => f.machine.handle_transport_event(session_event(
                    names[(pick / 7) % 3],
                    states[(pick / 3) % 3],
                )),
            }
            assert_invariant(&f.machine);
        }
    }
}
