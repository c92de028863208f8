//! Peer discovery: browsing and advertising roles.
//!
//! [`DiscoveryService`] owns at most one browser and one advertiser on the
//! transport and keeps the table of live [`DiscoveredPeer`]s.
//!
//! Browsing always advertises too, so two nodes find each other no matter
//! which one browses. Advertising on its own stops any running browser, and
//! restarting either role tears the stale one down first.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::NetworkError;
use crate::identity::{PeerId, PeerIdentity};
use crate::transport::Transport;

/// A peer reported by the browser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredPeer {
    /// The peer's identity.
    pub identity: PeerIdentity,
    /// Free-form info the peer advertised alongside its identity.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl DiscoveredPeer {
    pub fn new(identity: PeerIdentity) -> Self {
        Self {
            identity,
            metadata: BTreeMap::new(),
        }
    }
}

/// What the caller should do with a found peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoundOutcome {
    /// New peer; invite it into the session.
    Invite,
    /// Known peer that was already invited; nothing to do.
    AlreadyInvited,
    /// Not browsing (or our own announcement); drop it.
    Ignored,
}

/// Tracks discovery roles and live peers.
#[derive(Debug)]
pub struct DiscoveryService {
    service_type: String,
    local: PeerIdentity,
    browsing: bool,
    advertising: bool,
    peers: BTreeMap<PeerId, DiscoveredPeer>,
    invited: BTreeSet<PeerId>,
}

impl DiscoveryService {
    pub fn new(service_type: impl Into<String>, local: PeerIdentity) -> Self {
        Self {
            service_type: service_type.into(),
            local,
            browsing: false,
            advertising: false,
            peers: BTreeMap::new(),
            invited: BTreeSet::new(),
        }
    }

    pub fn is_browsing(&self) -> bool {
        self.browsing
    }

    pub fn is_advertising(&self) -> bool {
        self.advertising
    }

    /// Start browsing. Advertising is started first so this node stays
    /// visible to peers that are browsing at the same time.
    pub fn start_browsing(&mut self, transport: &dyn Transport) -> Result<(), NetworkError> {
        self.start_advertising(transport)?;
        transport.start_browsing(&self.service_type, &self.local)?;
        self.browsing = true;
        info!("Browsing for '{}' peers", self.service_type);
        Ok(())
    }

    /// Stop browsing and forget every discovered peer. Safe to call when
    /// not browsing.
    pub fn stop_browsing(&mut self, transport: &dyn Transport) {
        if self.browsing {
            transport.stop_browsing();
            self.browsing = false;
            debug!("Stopped browsing");
        }
        self.peers.clear();
        self.invited.clear();
    }

    /// Start advertising. Any running browser is stopped, and a running
    /// advertiser is replaced by a fresh one.
    pub fn start_advertising(&mut self, transport: &dyn Transport) -> Result<(), NetworkError> {
        self.stop_browsing(transport);
        self.stop_advertising(transport);
        transport.start_advertising(&self.service_type, &self.local)?;
        self.advertising = true;
        info!("Advertising as '{}'", self.local.display_name);
        Ok(())
    }

    /// Stop advertising. Safe to call when not advertising.
    pub fn stop_advertising(&mut self, transport: &dyn Transport) {
        if self.advertising {
            transport.stop_advertising();
            self.advertising = false;
            debug!("Stopped advertising");
        }
    }

    /// Stop both roles.
    pub fn stop_all(&mut self, transport: &dyn Transport) {
        self.stop_browsing(transport);
        self.stop_advertising(transport);
    }

    /// Record a found peer and decide whether it needs an invitation.
    pub fn peer_found(&mut self, peer: DiscoveredPeer) -> FoundOutcome {
        if !self.browsing {
            debug!("Ignoring found peer '{}' (not browsing)", peer.identity.display_name);
            return FoundOutcome::Ignored;
        }
        if peer.identity.id == self.local.id {
            return FoundOutcome::Ignored;
        }

        let id = peer.identity.id.clone();
        self.peers.insert(id.clone(), peer);
        if self.invited.insert(id) {
            FoundOutcome::Invite
        } else {
            FoundOutcome::AlreadyInvited
        }
    }

    /// Forget a lost peer. Returns whether it was live. An in-flight
    /// invitation to it is left to time out on the transport.
    pub fn peer_lost(&mut self, peer_id: &PeerId) -> bool {
        self.invited.remove(peer_id);
        self.peers.remove(peer_id).is_some()
    }

    /// Negotiation with the peer finished (joined or refused).
    pub fn resolve(&mut self, peer_id: &PeerId) {
        self.invited.remove(peer_id);
        self.peers.remove(peer_id);
    }

    /// Whether the peer is live or has an invitation outstanding.
    pub fn knows(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id) || self.invited.contains(peer_id)
    }

    /// Snapshot of live peers.
    pub fn peers(&self) -> Vec<DiscoveredPeer> {
        self.peers.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::{Call, RecordingTransport};

    fn local() -> PeerIdentity {
        PeerIdentity::new(PeerId::from_string("me"), "me")
    }

    fn found(name: &str) -> DiscoveredPeer {
        DiscoveredPeer::new(PeerIdentity::new(PeerId::from_string(name), name))
    }

    #[test]
    fn test_browsing_starts_advertising_first() {
        let transport = RecordingTransport::default();
        let mut discovery = DiscoveryService::new("p2pchat", local());

        discovery.start_browsing(&transport).unwrap();
        assert!(discovery.is_browsing());
        assert!(discovery.is_advertising());
        assert_eq!(
            transport.calls(),
            vec![Call::StartAdvertising, Call::StartBrowsing]
        );
    }

    #[test]
    fn test_advertising_stops_browser() {
        let transport = RecordingTransport::default();
        let mut discovery = DiscoveryService::new("p2pchat", local());
        discovery.start_browsing(&transport).unwrap();
        transport.clear();

        discovery.start_advertising(&transport).unwrap();
        assert!(!discovery.is_browsing());
        assert!(discovery.is_advertising());
        assert_eq!(
            transport.calls(),
            vec![
                Call::StopBrowsing,
                Call::StopAdvertising,
                Call::StartAdvertising
            ]
        );
    }

    #[test]
    fn test_stop_is_idempotent() {
        let transport = RecordingTransport::default();
        let mut discovery = DiscoveryService::new("p2pchat", local());
        discovery.stop_browsing(&transport);
        discovery.stop_advertising(&transport);
        assert!(transport.calls().is_empty());
    }

    #[test]
    fn test_found_peer_invited_once() {
        let transport = RecordingTransport::default();
        let mut discovery = DiscoveryService::new("p2pchat", local());
        discovery.start_browsing(&transport).unwrap();

        assert_eq!(discovery.peer_found(found("p")), FoundOutcome::Invite);
        assert_eq!(discovery.peer_found(found("p")), FoundOutcome::AlreadyInvited);
        assert_eq!(discovery.peers().len(), 1);
    }

    #[test]
    fn test_found_peer_ignored_when_not_browsing() {
        let transport = RecordingTransport::default();
        let mut discovery = DiscoveryService::new("p2pchat", local());
        discovery.start_advertising(&transport).unwrap();

        assert_eq!(discovery.peer_found(found("p")), FoundOutcome::Ignored);
        assert!(discovery.peers().is_empty());
    }

    #[test]
    fn test_own_announcement_ignored() {
        let transport = RecordingTransport::default();
        let mut discovery = DiscoveryService::new("p2pchat", local());
        discovery.start_browsing(&transport).unwrap();
        assert_eq!(discovery.peer_found(found("me")), FoundOutcome::Ignored);
    }

    #[test]
    fn test_lost_peer_never_live() {
        let transport = RecordingTransport::default();
        let mut discovery = DiscoveryService::new("p2pchat", local());
        discovery.start_browsing(&transport).unwrap();

        // found/lost churn in every order; the last event decides liveness.
        let script = [
            ("a", true),
            ("b", true),
            ("a", false),
            ("b", false),
            ("b", true),
            ("a", false),
            ("c", true),
            ("c", false),
            ("c", true),
        ];
        let mut last = BTreeMap::new();
        for (name, is_found) in script {
            if is_found {
                discovery.peer_found(found(name));
            } else {
                discovery.peer_lost(&PeerId::from_string(name));
            }
            last.insert(name, is_found);

            for peer in discovery.peers() {
                assert_eq!(last.get(peer.identity.display_name.as_str()), Some(&true));
            }
        }
        assert_eq!(discovery.peers().len(), 2);
    }

    #[test]
    fn test_relost_peer_is_invited_again() {
        let transport = RecordingTransport::default();
        let mut discovery = DiscoveryService::new("p2pchat", local());
        discovery.start_browsing(&transport).unwrap();

        discovery.peer_found(found("p"));
        discovery.peer_lost(&PeerId::from_string("p"));
        assert!(!discovery.knows(&PeerId::from_string("p")));
        assert_eq!(discovery.peer_found(found("p")), FoundOutcome::Invite);
    }

    #[test]
    fn test_resolve_forgets_peer() {
        let transport = RecordingTransport::default();
        let mut discovery = DiscoveryService::new("p2pchat", local());
        discovery.start_browsing(&transport).unwrap();
        discovery.peer_found(found("p"));

        discovery.resolve(&PeerId::from_string("p"));
        assert!(!discovery.knows(&PeerId::from_string("p")));
        assert!(discovery.peers().is_empty());
    }
}
