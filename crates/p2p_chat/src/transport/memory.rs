//! In-process transport.
//!
//! A [`MemoryNetwork`] is a hub that any number of [`MemoryTransport`]s
//! attach to. It behaves like a single-hop radio: a browser sees every
//! advertiser with the same service type, invitations go straight to the
//! invitee, and payloads are delivered in order to linked peers.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::discovery::DiscoveredPeer;
use crate::error::NetworkError;
use crate::identity::{PeerId, PeerIdentity};
use crate::invitation::Invitation;
use crate::session::PeerSessionState;
use crate::transport::{SendMode, Transport, TransportEvent};

#[derive(Debug)]
struct Member {
    identity: PeerIdentity,
    events: mpsc::Sender<TransportEvent>,
    browsing: Option<String>,
    advertising: Option<String>,
    links: BTreeSet<PeerId>,
    /// Bumped on disconnect so in-flight invitations are abandoned.
    epoch: u64,
}

impl Member {
    fn emit(&self, event: TransportEvent) {
        if let Err(e) = self.events.try_send(event) {
            warn!("Dropping event for {}: {e}", self.identity);
        }
    }
}

#[derive(Debug, Default)]
struct Hub {
    members: HashMap<PeerId, Member>,
}

/// Shared in-process network.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the network as `identity`. Events for the new member arrive on
    /// the returned receiver.
    pub fn attach(
        &self,
        identity: PeerIdentity,
        capacity: usize,
    ) -> (MemoryTransport, mpsc::Receiver<TransportEvent>) {
        let (events, rx) = mpsc::channel(capacity);
        let id = identity.id.clone();
        self.hub.lock().members.insert(
            id.clone(),
            Member {
                identity,
                events,
                browsing: None,
                advertising: None,
                links: BTreeSet::new(),
                epoch: 0,
            },
        );
        (
            MemoryTransport {
                id,
                network: self.clone(),
            },
            rx,
        )
    }

    /// Number of attached members.
    pub fn len(&self) -> usize {
        self.hub.lock().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One member's view of a [`MemoryNetwork`].
#[derive(Debug)]
pub struct MemoryTransport {
    id: PeerId,
    network: MemoryNetwork,
}

impl MemoryTransport {
    /// Ids of peers currently linked to this member.
    pub fn links(&self) -> Vec<PeerId> {
        let hub = self.network.hub.lock();
        hub.members
            .get(&self.id)
            .map(|m| m.links.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn with_member<T>(&self, f: impl FnOnce(&mut Member) -> T) -> Result<T, NetworkError> {
        let mut hub = self.network.hub.lock();
        hub.members
            .get_mut(&self.id)
            .map(f)
            .ok_or_else(|| NetworkError::Transport("detached from network".to_string()))
    }

    /// Announce that `advertiser` left to every browser of its service.
    fn announce_lost(hub: &Hub, advertiser: &PeerId, service_type: &str) {
        for member in hub.members.values() {
            if &member.identity.id != advertiser
                && member.browsing.as_deref() == Some(service_type)
            {
                member.emit(TransportEvent::PeerLost(advertiser.clone()));
            }
        }
    }
}

impl Transport for MemoryTransport {
    fn start_browsing(&self, service_type: &str, _local: &PeerIdentity) -> Result<(), NetworkError> {
        let mut hub = self.network.hub.lock();
        let found: Vec<PeerIdentity> = hub
            .members
            .values()
            .filter(|m| m.identity.id != self.id && m.advertising.as_deref() == Some(service_type))
            .map(|m| m.identity.clone())
            .collect();

        let me = hub
            .members
            .get_mut(&self.id)
            .ok_or_else(|| NetworkError::Transport("detached from network".to_string()))?;
        me.browsing = Some(service_type.to_string());
        for identity in found {
            me.emit(TransportEvent::PeerFound(DiscoveredPeer::new(identity)));
        }
        Ok(())
    }

    fn stop_browsing(&self) {
        let _ = self.with_member(|m| m.browsing = None);
    }

    fn start_advertising(&self, service_type: &str, _local: &PeerIdentity) -> Result<(), NetworkError> {
        let mut hub = self.network.hub.lock();
        let me = hub
            .members
            .get_mut(&self.id)
            .ok_or_else(|| NetworkError::Transport("detached from network".to_string()))?;
        me.advertising = Some(service_type.to_string());
        let identity = me.identity.clone();

        for member in hub.members.values() {
            if member.identity.id != self.id && member.browsing.as_deref() == Some(service_type) {
                member.emit(TransportEvent::PeerFound(DiscoveredPeer::new(identity.clone())));
            }
        }
        Ok(())
    }

    fn stop_advertising(&self) {
        let mut hub = self.network.hub.lock();
        let Some(service_type) = hub
            .members
            .get_mut(&self.id)
            .and_then(|m| m.advertising.take())
        else {
            return;
        };
        Self::announce_lost(&hub, &self.id, &service_type);
    }

    fn invite(
        &self,
        peer: &PeerId,
        context: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<(), NetworkError> {
        let hub = self.network.hub.lock();
        let me = hub
            .members
            .get(&self.id)
            .ok_or_else(|| NetworkError::Transport("detached from network".to_string()))?;
        let invitee = hub
            .members
            .get(peer)
            .filter(|m| m.advertising.is_some())
            .ok_or_else(|| NetworkError::UnknownPeer(peer.to_string()))?;

        let (invitation, answer) = Invitation::new(me.identity.clone(), context);
        invitee.emit(TransportEvent::InvitationReceived(invitation));

        let inviter = (me.identity.clone(), me.events.clone(), me.epoch);
        let invitee = (invitee.identity.clone(), invitee.events.clone(), invitee.epoch);
        let network = self.network.clone();
        drop(hub);

        tokio::spawn(async move {
            let (inviter_identity, inviter_events, inviter_epoch) = inviter;
            let (invitee_identity, invitee_events, invitee_epoch) = invitee;

            let accepted = matches!(
                tokio::time::timeout(timeout, answer).await,
                Ok(Ok(true))
            );

            let still_current = {
                let hub = network.hub.lock();
                let epoch_of = |id: &PeerId| hub.members.get(id).map(|m| m.epoch);
                epoch_of(&inviter_identity.id) == Some(inviter_epoch)
                    && epoch_of(&invitee_identity.id) == Some(invitee_epoch)
            };
            if !still_current {
                debug!("Invitation from {inviter_identity} abandoned by disconnect");
                return;
            }

            if !accepted {
                debug!("{invitee_identity} did not join {inviter_identity}");
                let _ = inviter_events
                    .send(TransportEvent::SessionStateChanged {
                        peer: invitee_identity,
                        state: PeerSessionState::NotConnected,
                    })
                    .await;
                return;
            }

            {
                let mut hub = network.hub.lock();
                if let Some(m) = hub.members.get_mut(&inviter_identity.id) {
                    m.links.insert(invitee_identity.id.clone());
                }
                if let Some(m) = hub.members.get_mut(&invitee_identity.id) {
                    m.links.insert(inviter_identity.id.clone());
                }
            }

            for state in [PeerSessionState::Connecting, PeerSessionState::Connected] {
                let _ = inviter_events
                    .send(TransportEvent::SessionStateChanged {
                        peer: invitee_identity.clone(),
                        state,
                    })
                    .await;
                let _ = invitee_events
                    .send(TransportEvent::SessionStateChanged {
                        peer: inviter_identity.clone(),
                        state,
                    })
                    .await;
            }
        });
        Ok(())
    }

    fn send(&self, payload: &[u8], to: &[PeerId], _mode: SendMode) -> Result<(), NetworkError> {
        let hub = self.network.hub.lock();
        let me = hub
            .members
            .get(&self.id)
            .ok_or_else(|| NetworkError::Transport("detached from network".to_string()))?;

        let mut targets = Vec::with_capacity(to.len());
        for peer in to {
            let member = hub
                .members
                .get(peer)
                .filter(|_| me.links.contains(peer))
                .ok_or_else(|| NetworkError::Transport(format!("not connected to {peer}")))?;
            targets.push(member);
        }

        for member in targets {
            member
                .events
                .try_send(TransportEvent::DataReceived {
                    bytes: payload.to_vec(),
                    from: me.identity.clone(),
                })
                .map_err(|e| NetworkError::Transport(format!("deliver to {}: {e}", member.identity)))?;
        }
        Ok(())
    }

    fn disconnect(&self) {
        let mut hub = self.network.hub.lock();
        let Some(me) = hub.members.get_mut(&self.id) else {
            return;
        };
        me.epoch += 1;
        let links = std::mem::take(&mut me.links);
        let identity = me.identity.clone();

        for peer in links {
            if let Some(other) = hub.members.get_mut(&peer) {
                other.links.remove(&self.id);
                other.emit(TransportEvent::SessionStateChanged {
                    peer: identity.clone(),
                    state: PeerSessionState::NotConnected,
                });
                let other_identity = other.identity.clone();
                if let Some(me) = hub.members.get(&self.id) {
                    me.emit(TransportEvent::SessionStateChanged {
                        peer: other_identity,
                        state: PeerSessionState::NotConnected,
                    });
                }
            }
        }
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.disconnect();
        let mut hub = self.network.hub.lock();
        if let Some(me) = hub.members.remove(&self.id) {
            if let Some(service_type) = me.advertising {
                Self::announce_lost(&hub, &self.id, &service_type);
            }
        }
    }
}
