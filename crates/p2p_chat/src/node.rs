//! ChatNode: the sequencing loop that owns all chat state.
//!
//! [`ChatNode`] spawns one task that owns the [`ConnectionStateMachine`].
//! User requests (from any number of [`ChatHandle`] clones) and transport
//! events are queued on bounded channels and applied strictly in the order
//! the loop receives them, so no lock guards the state. After each step the
//! loop publishes:
//! - a [`Snapshot`] on a watch channel, for consistent reads;
//! - the step's [`NodeEvent`]s on a broadcast channel, for rendering.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::channel::Message;
use crate::config::ChatConfig;
use crate::discovery::DiscoveredPeer;
use crate::error::NetworkError;
use crate::identity::{PeerId, PeerIdentity};
use crate::machine::{ConnectionStateMachine, NodeEvent};
use crate::state::ConnectionState;
use crate::transport::{Transport, TransportEvent};

/// How often pending invitations are checked for expiry.
const EXPIRY_TICK: Duration = Duration::from_millis(250);

/// Capacity of the UI event broadcast.
const UI_EVENT_CAPACITY: usize = 256;

/// A consistent view of the node, taken between two steps of the loop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub state: ConnectionState,
    pub messages: Vec<Message>,
    pub connected_peers: Vec<PeerIdentity>,
    pub discovered_peers: Vec<DiscoveredPeer>,
    pub pending_invitations: Vec<PeerIdentity>,
}

impl Snapshot {
    fn of(machine: &ConnectionStateMachine) -> Self {
        Self {
            state: machine.state().clone(),
            messages: machine.messages().to_vec(),
            connected_peers: machine.session().connected_peers(),
            discovered_peers: machine.discovery().peers(),
            pending_invitations: machine.pending_invitations(),
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, NetworkError>>;

/// A request from the UI to the loop.
enum Command {
    Browse(Reply<()>),
    Advertise(Reply<()>),
    Disconnect(Reply<()>),
    Send { text: String, reply: Reply<Message> },
    Accept { peer: PeerId, reply: Reply<()> },
    Decline { peer: PeerId, reply: Reply<()> },
}

/// A reply held back until the step's snapshot is published.
enum Outcome {
    Unit(Reply<()>, Result<(), NetworkError>),
    Message(Reply<Message>, Result<Message, NetworkError>),
}

impl Outcome {
    fn deliver(self) {
        // The caller may have stopped waiting; nothing to do then.
        match self {
            Self::Unit(reply, result) => {
                let _ = reply.send(result);
            }
            Self::Message(reply, result) => {
                let _ = reply.send(result);
            }
        }
    }
}

/// Cloneable entry point for the UI collaborator.
#[derive(Clone)]
pub struct ChatHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<Snapshot>,
    events: broadcast::Sender<NodeEvent>,
    shutdown: broadcast::Sender<()>,
}

impl ChatHandle {
    /// Browse for peers (and advertise so they can find us).
    pub async fn request_browse(&self) -> Result<(), NetworkError> {
        self.call(Command::Browse).await
    }

    /// Advertise and wait for an invitation.
    pub async fn request_advertise(&self) -> Result<(), NetworkError> {
        self.call(Command::Advertise).await
    }

    /// Leave the session and clear the message log.
    pub async fn request_disconnect(&self) -> Result<(), NetworkError> {
        self.call(Command::Disconnect).await
    }

    /// Send a text message to every connected peer.
    pub async fn send_message(&self, text: impl Into<String>) -> Result<Message, NetworkError> {
        let text = text.into();
        self.call(|reply| Command::Send { text, reply }).await
    }

    /// Accept the pending invitation from `peer`.
    pub async fn accept_invitation(&self, peer: &PeerId) -> Result<(), NetworkError> {
        let peer = peer.clone();
        self.call(|reply| Command::Accept { peer, reply }).await
    }

    /// Decline the pending invitation from `peer`.
    pub async fn decline_invitation(&self, peer: &PeerId) -> Result<(), NetworkError> {
        let peer = peer.clone();
        self.call(|reply| Command::Decline { peer, reply }).await
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state.clone()
    }

    /// Current message log, oldest first.
    pub fn messages(&self) -> Vec<Message> {
        self.snapshot.borrow().messages.clone()
    }

    /// Full view of the node as of the last completed step.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    /// Wait until a published snapshot satisfies `condition`.
    pub async fn wait_for(
        &self,
        mut condition: impl FnMut(&Snapshot) -> bool,
    ) -> Result<Snapshot, NetworkError> {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(|s| condition(s))
            .await
            .map_err(|_| NetworkError::NotRunning)?;
        Ok(snapshot.clone())
    }

    /// Subscribe to UI notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Ask the loop to leave the session and exit.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, NetworkError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| NetworkError::NotRunning)?;
        response.await.map_err(|_| NetworkError::NotRunning)?
    }
}

/// A running chat node.
///
/// Create one per process. [`start()`](ChatNode::start) spawns the loop and
/// returns the handle the UI talks to.
pub struct ChatNode {
    identity: PeerIdentity,
    config: ChatConfig,
    handle: Option<ChatHandle>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ChatNode {
    pub fn new(identity: PeerIdentity, config: ChatConfig) -> Self {
        Self {
            identity,
            config,
            handle: None,
            shutdown_tx: None,
            task: None,
        }
    }

    /// Create a node with a fresh identity and default config.
    pub fn with_defaults(display_name: impl Into<String>) -> Self {
        Self::new(PeerIdentity::generate(display_name), ChatConfig::default())
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// The handle of the running loop.
    pub fn handle(&self) -> Result<ChatHandle, NetworkError> {
        self.handle.clone().ok_or(NetworkError::NotRunning)
    }

    /// Start the sequencing loop over `transport`, consuming the events it
    /// reports on `transport_events`. Starting a running node returns the
    /// existing handle.
    pub fn start(
        &mut self,
        transport: Arc<dyn Transport>,
        transport_events: mpsc::Receiver<TransportEvent>,
    ) -> Result<ChatHandle, NetworkError> {
        if let Some(handle) = &self.handle {
            if self.is_running() {
                return Ok(handle.clone());
            }
        }
        self.config.validate()?;

        let machine = ConnectionStateMachine::new(self.identity.clone(), &self.config, transport);
        let (command_tx, command_rx) = mpsc::channel(self.config.command_queue_capacity);
        let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::of(&machine));
        let (events_tx, _) = broadcast::channel(UI_EVENT_CAPACITY);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let loop_events = events_tx.clone();
        let task = tokio::spawn(async move {
            Self::event_loop(
                machine,
                command_rx,
                transport_events,
                snapshot_tx,
                loop_events,
                shutdown_rx,
            )
            .await;
        });

        let handle = ChatHandle {
            commands: command_tx,
            snapshot: snapshot_rx,
            events: events_tx,
            shutdown: shutdown_tx.clone(),
        };
        self.handle = Some(handle.clone());
        self.shutdown_tx = Some(shutdown_tx);
        self.task = Some(task);

        info!("ChatNode '{}' started", self.identity);
        Ok(handle)
    }

    /// Stop the loop. The session is left and discovery stopped first.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.handle = None;
        info!("ChatNode '{}' stopped", self.identity);
    }

    // -----------------------------------------------------------------------
    // Internal tasks
    // -----------------------------------------------------------------------

    async fn event_loop(
        mut machine: ConnectionStateMachine,
        mut commands: mpsc::Receiver<Command>,
        mut transport_events: mpsc::Receiver<TransportEvent>,
        snapshot_tx: watch::Sender<Snapshot>,
        events_tx: broadcast::Sender<NodeEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut expiry = tokio::time::interval(EXPIRY_TICK);
        expiry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let outcome = tokio::select! {
                Some(command) = commands.recv() => Some(Self::apply(&mut machine, command)),

                Some(event) = transport_events.recv() => {
                    machine.handle_transport_event(event);
                    None
                }

                _ = expiry.tick() => {
                    machine.expire_invitations(Instant::now());
                    None
                }

                _ = shutdown.recv() => {
                    debug!("Event loop shutting down");
                    machine.request_disconnect();
                    Self::publish(&mut machine, &snapshot_tx, &events_tx);
                    break;
                }
            };

            Self::publish(&mut machine, &snapshot_tx, &events_tx);
            if let Some(outcome) = outcome {
                outcome.deliver();
            }
        }
    }

    fn apply(machine: &mut ConnectionStateMachine, command: Command) -> Outcome {
        match command {
            Command::Browse(reply) => Outcome::Unit(reply, machine.request_browse()),
            Command::Advertise(reply) => Outcome::Unit(reply, machine.request_advertise()),
            Command::Disconnect(reply) => {
                machine.request_disconnect();
                Outcome::Unit(reply, Ok(()))
            }
            Command::Send { text, reply } => Outcome::Message(reply, machine.send_message(&text)),
            Command::Accept { peer, reply } => {
                Outcome::Unit(reply, machine.accept_invitation(&peer))
            }
            Command::Decline { peer, reply } => {
                Outcome::Unit(reply, machine.decline_invitation(&peer))
            }
        }
    }

    fn publish(
        machine: &mut ConnectionStateMachine,
        snapshot_tx: &watch::Sender<Snapshot>,
        events_tx: &broadcast::Sender<NodeEvent>,
    ) {
        // Some steps change the view without raising an event, e.g. a
        // peer re-announcing with new metadata.
        let next = Snapshot::of(machine);
        snapshot_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        for event in machine.take_events() {
            // No subscribers is fine.
            let _ = events_tx.send(event);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
