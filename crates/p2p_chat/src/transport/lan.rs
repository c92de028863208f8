//! LAN transport: UDP broadcast discovery plus WebSocket links.
//!
//! An advertiser binds a WebSocket listener and broadcasts an
//! [`Announcement`] every `announce_interval`. A browser listens on the
//! discovery port, reports announcers of the same service type, and forgets
//! peers that stay silent for longer than `peer_ttl`.
//!
//! Inviting a peer dials its listener and sends an `Invite` control frame;
//! the invitee answers with `InviteReply`. An accepted socket becomes the
//! session link: chat payloads travel as binary frames, and `Goodbye` (or the
//! socket closing) ends it.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{WebSocketStream, accept_async, connect_async};
use tracing::{debug, info, trace, warn};

use crate::config::LanConfig;
use crate::discovery::DiscoveredPeer;
use crate::error::NetworkError;
use crate::identity::{PeerId, PeerIdentity};
use crate::invitation::Invitation;
use crate::session::PeerSessionState;
use crate::transport::{SendMode, Transport, TransportEvent};

/// Wire protocol version carried in announcements.
pub const PROTOCOL_VERSION: u32 = 1;

/// Frames queued per link before `send` reports back-pressure.
const LINK_QUEUE: usize = 256;

/// How long an inbound socket may take to present its invitation.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Presence packet broadcast by an advertiser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub service_type: String,
    pub peer: PeerIdentity,
    /// Port of the advertiser's WebSocket listener.
    pub port: u16,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub version: u32,
    /// Sent once when the advertiser stops.
    #[serde(default)]
    pub leaving: bool,
}

impl Announcement {
    pub fn new(service_type: impl Into<String>, peer: PeerIdentity, port: u16) -> Self {
        Self {
            service_type: service_type.into(),
            peer,
            port,
            metadata: BTreeMap::new(),
            version: PROTOCOL_VERSION,
            leaving: false,
        }
    }
}

/// Control frames exchanged as JSON text over a link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    /// First frame on a dialed socket.
    Invite {
        from: PeerIdentity,
        #[serde(default)]
        context: Option<Vec<u8>>,
        timeout_ms: u64,
    },
    /// The invitee's answer.
    InviteReply { accept: bool },
    /// The sender is leaving the session.
    Goodbye,
}

impl ControlFrame {
    pub fn to_message(&self) -> Result<WsMessage, NetworkError> {
        Ok(WsMessage::Text(serde_json::to_string(self)?.into()))
    }

    pub fn from_text(text: &str) -> Result<Self, NetworkError> {
        serde_json::from_str(text).map_err(|e| NetworkError::Decode(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct KnownPeer {
    peer: DiscoveredPeer,
    addr: SocketAddr,
    last_seen: Instant,
}

#[derive(Debug)]
struct Link {
    id: u64,
    identity: PeerIdentity,
    tx: mpsc::Sender<WsMessage>,
}

#[derive(Debug)]
struct LanState {
    local: PeerIdentity,
    browser: Option<broadcast::Sender<()>>,
    advertiser: Option<broadcast::Sender<()>>,
    known: HashMap<PeerId, KnownPeer>,
    links: HashMap<PeerId, Link>,
    /// Bumped on disconnect so in-flight handshakes are abandoned.
    epoch: u64,
    next_link_id: u64,
    listen_addr: Option<SocketAddr>,
    /// Bound on the first browse and shared by every browser after it.
    discovery_socket: Option<Arc<UdpSocket>>,
}

#[derive(Clone)]
struct Shared {
    state: Arc<Mutex<LanState>>,
    events: mpsc::Sender<TransportEvent>,
}

impl Shared {
    async fn emit(&self, event: TransportEvent) {
        if self.events.send(event).await.is_err() {
            debug!("Event receiver closed");
        }
    }

    fn try_emit(&self, event: TransportEvent) {
        if let Err(e) = self.events.try_send(event) {
            warn!("Dropping transport event: {e}");
        }
    }

    /// Register an accepted socket as the link to `identity` and start its
    /// reader and writer tasks. Returns `false` if a disconnect happened
    /// since `epoch` was read.
    async fn open_link<S>(&self, identity: PeerIdentity, ws: WebSocketStream<S>, epoch: u64) -> bool
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<WsMessage>(LINK_QUEUE);
        let link_id = {
            let mut state = self.state.lock();
            if state.epoch != epoch {
                return false;
            }
            state.next_link_id += 1;
            let id = state.next_link_id;
            let replaced = state.links.insert(
                identity.id.clone(),
                Link {
                    id,
                    identity: identity.clone(),
                    tx,
                },
            );
            if replaced.is_some() {
                debug!("Replacing existing link to {identity}");
            }
            id
        };

        for state in [PeerSessionState::Connecting, PeerSessionState::Connected] {
            self.emit(TransportEvent::SessionStateChanged {
                peer: identity.clone(),
                state,
            })
            .await;
        }
        info!("Link to {identity} established");

        let (mut sink, mut stream) = ws.split();

        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, WsMessage::Close(_));
                if let Err(e) = sink.send(msg).await {
                    debug!("Link write failed: {e}");
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let shared = self.clone();
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(WsMessage::Binary(bytes)) => {
                        shared
                            .emit(TransportEvent::DataReceived {
                                bytes: bytes.to_vec(),
                                from: identity.clone(),
                            })
                            .await;
                    }
                    Ok(WsMessage::Text(text)) => match ControlFrame::from_text(text.as_str()) {
                        Ok(ControlFrame::Goodbye) => {
                            debug!("{identity} said goodbye");
                            break;
                        }
                        Ok(frame) => debug!("Unexpected control frame from {identity}: {frame:?}"),
                        Err(e) => warn!("Bad control frame from {identity}: {e}"),
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!("Read error from {identity}: {e}");
                        break;
                    }
                }
            }

            let removed = {
                let mut state = shared.state.lock();
                match state.links.get(&identity.id) {
                    Some(link) if link.id == link_id => state.links.remove(&identity.id).is_some(),
                    _ => false,
                }
            };
            if removed {
                info!("Link to {identity} closed");
                shared
                    .emit(TransportEvent::SessionStateChanged {
                        peer: identity,
                        state: PeerSessionState::NotConnected,
                    })
                    .await;
            }
        });
        true
    }
}

fn runtime() -> Result<Handle, NetworkError> {
    Handle::try_current().map_err(|e| NetworkError::Transport(format!("No async runtime: {e}")))
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Transport for peers on the same broadcast domain.
pub struct LanTransport {
    config: LanConfig,
    shared: Shared,
}

impl LanTransport {
    pub fn new(
        local: PeerIdentity,
        config: LanConfig,
        events: mpsc::Sender<TransportEvent>,
    ) -> Self {
        Self {
            config,
            shared: Shared {
                state: Arc::new(Mutex::new(LanState {
                    local,
                    browser: None,
                    advertiser: None,
                    known: HashMap::new(),
                    links: HashMap::new(),
                    epoch: 0,
                    next_link_id: 0,
                    listen_addr: None,
                    discovery_socket: None,
                })),
                events,
            },
        }
    }

    /// Address of the WebSocket listener while advertising.
    pub fn local_listen_addr(&self) -> Option<SocketAddr> {
        self.shared.state.lock().listen_addr
    }

    /// Make a peer at a known address invitable without waiting for its
    /// announcement.
    pub fn add_known_peer(&self, identity: PeerIdentity, addr: SocketAddr) {
        self.shared.state.lock().known.insert(
            identity.id.clone(),
            KnownPeer {
                peer: DiscoveredPeer::new(identity),
                addr,
                last_seen: Instant::now(),
            },
        );
    }

    /// Ids of peers with an open link.
    pub fn links(&self) -> Vec<PeerId> {
        self.shared.state.lock().links.keys().cloned().collect()
    }

    /// The socket browsers listen on. The discovery port stays bound from
    /// the first browse until the transport is dropped.
    fn discovery_socket(&self) -> Result<Arc<UdpSocket>, NetworkError> {
        let mut state = self.shared.state.lock();
        if let Some(socket) = &state.discovery_socket {
            return Ok(socket.clone());
        }

        let bind_addr = SocketAddr::from(([0, 0, 0, 0], self.config.discovery_port));
        let socket = std::net::UdpSocket::bind(bind_addr)
            .and_then(|s| s.set_nonblocking(true).map(|_| s))
            .and_then(UdpSocket::from_std)
            .map_err(|e| NetworkError::Discovery(format!("Bind {bind_addr} failed: {e}")))?;
        debug!("Discovery socket bound on {bind_addr}");

        let socket = Arc::new(socket);
        state.discovery_socket = Some(socket.clone());
        Ok(socket)
    }
}

impl Transport for LanTransport {
    fn start_browsing(&self, service_type: &str, local: &PeerIdentity) -> Result<(), NetworkError> {
        let runtime = runtime()?;
        let _guard = runtime.enter();
        let socket = self.discovery_socket()?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        {
            let mut state = self.shared.state.lock();
            state.local = local.clone();
            if let Some(previous) = state.browser.replace(shutdown_tx) {
                let _ = previous.send(());
            }
        }

        info!(
            "Browsing for '{service_type}' on port {}",
            self.config.discovery_port
        );
        runtime.spawn(run_browser(
            self.shared.clone(),
            socket,
            service_type.to_string(),
            local.id.clone(),
            self.config.peer_ttl,
            shutdown_rx,
        ));
        Ok(())
    }

    fn stop_browsing(&self) {
        let mut state = self.shared.state.lock();
        if let Some(browser) = state.browser.take() {
            let _ = browser.send(());
            state.known.clear();
            debug!("Browser stopped");
        }
    }

    fn start_advertising(
        &self,
        service_type: &str,
        local: &PeerIdentity,
    ) -> Result<(), NetworkError> {
        let runtime = runtime()?;
        let _guard = runtime.enter();

        let listener = std::net::TcpListener::bind(self.config.listen_addr)?;
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        let listen_addr = listener.local_addr()?;

        let announcer = std::net::UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0)))
            .and_then(|s| s.set_broadcast(true).map(|_| s))
            .and_then(|s| s.set_nonblocking(true).map(|_| s))
            .and_then(UdpSocket::from_std);
        let announcer = match announcer {
            Ok(socket) => Some(socket),
            Err(e) => {
                warn!("Announcements disabled, cannot open broadcast socket: {e}");
                None
            }
        };

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        {
            let mut state = self.shared.state.lock();
            state.local = local.clone();
            state.listen_addr = Some(listen_addr);
            if let Some(previous) = state.advertiser.replace(shutdown_tx) {
                let _ = previous.send(());
            }
        }

        info!("Advertising '{service_type}' with listener on {listen_addr}");
        let announcement = Announcement::new(service_type, local.clone(), listen_addr.port());
        let target = SocketAddr::new(self.config.announce_addr, self.config.discovery_port);
        runtime.spawn(run_advertiser(
            self.shared.clone(),
            listener,
            announcer,
            announcement,
            target,
            self.config.announce_interval,
            shutdown_rx,
        ));
        Ok(())
    }

    fn stop_advertising(&self) {
        let mut state = self.shared.state.lock();
        if let Some(advertiser) = state.advertiser.take() {
            let _ = advertiser.send(());
            state.listen_addr = None;
            debug!("Advertiser stopped");
        }
    }

    fn invite(
        &self,
        peer: &PeerId,
        context: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<(), NetworkError> {
        let runtime = runtime()?;
        let (target, addr, local, epoch) = {
            let state = self.shared.state.lock();
            let known = state
                .known
                .get(peer)
                .ok_or_else(|| NetworkError::UnknownPeer(peer.to_string()))?;
            (
                known.peer.identity.clone(),
                known.addr,
                state.local.clone(),
                state.epoch,
            )
        };

        let frame = ControlFrame::Invite {
            from: local,
            context,
            timeout_ms: timeout.as_millis() as u64,
        }
        .to_message()?;

        let shared = self.shared.clone();
        runtime.spawn(async move {
            let url = format!("ws://{addr}");
            let dialed = tokio::time::timeout(timeout, async {
                let (mut ws, _) = connect_async(url.as_str())
                    .await
                    .map_err(|e| NetworkError::Transport(format!("Connect to {addr} failed: {e}")))?;
                ws.send(frame)
                    .await
                    .map_err(|e| NetworkError::Transport(format!("Send invite: {e}")))?;
                let accepted = read_reply(&mut ws).await?;
                Ok::<_, NetworkError>((ws, accepted))
            })
            .await
            .unwrap_or(Err(NetworkError::Timeout(timeout)));

            match dialed {
                Ok((ws, true)) => {
                    if !shared.open_link(target.clone(), ws, epoch).await {
                        debug!("Invitation to {target} abandoned by disconnect");
                    }
                }
                Ok((_, false)) => {
                    info!("{target} declined the invitation");
                    shared
                        .emit(TransportEvent::SessionStateChanged {
                            peer: target,
                            state: PeerSessionState::NotConnected,
                        })
                        .await;
                }
                Err(e) => {
                    warn!("Invitation to {target} failed: {e}");
                    shared
                        .emit(TransportEvent::SessionStateChanged {
                            peer: target,
                            state: PeerSessionState::NotConnected,
                        })
                        .await;
                }
            }
        });
        Ok(())
    }

    fn send(&self, payload: &[u8], to: &[PeerId], _mode: SendMode) -> Result<(), NetworkError> {
        let state = self.shared.state.lock();
        let links = to
            .iter()
            .map(|peer| {
                state
                    .links
                    .get(peer)
                    .ok_or_else(|| NetworkError::Transport(format!("not connected to {peer}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        for link in links {
            link.tx
                .try_send(WsMessage::Binary(payload.to_vec().into()))
                .map_err(|e| NetworkError::Transport(format!("queue for {}: {e}", link.identity)))?;
        }
        Ok(())
    }

    fn disconnect(&self) {
        let links: Vec<Link> = {
            let mut state = self.shared.state.lock();
            state.epoch += 1;
            state.links.drain().map(|(_, link)| link).collect()
        };

        let goodbye = ControlFrame::Goodbye.to_message();
        for link in links {
            if let Ok(goodbye) = &goodbye {
                let _ = link.tx.try_send(goodbye.clone());
            }
            let _ = link.tx.try_send(WsMessage::Close(None));
            info!("Left session with {}", link.identity);
            self.shared.try_emit(TransportEvent::SessionStateChanged {
                peer: link.identity,
                state: PeerSessionState::NotConnected,
            });
        }
    }
}

impl Drop for LanTransport {
    fn drop(&mut self) {
        self.stop_browsing();
        self.stop_advertising();
        self.disconnect();
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

async fn read_reply<S>(ws: &mut WebSocketStream<S>) -> Result<bool, NetworkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(msg) = ws.next().await {
        match msg.map_err(|e| NetworkError::Transport(e.to_string()))? {
            WsMessage::Text(text) => match ControlFrame::from_text(text.as_str())? {
                ControlFrame::InviteReply { accept } => return Ok(accept),
                frame => debug!("Ignoring {frame:?} before reply"),
            },
            WsMessage::Close(_) => break,
            _ => {}
        }
    }
    Err(NetworkError::Transport("closed before reply".to_string()))
}

async fn read_invite<S>(
    ws: &mut WebSocketStream<S>,
) -> Result<(PeerIdentity, Option<Vec<u8>>, Duration), NetworkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(msg) = ws.next().await {
        match msg.map_err(|e| NetworkError::Transport(e.to_string()))? {
            WsMessage::Text(text) => match ControlFrame::from_text(text.as_str())? {
                ControlFrame::Invite {
                    from,
                    context,
                    timeout_ms,
                } => return Ok((from, context, Duration::from_millis(timeout_ms))),
                frame => debug!("Ignoring {frame:?} before invite"),
            },
            WsMessage::Close(_) => break,
            _ => {}
        }
    }
    Err(NetworkError::Transport("closed before invite".to_string()))
}

async fn handle_inbound(shared: Shared, stream: TcpStream, peer_addr: SocketAddr) {
    let mut ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket accept failed for {peer_addr}: {e}");
            return;
        }
    };

    let (from, context, timeout) =
        match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_invite(&mut ws)).await {
            Ok(Ok(invite)) => invite,
            Ok(Err(e)) => {
                debug!("No invitation from {peer_addr}: {e}");
                return;
            }
            Err(_) => {
                debug!("{peer_addr} sent no invitation in time");
                return;
            }
        };

    let epoch = shared.state.lock().epoch;
    let (invitation, answer) = Invitation::new(from.clone(), context);
    shared
        .emit(TransportEvent::InvitationReceived(invitation))
        .await;

    let accepted = matches!(tokio::time::timeout(timeout, answer).await, Ok(Ok(true)));
    let reply = match (ControlFrame::InviteReply { accept: accepted }).to_message() {
        Ok(reply) => reply,
        Err(e) => {
            warn!("Cannot encode reply: {e}");
            return;
        }
    };
    if let Err(e) = ws.send(reply).await {
        debug!("Reply to {from} failed: {e}");
        return;
    }

    if !accepted {
        let _ = ws.close(None).await;
        return;
    }
    if !shared.open_link(from.clone(), ws, epoch).await {
        debug!("Accepted invitation from {from} abandoned by disconnect");
    }
}

async fn announce(socket: &UdpSocket, announcement: &Announcement, target: SocketAddr) {
    let bytes = match serde_json::to_vec(announcement) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Cannot encode announcement: {e}");
            return;
        }
    };
    match socket.send_to(&bytes, target).await {
        Ok(_) => trace!("Announcement sent"),
        Err(e) => debug!("Announcement send failed: {e}"),
    }
}

async fn run_advertiser(
    shared: Shared,
    listener: TcpListener,
    announcer: Option<UdpSocket>,
    announcement: Announcement,
    target: SocketAddr,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Some(socket) = &announcer {
                    announce(socket, &announcement, target).await;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    debug!("Inbound connection from {peer_addr}");
                    tokio::spawn(handle_inbound(shared.clone(), stream, peer_addr));
                }
                Err(e) => warn!("TCP accept failed: {e}"),
            },
            _ = shutdown.recv() => break,
        }
    }

    if let Some(socket) = &announcer {
        let leaving = Announcement {
            leaving: true,
            ..announcement
        };
        announce(socket, &leaving, target).await;
    }
    debug!("Advertiser shut down");
}

async fn run_browser(
    shared: Shared,
    socket: Arc<UdpSocket>,
    service_type: String,
    local_id: PeerId,
    peer_ttl: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; 4096];
    let mut prune = tokio::time::interval((peer_ttl / 2).max(Duration::from_millis(100)));
    loop {
        tokio::select! {
            biased;

            _ = shutdown.recv() => break,
            received = socket.recv_from(&mut buf) => {
                let (len, src) = match received {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("Discovery recv error: {e}");
                        continue;
                    }
                };
                let announcement = match serde_json::from_slice::<Announcement>(&buf[..len]) {
                    Ok(announcement) => announcement,
                    Err(e) => {
                        trace!("Ignoring packet from {src}: {e}");
                        continue;
                    }
                };
                if announcement.peer.id == local_id
                    || announcement.service_type != service_type
                    || announcement.version != PROTOCOL_VERSION
                {
                    continue;
                }
                if let Some(event) = observe(&shared, announcement, src) {
                    shared.emit(event).await;
                }
            }
            _ = prune.tick() => {
                let lost = prune_silent(&shared, peer_ttl);
                for id in lost {
                    shared.emit(TransportEvent::PeerLost(id)).await;
                }
            }
        }
    }
    debug!("Browser shut down");
}

/// Fold an announcement into the known-peer table. Returns the event to
/// report, if any.
fn observe(shared: &Shared, announcement: Announcement, src: SocketAddr) -> Option<TransportEvent> {
    let mut state = shared.state.lock();
    let id = announcement.peer.id.clone();

    if announcement.leaving {
        return state.known.remove(&id).map(|known| {
            debug!("{} stopped advertising", known.peer.identity);
            TransportEvent::PeerLost(id)
        });
    }

    let addr = SocketAddr::new(src.ip(), announcement.port);
    match state.known.get_mut(&id) {
        Some(known) => {
            known.addr = addr;
            known.last_seen = Instant::now();
            None
        }
        None => {
            let peer = DiscoveredPeer {
                identity: announcement.peer,
                metadata: announcement.metadata,
            };
            debug!("Discovered {} at {addr}", peer.identity);
            state.known.insert(
                id,
                KnownPeer {
                    peer: peer.clone(),
                    addr,
                    last_seen: Instant::now(),
                },
            );
            Some(TransportEvent::PeerFound(peer))
        }
    }
}

fn prune_silent(shared: &Shared, peer_ttl: Duration) -> Vec<PeerId> {
    let mut state = shared.state.lock();
    let now = Instant::now();
    let lost: Vec<PeerId> = state
        .known
        .iter()
        .filter(|(_, known)| now.duration_since(known.last_seen) > peer_ttl)
        .map(|(id, _)| id.clone())
        .collect();
    for id in &lost {
        state.known.remove(id);
        debug!("Peer {id} went silent");
    }
    lost
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
