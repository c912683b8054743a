//! Client-side peer session manager.
//!
//! One actor task owns every [`PeerSession`] of the local client, keyed by
//! the remote connection identity. It is driven by three inputs: messages
//! from the signaling server, commands from the application (device switch,
//! mute, leave), and progress reports from the negotiation tasks and links
//! it spawned.
//!
//! Per remote identity a session moves through
//! `absent → pending(role) → negotiating → established → closed`. A second
//! `peer-joined` for an identity that already has a session is dropped, so
//! each pair of occupants forms exactly one session.
//!
//! Every session carries an epoch. Reports tagged with an epoch that no
//! longer matches the live session come from something already torn down and
//! are ignored, which lets a close race an in-flight negotiation step safely.

pub mod link;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::config::SessionConfig;
use crate::connection::{Role, SessionMonitor, SessionState, SessionSummary};
use crate::directory::DirectoryEntry;
use crate::error::{Error, Result};
use crate::media::{LocalMedia, MediaKind, RemoteMedia};
use crate::room::RoomName;
use crate::signaling::{ClientMessage, ConnectionId, ServerMessage, SignalPayload};

pub use link::{LinkObserver, PeerConnector, PeerLink};

/// Notifications for the UI collaborator.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Welcome {
        id: ConnectionId,
    },
    OccupantsKnown {
        room: RoomName,
        occupants: Vec<ConnectionId>,
    },
    RoomFull {
        room: RoomName,
    },
    SessionEstablished {
        peer: ConnectionId,
        media: RemoteMedia,
    },
    SessionClosed {
        peer: ConnectionId,
    },
    /// The call did not connect. The session is gone and is not retried.
    CallFailed {
        peer: ConnectionId,
        reason: CallFailure,
    },
    Directory {
        entries: Vec<DirectoryEntry>,
    },
    Rejected {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallFailure {
    #[error("negotiation timed out")]
    NegotiationTimeout,
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("connection terminated: {0}")]
    Terminated(String),
}

enum Command {
    Server(ServerMessage),
    Call(ConnectionId),
    SwitchMedia(LocalMedia),
    SetTrackEnabled(MediaKind, bool),
    Leave(oneshot::Sender<()>),
}

pub(crate) enum Internal {
    Opened {
        peer: ConnectionId,
        epoch: u64,
        link: Arc<dyn PeerLink>,
        outgoing: ClientMessage,
    },
    StepFailed {
        peer: ConnectionId,
        epoch: u64,
        error: String,
    },
    Connected {
        peer: ConnectionId,
        epoch: u64,
        media: RemoteMedia,
    },
    Terminated {
        peer: ConnectionId,
        epoch: u64,
        reason: String,
    },
    Deadline {
        peer: ConnectionId,
        epoch: u64,
    },
}

type TrackPlan = Vec<(MediaKind, Option<Arc<TrackLocalStaticSample>>)>;

/// Work applied to an open link, strictly in order.
enum LinkOp {
    Answer(SignalPayload),
    Tracks(TrackPlan),
}

struct PeerSession {
    role: Role,
    state: SessionState,
    epoch: u64,
    /// Set once the first negotiation step has produced a link.
    ops: Option<mpsc::UnboundedSender<LinkOp>>,
    /// Runs until the first negotiation step finishes or is abandoned.
    negotiation: Option<JoinHandle<()>>,
    driver: Option<JoinHandle<()>>,
    /// Signals that arrived before the link existed.
    pending: Vec<SignalPayload>,
    media_generation: u64,
    remote: Option<RemoteMedia>,
    cancel: CancellationToken,
    deadline: CancellationToken,
}

/// Handle to the session actor. Cheap to clone; dropping every handle tears
/// all sessions down.
#[derive(Clone)]
pub struct SessionManager {
    commands: mpsc::UnboundedSender<Command>,
    monitor: SessionMonitor,
}

impl SessionManager {
    /// Starts the actor. Outgoing signaling messages are written to
    /// `signals`; UI notifications come out of the returned receiver.
    pub fn spawn(
        connector: Arc<dyn PeerConnector>,
        media: LocalMedia,
        config: SessionConfig,
        signals: mpsc::UnboundedSender<ClientMessage>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (internal, internal_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        let monitor = SessionMonitor::new();

        let actor = Actor {
            connector,
            config,
            media,
            media_generation: 0,
            disabled: HashSet::new(),
            sessions: HashMap::new(),
            next_epoch: 0,
            internal,
            signals,
            events,
            monitor: monitor.clone(),
        };
        tokio::spawn(actor.run(command_rx, internal_rx));

        (Self { commands, monitor }, event_rx)
    }

    pub fn handle_server_message(&self, msg: ServerMessage) -> Result<()> {
        self.send(Command::Server(msg))
    }

    /// Initiates a session with a peer outside the room, typically one found
    /// in the name directory.
    pub fn call(&self, peer: ConnectionId) -> Result<()> {
        self.send(Command::Call(peer))
    }

    /// Replaces the outgoing tracks of every live session, e.g. after a
    /// camera flip. No renegotiation takes place.
    pub fn switch_media(&self, media: LocalMedia) -> Result<()> {
        self.send(Command::SwitchMedia(media))
    }

    pub fn set_track_enabled(&self, kind: MediaKind, enabled: bool) -> Result<()> {
        self.send(Command::SetTrackEnabled(kind, enabled))
    }

    /// Closes every session and stops the actor. Resolves once all links are
    /// closed, including those still negotiating.
    pub async fn leave(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Leave(tx))?;
        rx.await.map_err(|_| Error::ChannelClosed)
    }

    pub fn sessions(&self) -> Vec<SessionSummary> {
        self.monitor.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<SessionSummary>> {
        self.monitor.subscribe()
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::ChannelClosed)
    }
}

struct Actor {
    connector: Arc<dyn PeerConnector>,
    config: SessionConfig,
    media: LocalMedia,
    media_generation: u64,
    disabled: HashSet<MediaKind>,
    sessions: HashMap<ConnectionId, PeerSession>,
    next_epoch: u64,
    internal: mpsc::UnboundedSender<Internal>,
    signals: mpsc::UnboundedSender<ClientMessage>,
    events: mpsc::UnboundedSender<SessionEvent>,
    monitor: SessionMonitor,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        let done = loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Server(msg)) => self.on_server_message(msg),
                    Some(Command::Call(peer)) => self.start_session(peer, None),
                    Some(Command::SwitchMedia(media)) => self.switch_media(media),
                    Some(Command::SetTrackEnabled(kind, enabled)) => self.set_track_enabled(kind, enabled),
                    Some(Command::Leave(done)) => break Some(done),
                    None => break None,
                },
                Some(report) = internal.recv() => self.on_internal(report),
            }
        };

        // Refuse further commands before reporting completion.
        commands.close();
        self.close_all(internal).await;
        if let Some(done) = done {
            let _ = done.send(());
        }
        debug!("session manager stopped");
    }

    fn on_server_message(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::Welcome { id } => {
                info!(id = %id, "connected to signaling server");
                self.emit(SessionEvent::Welcome { id });
            }
            ServerMessage::RoomSnapshot { room, occupants } => {
                info!(room = %room, occupants = occupants.len(), "joined room");
                self.emit(SessionEvent::OccupantsKnown {
                    room,
                    occupants: occupants.clone(),
                });
                for peer in occupants {
                    self.start_session(peer, None);
                }
            }
            ServerMessage::RoomFull { room } => {
                warn!(room = %room, "room is full");
                self.emit(SessionEvent::RoomFull { room });
            }
            ServerMessage::PeerJoined { sender, payload } => {
                self.start_session(sender, Some(payload));
            }
            ServerMessage::PeerSignalReturned { sender, payload } => {
                self.apply_signal(&sender, payload);
            }
            ServerMessage::PeerLeft { id } => {
                if !self.close_session(&id) {
                    debug!(peer = %id, "peer-left for unknown peer");
                }
            }
            ServerMessage::Directory { entries } => {
                self.emit(SessionEvent::Directory { entries });
            }
            ServerMessage::Error { message } => {
                warn!("signaling server rejected a request: {}", message);
                self.emit(SessionEvent::Rejected { message });
            }
        }
    }

    /// Creates a session for `peer` unless one already exists. Without an
    /// offer the local side initiates.
    fn start_session(&mut self, peer: ConnectionId, offer: Option<SignalPayload>) {
        if let Some(existing) = self.sessions.get(&peer) {
            debug!(peer = %peer, state = %existing.state, "duplicate join notification ignored");
            return;
        }

        let role = if offer.is_some() {
            Role::Responder
        } else {
            Role::Initiator
        };
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        let cancel = CancellationToken::new();
        let deadline = cancel.child_token();

        let mut session = PeerSession {
            role,
            state: SessionState::Pending(role),
            epoch,
            ops: None,
            negotiation: None,
            driver: None,
            pending: Vec::new(),
            media_generation: self.media_generation,
            remote: None,
            cancel: cancel.clone(),
            deadline: deadline.clone(),
        };
        debug!(peer = %peer, state = %session.state, "session created");
        session.state = SessionState::Negotiating;
        self.sessions.insert(peer.clone(), session);
        self.publish();

        let timeout = self.config.negotiation_timeout;
        let internal = self.internal.clone();
        let timed_peer = peer.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = deadline.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    let _ = internal.send(Internal::Deadline { peer: timed_peer, epoch });
                }
            }
        });

        let observer = LinkObserver::new(peer.clone(), epoch, self.internal.clone());
        let negotiation = tokio::spawn(negotiate(
            self.connector.clone(),
            peer.clone(),
            epoch,
            offer,
            self.media.clone(),
            observer,
            self.internal.clone(),
            cancel,
        ));
        if let Some(session) = self.sessions.get_mut(&peer) {
            session.negotiation = Some(negotiation);
        }
    }

    fn apply_signal(&mut self, sender: &ConnectionId, payload: SignalPayload) {
        let Some(session) = self.sessions.get_mut(sender) else {
            debug!(peer = %sender, "signal from unknown peer ignored");
            return;
        };
        match &session.ops {
            Some(ops) => {
                let _ = ops.send(LinkOp::Answer(payload));
            }
            None => session.pending.push(payload),
        }
    }

    fn on_internal(&mut self, report: Internal) {
        match report {
            Internal::Opened {
                peer,
                epoch,
                link,
                outgoing,
            } => self.link_opened(peer, epoch, link, outgoing),
            Internal::StepFailed { peer, epoch, error } => {
                if self.is_current(&peer, epoch) {
                    self.fail_session(&peer, CallFailure::Negotiation(error));
                }
            }
            Internal::Connected { peer, epoch, media } => {
                let Some(session) = self
                    .sessions
                    .get_mut(&peer)
                    .filter(|s| s.epoch == epoch && !s.state.is_established())
                else {
                    return;
                };
                session.state = SessionState::Established;
                session.deadline.cancel();
                session.remote = Some(media.clone());
                info!(peer = %peer, role = %session.role, "session established");
                self.publish();
                self.emit(SessionEvent::SessionEstablished { peer, media });
            }
            Internal::Terminated {
                peer,
                epoch,
                reason,
            } => {
                let Some(session) = self.sessions.get(&peer).filter(|s| s.epoch == epoch) else {
                    return;
                };
                if session.state.is_established() {
                    debug!(peer = %peer, "link terminated: {}", reason);
                    self.close_session(&peer);
                } else {
                    self.fail_session(&peer, CallFailure::Terminated(reason));
                }
            }
            Internal::Deadline { peer, epoch } => {
                let expired = self
                    .sessions
                    .get(&peer)
                    .map_or(false, |s| s.epoch == epoch && !s.state.is_established());
                if expired {
                    self.fail_session(&peer, CallFailure::NegotiationTimeout);
                }
            }
        }
    }

    fn link_opened(
        &mut self,
        peer: ConnectionId,
        epoch: u64,
        link: Arc<dyn PeerLink>,
        outgoing: ClientMessage,
    ) {
        let plan = self.track_plan(&[MediaKind::Audio, MediaKind::Video]);
        let generation = self.media_generation;
        let has_disabled = !self.disabled.is_empty();

        let Some(session) = self.sessions.get_mut(&peer).filter(|s| s.epoch == epoch) else {
            debug!(peer = %peer, "link opened for a closed session");
            tokio::spawn(async move { close_link(&peer, link.as_ref()).await });
            return;
        };

        let (ops, ops_rx) = mpsc::unbounded_channel();
        if session.media_generation != generation || has_disabled {
            let _ = ops.send(LinkOp::Tracks(plan));
            session.media_generation = generation;
        }
        for payload in session.pending.drain(..) {
            let _ = ops.send(LinkOp::Answer(payload));
        }
        session.driver = Some(tokio::spawn(drive_link(
            peer.clone(),
            epoch,
            link,
            ops_rx,
            self.internal.clone(),
            session.cancel.clone(),
        )));
        session.ops = Some(ops);

        if self.signals.send(outgoing).is_err() {
            warn!(peer = %peer, "signaling channel closed, offer not sent");
        }
    }

    fn switch_media(&mut self, media: LocalMedia) {
        self.media = media;
        self.media_generation += 1;
        let plan = self.track_plan(&[MediaKind::Audio, MediaKind::Video]);
        let generation = self.media_generation;

        let mut updated = 0;
        for session in self.sessions.values_mut() {
            if let Some(ops) = &session.ops {
                let _ = ops.send(LinkOp::Tracks(plan.clone()));
                session.media_generation = generation;
                updated += 1;
            }
        }
        info!(sessions = updated, "switched local media");
    }

    fn set_track_enabled(&mut self, kind: MediaKind, enabled: bool) {
        if enabled {
            self.disabled.remove(&kind);
        } else {
            self.disabled.insert(kind);
        }
        let plan = self.track_plan(&[kind]);
        for session in self.sessions.values() {
            if let Some(ops) = &session.ops {
                let _ = ops.send(LinkOp::Tracks(plan.clone()));
            }
        }
        info!(kind = %kind, enabled, "local track toggled");
    }

    fn track_plan(&self, kinds: &[MediaKind]) -> TrackPlan {
        kinds
            .iter()
            .map(|&kind| {
                let track = if self.disabled.contains(&kind) {
                    None
                } else {
                    self.media.track(kind)
                };
                (kind, track)
            })
            .collect()
    }

    /// Removes a session after a departure. Returns false if none existed.
    fn close_session(&mut self, peer: &ConnectionId) -> bool {
        let Some(session) = self.sessions.remove(peer) else {
            return false;
        };
        info!(peer = %peer, role = %session.role, "session closed");
        teardown(session);
        self.publish();
        self.emit(SessionEvent::SessionClosed { peer: peer.clone() });
        true
    }

    fn fail_session(&mut self, peer: &ConnectionId, reason: CallFailure) {
        let Some(session) = self.sessions.remove(peer) else {
            return;
        };
        warn!(peer = %peer, role = %session.role, "call did not connect: {}", reason);
        teardown(session);
        self.publish();
        self.emit(SessionEvent::CallFailed {
            peer: peer.clone(),
            reason,
        });
    }

    /// Tears down every session and waits until each link is closed,
    /// including links whose opening report was still queued.
    async fn close_all(&mut self, mut internal: mpsc::UnboundedReceiver<Internal>) {
        let mut tasks = Vec::new();
        let peers: Vec<ConnectionId> = self.sessions.keys().cloned().collect();
        for peer in peers {
            if let Some(mut session) = self.sessions.remove(&peer) {
                tasks.extend(session.negotiation.take());
                tasks.extend(session.driver.take());
                teardown(session);
                self.emit(SessionEvent::SessionClosed { peer });
            }
        }
        self.publish();
        futures::future::join_all(tasks).await;

        internal.close();
        while let Ok(report) = internal.try_recv() {
            if let Internal::Opened { peer, link, .. } = report {
                close_link(&peer, link.as_ref()).await;
            }
        }
        info!("left room");
    }

    fn is_current(&self, peer: &ConnectionId, epoch: u64) -> bool {
        self.sessions.get(peer).map_or(false, |s| s.epoch == epoch)
    }

    fn publish(&self) {
        self.monitor.publish(
            self.sessions
                .iter()
                .map(|(peer, s)| SessionSummary {
                    peer: peer.clone(),
                    role: s.role,
                    state: s.state,
                })
                .collect(),
        );
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

/// Releases everything a removed session holds. The link itself is closed by
/// whichever task currently owns it once it sees the cancellation.
fn teardown(mut session: PeerSession) {
    session.state = SessionState::Closed;
    session.cancel.cancel();
    if let Some(remote) = session.remote.take() {
        remote.release();
    }
}

/// Opens the link and runs the first negotiation step. The step races the
/// session's cancellation; an abandoned link is closed here.
#[allow(clippy::too_many_arguments)]
async fn negotiate(
    connector: Arc<dyn PeerConnector>,
    peer: ConnectionId,
    epoch: u64,
    offer: Option<SignalPayload>,
    media: LocalMedia,
    observer: LinkObserver,
    internal: mpsc::UnboundedSender<Internal>,
    cancel: CancellationToken,
) {
    let role = if offer.is_some() {
        Role::Responder
    } else {
        Role::Initiator
    };

    let link = match connector.open(&peer, role, &media, observer).await {
        Ok(link) => link,
        Err(e) => {
            let _ = internal.send(Internal::StepFailed {
                peer,
                epoch,
                error: e.to_string(),
            });
            return;
        }
    };

    let outcome = {
        let step = async {
            match offer {
                None => link
                    .create_offer()
                    .await
                    .map(|payload| ClientMessage::RelayForward {
                        target: peer.clone(),
                        payload,
                    }),
                Some(offer) => link
                    .accept_offer(offer)
                    .await
                    .map(|payload| ClientMessage::RelayReturn {
                        target: peer.clone(),
                        payload,
                    }),
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => None,
            result = step => Some(result),
        }
    };

    match outcome {
        Some(Ok(outgoing)) => {
            let opened = Internal::Opened {
                peer: peer.clone(),
                epoch,
                link,
                outgoing,
            };
            if let Err(mpsc::error::SendError(Internal::Opened { link, .. })) = internal.send(opened) {
                close_link(&peer, link.as_ref()).await;
            }
        }
        Some(Err(e)) => {
            close_link(&peer, link.as_ref()).await;
            let _ = internal.send(Internal::StepFailed {
                peer,
                epoch,
                error: e.to_string(),
            });
        }
        None => {
            debug!(peer = %peer, "negotiation abandoned");
            close_link(&peer, link.as_ref()).await;
        }
    }
}

/// Owns an open link: applies signals and track changes in arrival order
/// and closes the link once the session is cancelled.
async fn drive_link(
    peer: ConnectionId,
    epoch: u64,
    link: Arc<dyn PeerLink>,
    mut ops: mpsc::UnboundedReceiver<LinkOp>,
    internal: mpsc::UnboundedSender<Internal>,
    cancel: CancellationToken,
) {
    loop {
        let op = tokio::select! {
            _ = cancel.cancelled() => break,
            op = ops.recv() => match op {
                Some(op) => op,
                None => break,
            },
        };

        match op {
            LinkOp::Answer(payload) => {
                let result = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = link.accept_answer(payload) => result,
                };
                if let Err(e) = result {
                    let _ = internal.send(Internal::StepFailed {
                        peer: peer.clone(),
                        epoch,
                        error: e.to_string(),
                    });
                }
            }
            LinkOp::Tracks(plan) => {
                for (kind, track) in plan {
                    if let Err(e) = link.replace_track(kind, track).await {
                        warn!(peer = %peer, kind = %kind, "failed to replace track: {}", e);
                    }
                }
            }
        }
    }
    close_link(&peer, link.as_ref()).await;
}

async fn close_link(peer: &ConnectionId, link: &dyn PeerLink) {
    if let Err(e) = link.close().await {
        warn!(peer = %peer, "failed to close link: {}", e);
    }
}

#[cfg(test)]
mod tests;
