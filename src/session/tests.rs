use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use webrtc::track::track_local::TrackLocal;

use super::*;
use crate::config::ServerConfig;
use crate::hub::SignalingHub;
use crate::media::{FacingMode, MediaConstraints};

struct FakeLink {
    peer: ConnectionId,
    role: Role,
    observer: LinkObserver,
    stall: bool,
    answers: Mutex<Vec<SignalPayload>>,
    replaced: Mutex<Vec<(MediaKind, Option<String>)>>,
    closed: AtomicUsize,
}

impl FakeLink {
    fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    fn replaced(&self) -> Vec<(MediaKind, Option<String>)> {
        self.replaced.lock().clone()
    }
}

#[async_trait]
impl PeerLink for FakeLink {
    async fn create_offer(&self) -> Result<SignalPayload> {
        if self.stall {
            std::future::pending::<()>().await;
        }
        Ok(SignalPayload::new(json!({"type": "offer", "to": self.peer.as_str()})))
    }

    async fn accept_offer(&self, offer: SignalPayload) -> Result<SignalPayload> {
        if self.stall {
            std::future::pending::<()>().await;
        }
        self.answers.lock().push(offer);
        Ok(SignalPayload::new(json!({"type": "answer", "to": self.peer.as_str()})))
    }

    async fn accept_answer(&self, answer: SignalPayload) -> Result<()> {
        self.answers.lock().push(answer);
        Ok(())
    }

    async fn replace_track(
        &self,
        kind: MediaKind,
        track: Option<Arc<TrackLocalStaticSample>>,
    ) -> Result<()> {
        self.replaced
            .lock()
            .push((kind, track.map(|t| t.id().to_owned())));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct FakeConnector {
    stall: bool,
    /// When set, `open` waits for a permit.
    gate: Option<Arc<tokio::sync::Notify>>,
    links: Mutex<Vec<Arc<FakeLink>>>,
}

impl FakeConnector {
    fn links(&self) -> Vec<Arc<FakeLink>> {
        self.links.lock().clone()
    }

    fn link(&self, peer: &ConnectionId) -> Arc<FakeLink> {
        self.links
            .lock()
            .iter()
            .rev()
            .find(|l| &l.peer == peer)
            .cloned()
            .expect("no link opened for peer")
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn open(
        &self,
        peer: &ConnectionId,
        role: Role,
        _media: &LocalMedia,
        observer: LinkObserver,
    ) -> Result<Arc<dyn PeerLink>> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let link = Arc::new(FakeLink {
            peer: peer.clone(),
            role,
            observer,
            stall: self.stall,
            answers: Mutex::new(Vec::new()),
            replaced: Mutex::new(Vec::new()),
            closed: AtomicUsize::new(0),
        });
        self.links.lock().push(link.clone());
        Ok(link as Arc<dyn PeerLink>)
    }
}

const WAIT: Duration = Duration::from_secs(60);

struct Harness {
    manager: SessionManager,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    signals: mpsc::UnboundedReceiver<ClientMessage>,
    connector: Arc<FakeConnector>,
}

impl Harness {
    fn new(stall: bool) -> Self {
        Self::with_connector(FakeConnector {
            stall,
            ..FakeConnector::default()
        })
    }

    fn with_connector(connector: FakeConnector) -> Self {
        let connector = Arc::new(connector);
        let (signal_tx, signals) = mpsc::unbounded_channel();
        let (manager, events) = SessionManager::spawn(
            connector.clone(),
            LocalMedia::with_tracks("local", &MediaConstraints::default()),
            SessionConfig::default(),
            signal_tx,
        );
        Self {
            manager,
            events,
            signals,
            connector,
        }
    }

    fn deliver(&self, msg: ServerMessage) {
        self.manager.handle_server_message(msg).unwrap();
    }

    async fn next_signal(&mut self) -> ClientMessage {
        tokio::time::timeout(WAIT, self.signals.recv())
            .await
            .expect("timed out waiting for a signal")
            .expect("signal channel closed")
    }

    async fn next_event(&mut self) -> SessionEvent {
        tokio::time::timeout(WAIT, self.events.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("event channel closed")
    }

    async fn wait_sessions(&self, pred: impl FnMut(&Vec<SessionSummary>) -> bool) {
        let mut rx = self.manager.subscribe();
        tokio::time::timeout(WAIT, rx.wait_for(pred))
            .await
            .expect("timed out waiting for sessions")
            .expect("monitor closed");
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

fn offer_from(peer: &str) -> ServerMessage {
    ServerMessage::PeerJoined {
        sender: peer.into(),
        payload: SignalPayload::new(json!({"type": "offer", "from": peer})),
    }
}

fn snapshot(peers: &[&str]) -> ServerMessage {
    ServerMessage::RoomSnapshot {
        room: "alpha".into(),
        occupants: peers.iter().map(|p| ConnectionId::from(*p)).collect(),
    }
}

#[tokio::test]
async fn snapshot_starts_one_initiator_per_occupant() {
    let mut h = Harness::new(false);
    h.deliver(snapshot(&["a", "b"]));

    match h.next_event().await {
        SessionEvent::OccupantsKnown { room, occupants } => {
            assert_eq!(room, "alpha");
            assert_eq!(occupants, vec![ConnectionId::from("a"), ConnectionId::from("b")]);
        }
        other => panic!("unexpected event {other:?}"),
    }

    let mut targets = Vec::new();
    for _ in 0..2 {
        match h.next_signal().await {
            ClientMessage::RelayForward { target, .. } => targets.push(target),
            other => panic!("unexpected signal {other:?}"),
        }
    }
    targets.sort();
    assert_eq!(targets, vec![ConnectionId::from("a"), ConnectionId::from("b")]);

    let sessions = h.manager.sessions();
    assert_eq!(sessions.len(), 2);
    assert!(sessions
        .iter()
        .all(|s| s.role == Role::Initiator && s.state == SessionState::Negotiating));
    assert!(h.connector.links().iter().all(|l| l.role == Role::Initiator));
}

#[tokio::test]
async fn redelivered_peer_joined_creates_one_session() {
    let mut h = Harness::new(false);
    for _ in 0..3 {
        h.deliver(offer_from("x"));
    }

    match h.next_signal().await {
        ClientMessage::RelayReturn { target, payload } => {
            assert_eq!(target, ConnectionId::from("x"));
            assert_eq!(payload.as_value()["type"], "answer");
        }
        other => panic!("unexpected signal {other:?}"),
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.signals.try_recv().is_err());
    assert_eq!(h.connector.links().len(), 1);

    let sessions = h.manager.sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].role, Role::Responder);
}

#[tokio::test]
async fn peer_joined_from_known_occupant_is_ignored() {
    let mut h = Harness::new(false);
    h.deliver(snapshot(&["x"]));
    assert!(matches!(h.next_signal().await, ClientMessage::RelayForward { .. }));

    h.deliver(offer_from("x"));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(h.signals.try_recv().is_err());
    assert_eq!(h.connector.links().len(), 1);
    assert_eq!(h.manager.sessions()[0].role, Role::Initiator);
}

#[tokio::test]
async fn returned_signal_reaches_initiator_link() {
    let mut h = Harness::new(false);
    h.deliver(snapshot(&["a"]));
    h.next_signal().await;

    let answer = SignalPayload::new(json!({"type": "answer", "sdp": "v=0"}));
    h.deliver(ServerMessage::PeerSignalReturned {
        sender: "a".into(),
        payload: answer.clone(),
    });
    h.deliver(ServerMessage::PeerSignalReturned {
        sender: "stranger".into(),
        payload: answer.clone(),
    });

    let link = h.connector.link(&"a".into());
    eventually(|| link.answers.lock().len() == 1).await;
    assert_eq!(link.answers.lock()[0], answer);
    assert_eq!(h.connector.links().len(), 1);
}

#[tokio::test]
async fn direct_call_initiates_once() {
    let mut h = Harness::new(false);
    h.manager.call("z".into()).unwrap();
    h.manager.call("z".into()).unwrap();

    match h.next_signal().await {
        ClientMessage::RelayForward { target, payload } => {
            assert_eq!(target, ConnectionId::from("z"));
            assert_eq!(payload.as_value()["type"], "offer");
        }
        other => panic!("unexpected signal {other:?}"),
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.signals.try_recv().is_err());
    assert_eq!(h.manager.sessions()[0].role, Role::Initiator);
}

#[tokio::test]
async fn failure_before_established_is_reported() {
    let mut h = Harness::new(false);
    h.deliver(snapshot(&["a"]));
    h.next_event().await;
    h.next_signal().await;

    let link = h.connector.link(&"a".into());
    link.observer.terminated("ice failed");

    match h.next_event().await {
        SessionEvent::CallFailed { peer, reason } => {
            assert_eq!(peer, ConnectionId::from("a"));
            assert_eq!(reason, CallFailure::Terminated("ice failed".into()));
        }
        other => panic!("unexpected event {other:?}"),
    }
    h.wait_sessions(|s| s.is_empty()).await;
    eventually(|| link.closed() == 1).await;
}

#[tokio::test(start_paused = true)]
async fn negotiation_timeout_discards_session() {
    let mut h = Harness::new(true);
    h.deliver(snapshot(&["a"]));
    h.next_event().await;

    match h.next_event().await {
        SessionEvent::CallFailed { peer, reason } => {
            assert_eq!(peer, ConnectionId::from("a"));
            assert_eq!(reason, CallFailure::NegotiationTimeout);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(h.manager.sessions().is_empty());

    let link = h.connector.link(&"a".into());
    eventually(|| link.closed() == 1).await;
    assert!(h.signals.try_recv().is_err());
}

#[tokio::test]
async fn leaving_peer_aborts_inflight_negotiation() {
    let mut h = Harness::new(true);
    h.deliver(snapshot(&["a"]));
    h.next_event().await;
    h.wait_sessions(|s| s.len() == 1).await;
    eventually(|| h.connector.links().len() == 1).await;

    h.deliver(ServerMessage::PeerLeft { id: "a".into() });
    match h.next_event().await {
        SessionEvent::SessionClosed { peer } => assert_eq!(peer, ConnectionId::from("a")),
        other => panic!("unexpected event {other:?}"),
    }

    let link = h.connector.link(&"a".into());
    eventually(|| link.closed() == 1).await;
    assert!(h.signals.try_recv().is_err());
    assert!(h.manager.sessions().is_empty());
}

async fn establish(h: &mut Harness, peers: &[&str]) -> Vec<RemoteMedia> {
    h.deliver(snapshot(peers));
    h.next_event().await;
    for _ in peers {
        h.next_signal().await;
    }
    let mut media = Vec::new();
    for peer in peers {
        h.connector
            .link(&(*peer).into())
            .observer
            .connected(RemoteMedia::new(*peer));
        match h.next_event().await {
            SessionEvent::SessionEstablished { peer: established, media: m } => {
                assert_eq!(established, ConnectionId::from(*peer));
                media.push(m);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
    h.wait_sessions(|s| s.len() == peers.len() && s.iter().all(|s| s.state.is_established()))
        .await;
    media
}

#[tokio::test]
async fn device_switch_reaches_every_established_session() {
    let mut h = Harness::new(false);
    establish(&mut h, &["a", "b"]).await;

    let back_camera = LocalMedia::with_tracks(
        "local",
        &MediaConstraints {
            audio: true,
            video: Some(FacingMode::Environment),
        },
    );
    h.manager.switch_media(back_camera).unwrap();

    for link in h.connector.links() {
        eventually(|| {
            link.replaced()
                .contains(&(MediaKind::Video, Some("video-environment".to_string())))
        })
        .await;
        assert_eq!(link.closed(), 0);
    }
    assert_eq!(h.connector.links().len(), 2);
    assert!(h.signals.try_recv().is_err());
}

#[tokio::test]
async fn muting_detaches_audio_on_current_and_future_sessions() {
    let mut h = Harness::new(false);
    establish(&mut h, &["a"]).await;

    h.manager.set_track_enabled(MediaKind::Audio, false).unwrap();
    let first = h.connector.link(&"a".into());
    eventually(|| first.replaced().contains(&(MediaKind::Audio, None))).await;

    h.deliver(offer_from("c"));
    assert!(matches!(h.next_signal().await, ClientMessage::RelayReturn { .. }));
    let late = h.connector.link(&"c".into());
    eventually(|| late.replaced().contains(&(MediaKind::Audio, None))).await;

    h.manager.set_track_enabled(MediaKind::Audio, true).unwrap();
    eventually(|| first.replaced().last() == Some(&(MediaKind::Audio, Some("audio".to_string()))))
        .await;
}

#[tokio::test]
async fn device_switch_reaches_link_opened_later() {
    let gate = Arc::new(tokio::sync::Notify::new());
    let mut h = Harness::with_connector(FakeConnector {
        gate: Some(gate.clone()),
        ..FakeConnector::default()
    });
    h.deliver(snapshot(&["a"]));
    h.next_event().await;
    h.wait_sessions(|s| s.len() == 1).await;
    assert!(h.connector.links().is_empty());

    let back_camera = LocalMedia::with_tracks(
        "local",
        &MediaConstraints {
            audio: true,
            video: Some(FacingMode::Environment),
        },
    );
    h.manager.switch_media(back_camera).unwrap();
    // Commands are handled in order, so the rejection proves the switch landed.
    h.deliver(ServerMessage::Error {
        message: "sync".into(),
    });
    assert!(matches!(h.next_event().await, SessionEvent::Rejected { .. }));

    gate.notify_one();
    assert!(matches!(h.next_signal().await, ClientMessage::RelayForward { .. }));
    let link = h.connector.link(&"a".into());
    eventually(|| {
        link.replaced()
            .contains(&(MediaKind::Video, Some("video-environment".to_string())))
    })
    .await;
}

#[tokio::test]
async fn leave_closes_links_still_negotiating() {
    let mut h = Harness::new(true);
    h.deliver(snapshot(&["a", "b"]));
    h.next_event().await;
    eventually(|| h.connector.links().len() == 2).await;

    h.manager.leave().await.unwrap();
    assert!(h.connector.links().iter().all(|l| l.closed() == 1));
    assert!(h.signals.try_recv().is_err());
}

#[tokio::test]
async fn peer_left_releases_remote_media() {
    let mut h = Harness::new(false);
    let media = establish(&mut h, &["a", "b"]).await;

    h.deliver(ServerMessage::PeerLeft { id: "a".into() });
    match h.next_event().await {
        SessionEvent::SessionClosed { peer } => assert_eq!(peer, ConnectionId::from("a")),
        other => panic!("unexpected event {other:?}"),
    }
    assert!(media[0].is_released());
    assert!(!media[1].is_released());

    let link = h.connector.link(&"a".into());
    eventually(|| link.closed() == 1).await;
    h.wait_sessions(|s| s.len() == 1 && s[0].peer == ConnectionId::from("b")).await;

    // A repeated departure is a no-op.
    h.deliver(ServerMessage::PeerLeft { id: "a".into() });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.events.try_recv().is_err());
}

#[tokio::test]
async fn leave_closes_every_session_once() {
    let mut h = Harness::new(false);
    establish(&mut h, &["a", "b"]).await;

    h.manager.leave().await.unwrap();

    let mut closed = Vec::new();
    for _ in 0..2 {
        match h.next_event().await {
            SessionEvent::SessionClosed { peer } => closed.push(peer),
            other => panic!("unexpected event {other:?}"),
        }
    }
    closed.sort();
    assert_eq!(closed, vec![ConnectionId::from("a"), ConnectionId::from("b")]);
    assert!(h.connector.links().iter().all(|l| l.closed() == 1));
    assert!(h.manager.sessions().is_empty());
    assert!(matches!(
        h.manager.handle_server_message(snapshot(&[])),
        Err(Error::ChannelClosed)
    ));
}

/// Two managers talking through a real hub: X joins an empty room, Y joins
/// and calls X, both connect, then X disconnects.
#[tokio::test]
async fn alpha_scenario_through_hub() {
    let hub = Arc::new(SignalingHub::new(&ServerConfig::default()));

    let mut clients = Vec::new();
    for _ in 0..2 {
        let (id, mut outbox) = hub.connect();
        let connector = Arc::new(FakeConnector::default());
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
        let (manager, events) = SessionManager::spawn(
            connector.clone(),
            LocalMedia::with_tracks(id.as_str(), &MediaConstraints::default()),
            SessionConfig::default(),
            signal_tx,
        );

        let inbound = manager.clone();
        tokio::spawn(async move {
            while let Some(msg) = outbox.recv().await {
                if inbound.handle_server_message(msg).is_err() {
                    break;
                }
            }
        });
        let outbound_hub = hub.clone();
        let from = id.clone();
        tokio::spawn(async move {
            while let Some(msg) = signal_rx.recv().await {
                outbound_hub.handle(&from, msg);
            }
        });

        clients.push((id, manager, events, connector));
    }
    let (y_id, y, mut y_events, y_connector) = clients.pop().unwrap();
    let (x_id, x, mut x_events, x_connector) = clients.pop().unwrap();

    async fn next(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap()
    }

    assert!(matches!(next(&mut x_events).await, SessionEvent::Welcome { .. }));
    hub.handle(&x_id, ClientMessage::JoinRoom { room: "alpha".into() });
    match next(&mut x_events).await {
        SessionEvent::OccupantsKnown { occupants, .. } => assert!(occupants.is_empty()),
        other => panic!("unexpected event {other:?}"),
    }

    assert!(matches!(next(&mut y_events).await, SessionEvent::Welcome { .. }));
    hub.handle(&y_id, ClientMessage::JoinRoom { room: "alpha".into() });
    match next(&mut y_events).await {
        SessionEvent::OccupantsKnown { occupants, .. } => assert_eq!(occupants, vec![x_id.clone()]),
        other => panic!("unexpected event {other:?}"),
    }

    // Y's offer reaches X verbatim, X's answer reaches Y.
    eventually(|| y_connector.links().first().map_or(false, |l| l.answers.lock().len() == 1))
        .await;
    let x_link = x_connector.link(&y_id);
    let y_link = y_connector.link(&x_id);
    assert_eq!(x_link.role, Role::Responder);
    assert_eq!(y_link.role, Role::Initiator);
    assert_eq!(
        x_link.answers.lock()[0].as_value(),
        &json!({"type": "offer", "to": x_id.as_str()})
    );
    assert_eq!(
        y_link.answers.lock()[0].as_value(),
        &json!({"type": "answer", "to": y_id.as_str()})
    );

    x_link.observer.connected(RemoteMedia::new(y_id.as_str()));
    y_link.observer.connected(RemoteMedia::new(x_id.as_str()));
    assert!(matches!(
        next(&mut x_events).await,
        SessionEvent::SessionEstablished { peer, .. } if peer == y_id
    ));
    let y_media = match next(&mut y_events).await {
        SessionEvent::SessionEstablished { peer, media } if peer == x_id => media,
        other => panic!("unexpected event {other:?}"),
    };

    hub.disconnect(&x_id);
    assert!(matches!(
        next(&mut y_events).await,
        SessionEvent::SessionClosed { peer } if peer == x_id
    ));
    assert!(y_media.is_released());
    eventually(|| y_link.closed() == 1).await;
    assert!(y.sessions().is_empty());

    x.leave().await.unwrap();
}
