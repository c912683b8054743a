use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::media::{LocalMedia, MediaKind};
use crate::session::{PeerConnector, SessionEvent, SessionManager};
use crate::signaling::{ClientMessage, ConnectionId, SignalingClient};

/// A client's membership in one room: the signaling socket plus the session
/// manager it feeds.
pub struct RoomCall {
    room: String,
    manager: SessionManager,
    signals: mpsc::UnboundedSender<ClientMessage>,
    inbound: JoinHandle<()>,
}

impl RoomCall {
    /// Connects to the signaling server at `url` and asks to join `room`.
    /// Whether the room accepted us shows up as the first room event.
    pub async fn join(
        url: &str,
        room: &str,
        connector: Arc<dyn PeerConnector>,
        media: LocalMedia,
        config: SessionConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>)> {
        if room.is_empty() {
            return Err(Error::InvalidRoomName);
        }
        config.validate()?;

        let client = SignalingClient::connect(url).await?;
        let (signals, mut incoming) = client.split();
        let (manager, events) = SessionManager::spawn(connector, media, config, signals.clone());

        let feed = manager.clone();
        let inbound = tokio::spawn(async move {
            while let Some(msg) = incoming.recv().await {
                if feed.handle_server_message(msg).is_err() {
                    break;
                }
            }
            debug!("signaling connection closed");
        });

        signals
            .send(ClientMessage::JoinRoom {
                room: room.to_owned(),
            })
            .map_err(|_| Error::ChannelClosed)?;
        info!(url = %url, room = %room, "joining room");

        Ok((
            Self {
                room: room.to_owned(),
                manager,
                signals,
                inbound,
            },
            events,
        ))
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    /// Publishes a display name in the server's directory.
    pub fn register_name(&self, name: &str) -> Result<()> {
        self.signals
            .send(ClientMessage::RegisterName {
                name: name.to_owned(),
            })
            .map_err(|_| Error::ChannelClosed)
    }

    /// Calls a directory entry directly, outside the room.
    pub fn call(&self, peer: ConnectionId) -> Result<()> {
        self.manager.call(peer)
    }

    pub fn switch_media(&self, media: LocalMedia) -> Result<()> {
        self.manager.switch_media(media)
    }

    pub fn set_track_enabled(&self, kind: MediaKind, enabled: bool) -> Result<()> {
        self.manager.set_track_enabled(kind, enabled)
    }

    /// Closes every session, then the signaling socket. The server treats the
    /// disconnect as our departure.
    pub async fn leave(self) -> Result<()> {
        let result = self.manager.leave().await;
        drop(self.signals);
        self.inbound.abort();
        info!(room = %self.room, "left room");
        result
    }
}
