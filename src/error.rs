use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

use crate::room::RoomName;
use crate::signaling::ConnectionId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("room {0} is full")]
    RoomFull(RoomName),

    #[error("connection is already in room {0}")]
    AlreadyInRoom(RoomName),

    #[error("room name must not be empty")]
    InvalidRoomName,

    #[error("relay target {0} is unreachable")]
    TargetUnreachable(ConnectionId),

    #[error("name {0:?} is already taken")]
    NameTaken(String),

    #[error("no connection is registered as {0:?}")]
    UnknownName(String),

    #[error("local media unavailable: {0}")]
    MediaUnavailable(String),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("signaling error: {0}")]
    Signaling(String),

    #[error("channel closed")]
    ChannelClosed,

    #[error("WebRTC error: {0}")]
    WebRTC(#[from] WebRTCError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
