//! Wire protocol shared by the signaling server and its clients, plus the
//! WebSocket client used by [`crate::call::RoomCall`].
//!
//! Every frame is a JSON text message tagged by `type`:
//!
//! ```json
//! {"type": "join-room", "room": "alpha"}
//! {"type": "peer-joined", "sender": "9f1c...", "payload": {"type": "offer", "sdp": "..."}}
//! ```

use std::fmt;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::directory::DirectoryEntry;
use crate::error::Result;
use crate::room::RoomName;

/// Transport-assigned identity of a single signaling connection.
///
/// 128 random bits, so identities are neither guessable nor reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(format!("{:032x}", rand::random::<u128>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

/// Negotiation data exchanged between two peer sessions. Opaque to the
/// server: it is forwarded verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalPayload(serde_json::Value);

impl SignalPayload {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn into_value(self) -> serde_json::Value {
        self.0
    }
}

/// Messages sent from a client to the signaling server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    JoinRoom {
        room: RoomName,
    },
    /// Initiator's first payload to an existing occupant.
    RelayForward {
        target: ConnectionId,
        payload: SignalPayload,
    },
    /// Responder's reply to the connection that called it.
    RelayReturn {
        target: ConnectionId,
        payload: SignalPayload,
    },
    RegisterName {
        name: String,
    },
    /// Direct call to a connection by its registered name.
    CallName {
        name: String,
        payload: SignalPayload,
    },
}

/// Messages sent from the signaling server to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    Welcome {
        id: ConnectionId,
    },
    RoomSnapshot {
        room: RoomName,
        occupants: Vec<ConnectionId>,
    },
    RoomFull {
        room: RoomName,
    },
    PeerJoined {
        sender: ConnectionId,
        payload: SignalPayload,
    },
    PeerSignalReturned {
        sender: ConnectionId,
        payload: SignalPayload,
    },
    PeerLeft {
        id: ConnectionId,
    },
    Directory {
        entries: Vec<DirectoryEntry>,
    },
    Error {
        message: String,
    },
}

pub struct SignalingClient {
    tx: mpsc::UnboundedSender<ClientMessage>,
    rx: mpsc::UnboundedReceiver<ServerMessage>,
}

impl SignalingClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (incoming_tx, rx) = mpsc::unbounded_channel();
        let (tx, mut outgoing_rx) = mpsc::unbounded_channel::<ClientMessage>();

        // Dropping every sender closes the socket, which the server treats as leave.
        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to encode signaling message: {}", e);
                        continue;
                    }
                };
                if write.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            let _ = write.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(msg) => {
                            if incoming_tx.send(msg).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Ignoring malformed server message: {}", e),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!("Signaling socket closed: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Self { tx, rx })
    }

    pub fn split(
        self,
    ) -> (
        mpsc::UnboundedSender<ClientMessage>,
        mpsc::UnboundedReceiver<ServerMessage>,
    ) {
        (self.tx, self.rx)
    }
}
