//! Dispatch of client messages onto the room registry, the relay and the
//! name directory. Transport-agnostic: the WebSocket server feeds it, and
//! tests drive it directly.

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::directory::Directory;
use crate::error::Error;
use crate::relay::SignalRelay;
use crate::room::RoomRegistry;
use crate::signaling::{ClientMessage, ConnectionId, ServerMessage};

pub struct SignalingHub {
    registry: RoomRegistry,
    relay: SignalRelay,
    directory: Directory,
    /// Held across a membership change and the notifications it causes, so
    /// every connection sees joins and departures in registry order.
    membership: Mutex<()>,
}

impl SignalingHub {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            registry: RoomRegistry::new(config.max_occupants),
            relay: SignalRelay::new(),
            directory: Directory::new(),
            membership: Mutex::new(()),
        }
    }

    /// Assigns a fresh identity to a new transport connection and greets it.
    pub fn connect(&self) -> (ConnectionId, mpsc::UnboundedReceiver<ServerMessage>) {
        let id = ConnectionId::generate();
        let rx = self.relay.register(id.clone());
        self.reply(&id, ServerMessage::Welcome { id: id.clone() });
        debug!(peer = %id, "connection registered");
        (id, rx)
    }

    pub fn handle(&self, from: &ConnectionId, msg: ClientMessage) {
        match msg {
            ClientMessage::JoinRoom { room } => self.join_room(from, room),
            ClientMessage::RelayForward { target, payload } => self.relay_between(
                from,
                &target,
                ServerMessage::PeerJoined {
                    sender: from.clone(),
                    payload,
                },
            ),
            ClientMessage::RelayReturn { target, payload } => self.relay_between(
                from,
                &target,
                ServerMessage::PeerSignalReturned {
                    sender: from.clone(),
                    payload,
                },
            ),
            ClientMessage::RegisterName { name } => match self.directory.register(from, &name) {
                Ok(()) => {
                    info!(peer = %from, name = %name.trim(), "registered name");
                    self.broadcast_directory();
                }
                Err(e) => self.reply_error(from, &e),
            },
            ClientMessage::CallName { name, payload } => {
                if !self.directory.contains(from) {
                    self.reply_error(
                        from,
                        &Error::Signaling("register a name before calling".to_string()),
                    );
                    return;
                }
                match self.directory.resolve(&name) {
                    Ok(target) => self.relay_between(
                        from,
                        &target,
                        ServerMessage::PeerJoined {
                            sender: from.clone(),
                            payload,
                        },
                    ),
                    Err(e) => self.reply_error(from, &e),
                }
            }
        }
    }

    /// Authoritative leave for a closed transport connection. Only the
    /// departed connection's room is told about it.
    pub fn disconnect(&self, id: &ConnectionId) {
        let departure = {
            let _membership = self.membership.lock();
            self.registry.leave(id).map(|departure| {
                let notified = self
                    .relay
                    .fan_out(&departure.remaining, &ServerMessage::PeerLeft { id: id.clone() });
                (departure, notified)
            })
        };
        if let Some((departure, notified)) = departure {
            debug!(peer = %id, room = %departure.room, notified, "departure announced");
        }
        if self.directory.remove(id) {
            self.broadcast_directory();
        }
        if self.relay.unregister(id) {
            debug!(peer = %id, "connection unregistered");
        }
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    pub fn connection_count(&self) -> usize {
        self.relay.connection_count()
    }

    fn join_room(&self, from: &ConnectionId, room: String) {
        let _membership = self.membership.lock();
        match self.registry.join(&room, from) {
            Ok(occupants) => self.reply(from, ServerMessage::RoomSnapshot { room, occupants }),
            Err(Error::RoomFull(room)) => {
                info!(peer = %from, room = %room, "room full");
                self.reply(from, ServerMessage::RoomFull { room });
            }
            Err(e) => self.reply_error(from, &e),
        }
    }

    fn relay_between(&self, from: &ConnectionId, target: &ConnectionId, message: ServerMessage) {
        if from == target {
            debug!(peer = %from, "dropping signal addressed to self");
            return;
        }
        let allowed = self.registry.share_room(from, target)
            || (self.directory.contains(from) && self.directory.contains(target));
        if !allowed {
            debug!(peer = %from, target = %target, "dropping signal outside shared room");
            return;
        }
        if let Err(e) = self.relay.forward(target, message) {
            debug!(peer = %from, "dropping signal: {}", e);
        }
    }

    fn broadcast_directory(&self) {
        let entries = self.directory.entries();
        let message = ServerMessage::Directory {
            entries: entries.clone(),
        };
        self.relay.fan_out(entries.iter().map(|e| &e.id), &message);
    }

    fn reply(&self, to: &ConnectionId, message: ServerMessage) {
        if let Err(e) = self.relay.forward(to, message) {
            debug!("reply dropped: {}", e);
        }
    }

    pub(crate) fn reply_error(&self, to: &ConnectionId, error: &Error) {
        warn!(peer = %to, "request rejected: {}", error);
        self.reply(
            to,
            ServerMessage::Error {
                message: error.to_string(),
            },
        );
    }
}
