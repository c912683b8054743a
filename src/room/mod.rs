//! Authoritative room membership.
//!
//! The registry owns every [`Room`] behind a single lock. Callers only ever
//! receive snapshots of an occupant list, never the live map.

pub mod state;

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::signaling::ConnectionId;

pub use state::Room;

pub type RoomName = String;

/// Result of removing a connection from its room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub room: RoomName,
    /// Occupants still present, who must be told about the departure.
    pub remaining: Vec<ConnectionId>,
}

#[derive(Default)]
struct Inner {
    rooms: HashMap<RoomName, Room>,
    membership: HashMap<ConnectionId, RoomName>,
}

pub struct RoomRegistry {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl RoomRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Registers `id` in `room`, creating the room on first use.
    ///
    /// Returns the other occupants in join order. Membership is left
    /// untouched when the room is full.
    pub fn join(&self, room: &str, id: &ConnectionId) -> Result<Vec<ConnectionId>> {
        if room.trim().is_empty() {
            return Err(Error::InvalidRoomName);
        }

        let mut inner = self.inner.lock();
        if let Some(current) = inner.membership.get(id) {
            if current != room {
                return Err(Error::AlreadyInRoom(current.clone()));
            }
        }

        let capacity = self.capacity;
        let existing = inner
            .rooms
            .entry(room.to_owned())
            .or_insert_with(|| Room::new(room.to_owned(), capacity))
            .add_occupant(id.clone());

        match existing {
            Ok(existing) => {
                inner.membership.insert(id.clone(), room.to_owned());
                info!(room, peer = %id, occupants = existing.len() + 1, "joined room");
                Ok(existing)
            }
            Err(e) => {
                // A zero-capacity room would otherwise linger empty.
                if inner.rooms.get(room).map_or(false, Room::is_empty) {
                    inner.rooms.remove(room);
                }
                debug!(room, peer = %id, "join rejected: {}", e);
                Err(e)
            }
        }
    }

    /// Removes `id` from whichever room it occupies. A second call for the
    /// same identity returns `None`.
    pub fn leave(&self, id: &ConnectionId) -> Option<Departure> {
        let mut inner = self.inner.lock();
        let name = inner.membership.remove(id)?;

        let room = inner.rooms.get_mut(&name)?;
        room.remove_occupant(id);
        let remaining = room.occupants().to_vec();
        if room.is_empty() {
            inner.rooms.remove(&name);
            debug!(room = %name, "room closed");
        }

        info!(room = %name, peer = %id, remaining = remaining.len(), "left room");
        Some(Departure { room: name, remaining })
    }

    pub fn occupants(&self, room: &str) -> Vec<ConnectionId> {
        self.inner
            .lock()
            .rooms
            .get(room)
            .map(|r| r.occupants().to_vec())
            .unwrap_or_default()
    }

    pub fn room_of(&self, id: &ConnectionId) -> Option<RoomName> {
        self.inner.lock().membership.get(id).cloned()
    }

    pub fn share_room(&self, a: &ConnectionId, b: &ConnectionId) -> bool {
        let inner = self.inner.lock();
        match (inner.membership.get(a), inner.membership.get(b)) {
            (Some(ra), Some(rb)) => ra == rb,
            _ => false,
        }
    }

    pub fn room_count(&self) -> usize {
        self.inner.lock().rooms.len()
    }
}
