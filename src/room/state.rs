use crate::error::{Error, Result};
use crate::signaling::ConnectionId;

use super::RoomName;

/// Occupants of one room, in join order.
#[derive(Debug, Clone)]
pub struct Room {
    name: RoomName,
    occupants: Vec<ConnectionId>,
    capacity: usize,
}

impl Room {
    pub fn new(name: RoomName, capacity: usize) -> Self {
        Self {
            name,
            occupants: Vec::new(),
            capacity,
        }
    }

    /// Adds `id` and returns everyone who was already present.
    pub fn add_occupant(&mut self, id: ConnectionId) -> Result<Vec<ConnectionId>> {
        if self.contains(&id) {
            return Ok(self.others(&id));
        }
        if self.occupants.len() >= self.capacity {
            return Err(Error::RoomFull(self.name.clone()));
        }
        let existing = self.occupants.clone();
        self.occupants.push(id);
        Ok(existing)
    }

    pub fn remove_occupant(&mut self, id: &ConnectionId) -> bool {
        let before = self.occupants.len();
        self.occupants.retain(|occupant| occupant != id);
        self.occupants.len() != before
    }

    pub fn others(&self, id: &ConnectionId) -> Vec<ConnectionId> {
        self.occupants.iter().filter(|o| *o != id).cloned().collect()
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.occupants.contains(id)
    }

    pub fn occupants(&self) -> &[ConnectionId] {
        &self.occupants
    }

    pub fn is_empty(&self) -> bool {
        self.occupants.is_empty()
    }

    pub fn len(&self) -> usize {
        self.occupants.len()
    }
}
