//! Room membership registry.
//!
//! Maps each connection to the set of rooms it joined. Mutation happens
//! only through join/leave/remove, each inside a single lock scope, so
//! readers never observe a half-applied membership change.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use thiserror::Error;
use uuid::Uuid;

/// Every connection is placed here on connect; market-wide broadcasts
/// target this room.
pub const GLOBAL_ROOM: &str = "market:all";

#[derive(Error, Debug, PartialEq)]
pub enum RoomError {
    #[error("invalid room name: {0:?}")]
    InvalidName(String),
}

/// Room names must be non-empty and free of embedded whitespace.
pub fn validate_room_name(name: &str) -> Result<(), RoomError> {
    if name.is_empty() || name.chars().any(char::is_whitespace) {
        return Err(RoomError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Room carrying one instrument's updates.
pub fn instrument_room(symbol: &str) -> String {
    format!("instrument:{}", symbol.to_uppercase())
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    rooms: RwLock<HashMap<Uuid, HashSet<String>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection with an empty room set.
    pub fn insert_connection(&self, id: Uuid) {
        self.rooms.write().entry(id).or_default();
    }

    /// Drops a connection from every room. Returns how many rooms it
    /// was a member of.
    pub fn remove_connection(&self, id: Uuid) -> usize {
        self.rooms.write().remove(&id).map_or(0, |set| set.len())
    }

    /// Adds `room` to the connection's set. `Ok(true)` when newly
    /// joined, `Ok(false)` when already a member.
    pub fn join(&self, id: Uuid, room: &str) -> Result<bool, RoomError> {
        validate_room_name(room)?;
        let mut g = self.rooms.write();
        Ok(g.entry(id).or_default().insert(room.to_string()))
    }

    /// Removes `room` from the connection's set. `Ok(true)` when it was
    /// a member.
    pub fn leave(&self, id: Uuid, room: &str) -> Result<bool, RoomError> {
        validate_room_name(room)?;
        let mut g = self.rooms.write();
        Ok(g.get_mut(&id).is_some_and(|set| set.remove(room)))
    }

    /// Sorted room list of one connection.
    pub fn rooms_of(&self, id: Uuid) -> Vec<String> {
        let g = self.rooms.read();
        let mut out: Vec<String> = g
            .get(&id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        out.sort();
        out
    }

    /// Every connection whose room set contains `room`.
    pub fn members_of(&self, room: &str) -> Vec<Uuid> {
        let g = self.rooms.read();
        g.iter()
            .filter(|(_, set)| set.contains(room))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn contains(&self, id: Uuid, room: &str) -> bool {
        self.rooms.read().get(&id).is_some_and(|set| set.contains(room))
    }

    pub fn connection_count(&self) -> usize {
        self.rooms.read().len()
    }
}
