use std::sync::Arc;

use dashmap::{mapref::entry::Entry, DashMap};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::auth::Identity;
use crate::protocol::{ConnectionId, RoomId, ServerFrame};

/// Live connection as seen by the rest of the relay.
///
/// Cloning is cheap; the outbound sender is shared with the owning entry.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub room: Option<RoomId>,
    pub identity: Identity,
    pub tx: mpsc::Sender<ServerFrame>,
}

impl ConnectionHandle {
    pub fn shares_room_with(&self, other: &ConnectionHandle) -> bool {
        self.room == other.room
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection id {0} is already registered")]
    DuplicateId(ConnectionId),
}

/// Map from connection id to live connection handle, shared by every
/// connection task.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<ConnectionId, ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: ConnectionHandle) -> Result<(), RegistryError> {
        match self.connections.entry(handle.id) {
            Entry::Occupied(entry) => Err(RegistryError::DuplicateId(*entry.key())),
            Entry::Vacant(entry) => {
                entry.insert(handle);
                Ok(())
            }
        }
    }

    /// Point-in-time lookup. The returned handle is a clone, so no map guard
    /// is held while the caller forwards to it.
    pub fn lookup(&self, id: &ConnectionId) -> Option<ConnectionHandle> {
        self.connections.get(id).map(|entry| entry.value().clone())
    }

    /// Removing an id that is not present is a no-op. Only one caller ever
    /// receives `Some` for a given registration.
    pub fn remove(&self, id: &ConnectionId) -> Option<ConnectionHandle> {
        self.connections.remove(id).map(|(_, handle)| handle)
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn clear(&self) {
        self.connections.clear();
    }
}
