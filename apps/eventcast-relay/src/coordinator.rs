use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;

use crate::protocol::ConnectionId;

pub const DEFAULT_RECENT_PEERS: usize = 16;

/// Tracks which peers each connection has recently negotiated with so that a
/// departure can be announced to them.
///
/// Bookkeeping is advisory. A missed announcement only means the counterpart
/// falls back to its own ICE timeout.
#[derive(Clone)]
pub struct SessionCoordinator {
    recent: Arc<DashMap<ConnectionId, RecentPeers>>,
    capacity: usize,
}

impl SessionCoordinator {
    pub fn new(capacity: usize) -> Self {
        Self {
            recent: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Record that `sender` delivered a signal to `target`. Both sides learn
    /// about each other.
    pub fn record(&self, sender: ConnectionId, target: ConnectionId) {
        // Each entry is touched in its own statement so that two shard guards
        // are never held at once.
        self.touch(sender, target);
        self.touch(target, sender);
    }

    /// Forget `departed` and return every peer that was negotiating with it.
    pub fn depart(&self, departed: &ConnectionId) -> Vec<ConnectionId> {
        let Some((_, peers)) = self.recent.remove(departed) else {
            return Vec::new();
        };

        let counterparts: Vec<ConnectionId> = peers.into_iter().collect();
        for peer in &counterparts {
            let emptied = match self.recent.get_mut(peer) {
                Some(mut entry) => {
                    entry.forget(departed);
                    entry.is_empty()
                }
                None => false,
            };
            if emptied {
                self.recent.remove_if(peer, |_, set| set.is_empty());
            }
        }
        counterparts
    }

    pub fn peers_of(&self, id: &ConnectionId) -> Vec<ConnectionId> {
        self.recent
            .get(id)
            .map(|entry| entry.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of connections with at least one tracked counterpart.
    pub fn tracked(&self) -> usize {
        self.recent.len()
    }

    pub fn clear(&self) {
        self.recent.clear();
    }

    fn touch(&self, owner: ConnectionId, peer: ConnectionId) {
        self.recent
            .entry(owner)
            .or_insert_with(|| RecentPeers::with_capacity(self.capacity))
            .push(peer);
    }
}

impl Default for SessionCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_RECENT_PEERS)
    }
}

/// Most-recently-addressed peers, oldest at the front.
#[derive(Debug)]
struct RecentPeers {
    peers: VecDeque<ConnectionId>,
    capacity: usize,
}

impl RecentPeers {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            peers: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, peer: ConnectionId) {
        self.forget(&peer);
        if self.peers.len() == self.capacity {
            self.peers.pop_front();
        }
        self.peers.push_back(peer);
    }

    fn forget(&mut self, peer: &ConnectionId) {
        self.peers.retain(|known| known != peer);
    }

    fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    fn iter(&self) -> impl Iterator<Item = &ConnectionId> {
        self.peers.iter()
    }
}

impl IntoIterator for RecentPeers {
    type Item = ConnectionId;
    type IntoIter = std::collections::vec_deque::IntoIter<ConnectionId>;

    fn into_iter(self) -> Self::IntoIter {
        self.peers.into_iter()
    }
}
