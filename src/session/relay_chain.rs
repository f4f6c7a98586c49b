//! Relay-chain overlay bookkeeping
//!
//! The chain is the ordered path a shared stream travels. It stays loop-free:
//! a join whose chain overlaps ours is refused.

use crate::signaling::PeerId;

/// Result of offering a chain received from a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainUpdate {
    /// Nothing new
    Unchanged,
    /// The local chain changed and should be re-announced
    Adopted,
    /// The incoming chain overlaps ours; the sender's link must be dropped
    Conflict,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayChain {
    peers: Vec<PeerId>,
}

impl RelayChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peers(&self) -> &[PeerId] {
        &self.peers
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains(id)
    }

    pub fn intersects(&self, other: &[PeerId]) -> bool {
        other.iter().any(|id| self.peers.contains(id))
    }

    /// Whether a join carrying `incoming` must be refused
    pub fn conflicts_with(&self, incoming: &[PeerId]) -> bool {
        !self.peers.is_empty() && self.intersects(incoming)
    }

    /// Whether [`RelayChain::accept_extension`] would report a conflict
    pub fn rejects_extension(&self, incoming: &[PeerId]) -> bool {
        !incoming.starts_with(&self.peers) && self.intersects(incoming)
    }

    /// Start a chain at `me` when none exists yet
    pub fn commit(&mut self, me: &PeerId) -> bool {
        if !self.peers.is_empty() {
            return false;
        }
        self.peers.push(me.clone());
        true
    }

    /// Fold in the chain of an admitted joiner and append ourselves.
    pub fn accept_join(&mut self, incoming: &[PeerId], me: &PeerId) -> ChainUpdate {
        if incoming.is_empty() {
            return ChainUpdate::Unchanged;
        }
        if self.conflicts_with(incoming) {
            return ChainUpdate::Conflict;
        }
        self.peers.extend(incoming.iter().cloned());
        self.append(me);
        ChainUpdate::Adopted
    }

    /// Fold in a chain announced by a linked peer (`peer` echo or `relay`
    /// message). A chain that extends ours replaces it; a disjoint one is
    /// appended; any other overlap is a conflict.
    pub fn accept_extension(&mut self, incoming: &[PeerId], me: &PeerId) -> ChainUpdate {
        if incoming.is_empty() {
            return ChainUpdate::Unchanged;
        }
        if incoming.starts_with(&self.peers) {
            let before = self.peers.len();
            self.peers = incoming.to_vec();
            self.append(me);
            return if self.peers.len() == before {
                ChainUpdate::Unchanged
            } else {
                ChainUpdate::Adopted
            };
        }
        if self.intersects(incoming) {
            return ChainUpdate::Conflict;
        }
        self.peers.extend(incoming.iter().cloned());
        self.append(me);
        ChainUpdate::Adopted
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }

    fn append(&mut self, me: &PeerId) {
        if !self.peers.contains(me) {
            self.peers.push(me.clone());
        }
    }
}

impl From<Vec<PeerId>> for RelayChain {
    fn from(peers: Vec<PeerId>) -> Self {
        Self { peers }
    }
}
