//! Peer registry: at most one link per peer id

use super::connection::Connection;
use crate::error::MeshError;
use crate::signaling::PeerId;
use std::collections::BTreeMap;

#[derive(Default)]
pub struct PeerRegistry {
    links: BTreeMap<PeerId, Connection>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new link, refusing a second link for the same peer
    pub fn insert(&mut self, connection: Connection) -> Result<&mut Connection, MeshError> {
        let peer = connection.peer_id().clone();
        if self.links.contains_key(&peer) {
            return Err(MeshError::DuplicatePeer(peer));
        }
        Ok(self.links.entry(peer).or_insert(connection))
    }

    pub fn get(&self, peer: &PeerId) -> Option<&Connection> {
        self.links.get(peer)
    }

    pub fn get_mut(&mut self, peer: &PeerId) -> Option<&mut Connection> {
        self.links.get_mut(peer)
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.links.contains_key(peer)
    }

    pub fn remove(&mut self, peer: &PeerId) -> Option<Connection> {
        self.links.remove(peer)
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.links.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.links.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.links.values_mut()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}
