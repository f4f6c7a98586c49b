//! FIFO admission queue for the connection cap

use crate::signaling::{Envelope, PeerId};
use std::collections::VecDeque;

/// Deferred `join`/`peer` requests waiting for a free slot
#[derive(Debug, Default)]
pub struct AdmissionQueue {
    limit: Option<usize>,
    pending: VecDeque<Envelope>,
}

impl AdmissionQueue {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            pending: VecDeque::new(),
        }
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// True when `active` links leave no room for another
    pub fn at_capacity(&self, active: usize) -> bool {
        self.limit.map_or(false, |limit| active >= limit)
    }

    /// Queue a request. A newer request from the same peer replaces the
    /// older one in place, keeping its turn.
    pub fn enqueue(&mut self, envelope: Envelope) {
        if let Some(slot) = self
            .pending
            .iter_mut()
            .find(|queued| queued.client_id == envelope.client_id)
        {
            *slot = envelope;
            return;
        }
        self.pending.push_back(envelope);
    }

    pub fn dequeue(&mut self) -> Option<Envelope> {
        self.pending.pop_front()
    }

    pub fn remove(&mut self, peer: &PeerId) -> bool {
        let before = self.pending.len();
        self.pending.retain(|queued| &queued.client_id != peer);
        self.pending.len() != before
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.pending.iter().any(|queued| &queued.client_id == peer)
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.pending.iter().map(|queued| queued.client_id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::EnvelopeType;

    fn join(from: &str, time_stamp: u64) -> Envelope {
        Envelope::new(EnvelopeType::Join, PeerId::from(from), time_stamp)
    }

    #[test]
    fn unlimited_queue_never_fills() {
        let queue = AdmissionQueue::new(None);
        assert!(!queue.at_capacity(1000));
    }

    #[test]
    fn capacity_is_inclusive() {
        let queue = AdmissionQueue::new(Some(1));
        assert!(!queue.at_capacity(0));
        assert!(queue.at_capacity(1));
    }

    #[test]
    fn fifo_order_with_replacement() {
        let mut queue = AdmissionQueue::new(Some(1));
        queue.enqueue(join("b", 1));
        queue.enqueue(join("c", 2));
        queue.enqueue(join("b", 3));
        assert_eq!(queue.len(), 2);

        let first = queue.dequeue().unwrap();
        assert_eq!(first.client_id, PeerId::from("b"));
        assert_eq!(first.time_stamp, 3);
        assert_eq!(queue.dequeue().unwrap().client_id, PeerId::from("c"));
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn remove_drops_peer() {
        let mut queue = AdmissionQueue::new(Some(1));
        queue.enqueue(join("b", 1));
        assert!(queue.contains(&PeerId::from("b")));
        assert!(queue.remove(&PeerId::from("b")));
        assert!(!queue.remove(&PeerId::from("b")));
        assert!(queue.is_empty());
    }
}
