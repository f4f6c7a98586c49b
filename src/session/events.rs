//! Typed session events

use crate::platform::MediaStream;
use crate::signaling::{Envelope, Meta, PeerId};
use log::trace;
use serde_json::Value;
use tokio::sync::broadcast;

/// Everything the session reports to the presentation layer
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    /// A link to `peer` was created
    Connect { peer: PeerId, meta: Meta },
    /// The link to `peer` was torn down
    Disconnect { peer: PeerId },
    /// The data channel to `peer` is open
    Ready { peer: PeerId },
    /// The link to `peer` failed for good
    Fail { peer: PeerId },
    /// Remote stream of `peer` appeared or went away
    Remote { peer: PeerId, stream: Option<MediaStream> },
    /// `peer` became the dominant speaker
    Audio { peer: PeerId, stream: Option<MediaStream> },
    /// `peer` updated its metadata
    Meta { peer: PeerId, meta: Meta },
    /// Application payload received over a data channel
    Data { peer: PeerId, payload: Value },
    /// Local stream changed
    Stream { stream: Option<MediaStream> },
    /// Screen sharing ended outside of our control
    Inactive,
    /// Relay envelope with no built-in handler (`video`, `sound`, app types)
    Message(Envelope),
    /// Non-fatal failure, e.g. capture denied
    Error { reason: String },
}

impl NetworkEvent {
    pub fn name(&self) -> &'static str {
        match self {
            NetworkEvent::Connect { .. } => "connect",
            NetworkEvent::Disconnect { .. } => "disconnect",
            NetworkEvent::Ready { .. } => "ready",
            NetworkEvent::Fail { .. } => "fail",
            NetworkEvent::Remote { .. } => "remote",
            NetworkEvent::Audio { .. } => "audio",
            NetworkEvent::Meta { .. } => "meta",
            NetworkEvent::Data { .. } => "data",
            NetworkEvent::Stream { .. } => "stream",
            NetworkEvent::Inactive => "inactive",
            NetworkEvent::Message(_) => "message",
            NetworkEvent::Error { .. } => "error",
        }
    }
}

/// Broadcast bus for [`NetworkEvent`]s
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<NetworkEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: NetworkEvent) {
        let name = event.name();
        if self.sender.send(event).is_err() {
            trace!("No subscribers for {} event", name);
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
