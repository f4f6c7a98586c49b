//! Platform collaborators
//!
//! The session core never talks to an ICE agent, a capture device or a
//! socket directly. It issues requests through the traits below and learns
//! about completions through [`CapabilityEvent`]s that the host feeds back
//! in, tagged with the [`LinkId`] that issued them.

use crate::config::ConnectionConfig;
use crate::error::PlatformError;
use crate::signaling::{IceCandidate, PeerId, SdpType, SessionDescription};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Media kind of a track or sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// A single media track owned by the platform
pub trait MediaTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool);
    /// Release the underlying source
    fn stop(&self);
    fn as_any(&self) -> &dyn Any;
}

pub type TrackRef = Arc<dyn MediaTrack>;

struct StreamInner {
    id: String,
    tracks: RwLock<Vec<TrackRef>>,
}

/// Shared handle to a group of tracks.
///
/// Cloning yields another handle to the same stream; the coordinator owns
/// the local stream and links only borrow handles to it.
#[derive(Clone)]
pub struct MediaStream {
    inner: Arc<StreamInner>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<TrackRef>) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                id: id.into(),
                tracks: RwLock::new(tracks),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn tracks(&self) -> Vec<TrackRef> {
        self.inner.tracks.read().clone()
    }

    pub fn tracks_of(&self, kind: TrackKind) -> Vec<TrackRef> {
        self.inner
            .tracks
            .read()
            .iter()
            .filter(|t| t.kind() == kind)
            .cloned()
            .collect()
    }

    /// Add a track unless one with the same id is already present
    pub fn add_track(&self, track: TrackRef) -> bool {
        let mut tracks = self.inner.tracks.write();
        if tracks.iter().any(|t| t.id() == track.id()) {
            return false;
        }
        tracks.push(track);
        true
    }

    pub fn remove_track(&self, track_id: &str) -> bool {
        let mut tracks = self.inner.tracks.write();
        let before = tracks.len();
        tracks.retain(|t| t.id() != track_id);
        tracks.len() != before
    }

    pub fn is_empty(&self) -> bool {
        self.inner.tracks.read().is_empty()
    }

    /// Stop every track
    pub fn stop(&self) {
        for track in self.inner.tracks.read().iter() {
            track.stop();
        }
    }

    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        for track in self.tracks_of(kind) {
            track.set_enabled(enabled);
        }
    }

    /// Flip the enabled flag of every track of `kind`.
    ///
    /// Returns the new state, or `None` when the stream has no such track.
    pub fn toggle(&self, kind: TrackKind) -> Option<bool> {
        let tracks = self.tracks_of(kind);
        let first = tracks.first()?;
        let next = !first.enabled();
        for track in &tracks {
            track.set_enabled(next);
        }
        Some(next)
    }

    pub fn same_as(&self, other: &MediaStream) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) || self.inner.id == other.inner.id
    }
}

impl PartialEq for MediaStream {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.inner.id)
            .field("tracks", &self.inner.tracks.read().len())
            .finish()
    }
}

/// Signaling state as reported by the capability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

/// ICE connection state as reported by the capability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Identifies one capability instance of one link.
///
/// The generation increases every time the link recreates its capability,
/// so completions from a torn-down instance can be told apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinkId {
    pub peer: PeerId,
    pub generation: u64,
}

impl LinkId {
    pub fn new(peer: PeerId, generation: u64) -> Self {
        Self { peer, generation }
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.peer, self.generation)
    }
}

/// Capability request that can fail asynchronously
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    CreateOffer,
    CreateAnswer,
    SetLocalDescription(SdpType),
    SetRemoteDescription(SdpType),
    AddIceCandidate,
    AddTrack,
    ReplaceTrack,
    CreateDataChannel,
}

/// Completion or notification from a capability instance
#[derive(Debug, Clone)]
pub enum CapabilityEvent {
    NegotiationNeeded,
    /// `create_offer`/`create_answer` produced a description
    DescriptionCreated(SessionDescription),
    LocalDescriptionApplied(SessionDescription),
    RemoteDescriptionApplied(SessionDescription),
    OperationFailed {
        operation: Operation,
        error: PlatformError,
    },
    /// A local ICE candidate was gathered
    IceCandidate(IceCandidate),
    SignalingStateChanged(SignalingState),
    IceConnectionStateChanged(IceConnectionState),
    TrackAdded {
        track: TrackRef,
        stream_id: Option<String>,
    },
    TrackRemoved {
        track_id: String,
    },
    DataChannelOpen,
    DataChannelMessage(String),
    DataChannelError(String),
    DataChannelClosed,
    /// Audio level sample for the remote stream, 0.0..=1.0
    AudioLevel(f64),
}

/// Data channel creation options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChannelInit {
    pub label: String,
    pub ordered: bool,
    pub max_packet_life_time: Option<u16>,
}

/// Which capture device to acquire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureKind {
    /// Camera and microphone
    UserMedia,
    /// Screen share
    Display,
}

/// One peer-connection primitive.
///
/// Requests return immediately; their outcome is delivered later as a
/// [`CapabilityEvent`] for this instance's [`LinkId`].
pub trait PeerCapability: Send {
    fn signaling_state(&self) -> SignalingState;
    fn create_offer(&mut self, ice_restart: bool);
    fn create_answer(&mut self);
    fn set_local_description(&mut self, description: SessionDescription);
    fn set_remote_description(&mut self, description: SessionDescription);
    fn add_ice_candidate(&mut self, candidate: IceCandidate);
    /// Kinds that already have a sender
    fn sender_kinds(&self) -> Vec<TrackKind>;
    fn add_track(&mut self, track: TrackRef, stream: &MediaStream);
    fn replace_track(&mut self, kind: TrackKind, track: TrackRef);
    fn remove_tracks(&mut self);
    fn create_data_channel(&mut self, init: &DataChannelInit);
    fn data_channel_open(&self) -> bool;
    fn send_data(&mut self, text: String) -> Result<(), PlatformError>;
    fn close(&mut self);
}

/// Host platform: capability factory and capture devices
pub trait Platform: Send {
    fn create_peer(
        &mut self,
        link: &LinkId,
        config: &ConnectionConfig,
    ) -> Result<Box<dyn PeerCapability>, PlatformError>;

    /// Start camera/microphone acquisition; the result is delivered as a
    /// capture completion for [`CaptureKind::UserMedia`].
    fn acquire_user_media(&mut self);

    /// Start screen-capture acquisition
    fn acquire_display_media(&mut self);
}

/// Outbound half of the message relay
pub trait RelaySender: Send {
    fn send(&mut self, text: String) -> Result<(), PlatformError>;
}
