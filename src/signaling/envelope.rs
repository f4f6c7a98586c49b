//! Signaling envelope codec
//!
//! Envelopes are flat JSON objects. Every envelope carries `type`,
//! `clientId` and `timeStamp`; the remaining fields depend on the type:
//!
//! ```json
//! {"type":"offer","clientId":"9","peerId":"5","timeStamp":1700000000000,
//!  "sdp":{"type":"offer","sdp":"v=0..."}}
//! ```

use crate::error::MeshError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Identity metadata (display name and friends)
pub type Meta = serde_json::Map<String, Value>;

/// Opaque participant identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    /// Generate a fresh random identifier
    pub fn random() -> Self {
        PeerId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        PeerId(id.to_string())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        PeerId(id)
    }
}

/// Envelope type tag.
///
/// Unknown tags are preserved as [`EnvelopeType::Custom`] so application
/// messages pass through the dispatcher untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EnvelopeType {
    Join,
    Peer,
    Offer,
    Answer,
    Ice,
    Rollback,
    Leave,
    Disconnect,
    Video,
    Sound,
    Meta,
    Relay,
    Data,
    Custom(String),
}

impl EnvelopeType {
    pub fn as_str(&self) -> &str {
        match self {
            EnvelopeType::Join => "join",
            EnvelopeType::Peer => "peer",
            EnvelopeType::Offer => "offer",
            EnvelopeType::Answer => "answer",
            EnvelopeType::Ice => "ice",
            EnvelopeType::Rollback => "rollback",
            EnvelopeType::Leave => "leave",
            EnvelopeType::Disconnect => "disconnect",
            EnvelopeType::Video => "video",
            EnvelopeType::Sound => "sound",
            EnvelopeType::Meta => "meta",
            EnvelopeType::Relay => "relay",
            EnvelopeType::Data => "data",
            EnvelopeType::Custom(name) => name,
        }
    }
}

impl From<String> for EnvelopeType {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "join" => EnvelopeType::Join,
            "peer" => EnvelopeType::Peer,
            "offer" => EnvelopeType::Offer,
            "answer" => EnvelopeType::Answer,
            "ice" => EnvelopeType::Ice,
            "rollback" => EnvelopeType::Rollback,
            "leave" => EnvelopeType::Leave,
            "disconnect" => EnvelopeType::Disconnect,
            "video" => EnvelopeType::Video,
            "sound" => EnvelopeType::Sound,
            "meta" => EnvelopeType::Meta,
            "relay" => EnvelopeType::Relay,
            "data" => EnvelopeType::Data,
            _ => EnvelopeType::Custom(tag),
        }
    }
}

impl From<EnvelopeType> for String {
    fn from(kind: EnvelopeType) -> Self {
        match kind {
            EnvelopeType::Custom(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for EnvelopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Negotiation role of one side of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[serde(alias = "offer")]
    Offerer,
    #[serde(alias = "answer")]
    Answerer,
}

impl Role {
    pub fn opposite(self) -> Role {
        match self {
            Role::Offerer => Role::Answerer,
            Role::Answerer => Role::Offerer,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Offerer => "offerer",
            Role::Answerer => "answerer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SDP message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description as exchanged on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpType::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpType::Answer, sdp: sdp.into() }
    }
}

/// ICE candidate in the browser's `RTCIceCandidateInit` shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>, sdp_mid: Option<&str>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: sdp_mid.map(str::to_string),
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// A relay signaling envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeType,

    /// Sender identity
    pub client_id: PeerId,

    /// Unicast target; absent means broadcast
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<PeerId>,

    /// Sender's session start time (ms since epoch)
    #[serde(default)]
    pub time_stamp: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<SessionDescription>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_chain: Option<Vec<PeerId>>,

    /// Track-enabled flag on `video`/`sound`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<bool>,

    /// Forced-role hint on `join`/`peer`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,

    /// Application payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Envelope {
    pub fn new(kind: EnvelopeType, client_id: PeerId, time_stamp: u64) -> Self {
        Self {
            kind,
            client_id,
            peer_id: None,
            time_stamp,
            meta: None,
            sdp: None,
            candidate: None,
            relay_chain: None,
            state: None,
            role: None,
            data: None,
        }
    }

    /// Address the envelope to a single peer
    pub fn to(mut self, peer: PeerId) -> Self {
        self.peer_id = Some(peer);
        self
    }

    pub fn with_meta(mut self, meta: Meta) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn with_sdp(mut self, sdp: SessionDescription) -> Self {
        self.sdp = Some(sdp);
        self
    }

    pub fn with_candidate(mut self, candidate: IceCandidate) -> Self {
        self.candidate = Some(candidate);
        self
    }

    pub fn with_relay_chain(mut self, chain: Vec<PeerId>) -> Self {
        self.relay_chain = Some(chain);
        self
    }

    pub fn with_state(mut self, state: bool) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_role(mut self, role: Option<Role>) -> Self {
        self.role = role;
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Parse an envelope from a relay text frame
    pub fn from_json(json: &str) -> Result<Self, MeshError> {
        serde_json::from_str(json)
            .map_err(|e| MeshError::Envelope(format!("Invalid envelope: {}", e)))
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, MeshError> {
        serde_json::to_string(self)
            .map_err(|e| MeshError::Envelope(format!("Failed to serialize envelope: {}", e)))
    }

    /// Broadcast envelopes are for everyone; unicast ones only for their target
    pub fn is_addressed_to(&self, id: &PeerId) -> bool {
        self.peer_id.as_ref().map_or(true, |target| target == id)
    }

    /// Relay chain carried by the envelope, empty when absent
    pub fn chain(&self) -> &[PeerId] {
        self.relay_chain.as_deref().unwrap_or(&[])
    }
}
