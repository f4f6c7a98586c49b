//! Crate error types

use crate::session::status::Status;
use crate::signaling::PeerId;
use thiserror::Error;

/// Errors surfaced by the public API of the session layer
#[derive(Debug, Error)]
pub enum MeshError {
    /// Configuration could not be loaded or failed validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// A signaling envelope could not be encoded or decoded
    #[error("Envelope error: {0}")]
    Envelope(String),

    /// Status change rejected by the link state machine
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: Status, to: Status },

    /// A link already exists for this peer
    #[error("Peer already registered: {0}")]
    DuplicatePeer(PeerId),

    /// No link exists for this peer
    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),

    /// The platform rejected an operation
    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    /// Relay transport failure
    #[error("Relay error: {0}")]
    Relay(String),

    /// The session actor has stopped
    #[error("Session closed")]
    SessionClosed,
}

impl From<serde_json::Error> for MeshError {
    fn from(e: serde_json::Error) -> Self {
        MeshError::Envelope(e.to_string())
    }
}

impl From<toml::de::Error> for MeshError {
    fn from(e: toml::de::Error) -> Self {
        MeshError::Config(e.to_string())
    }
}

/// Error reported by a platform collaborator.
///
/// Cheap to clone so it can travel inside capability events.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct PlatformError(pub String);

impl PlatformError {
    pub fn new(message: impl Into<String>) -> Self {
        PlatformError(message.into())
    }
}
