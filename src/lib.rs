//! meshrtc - many-to-many WebRTC session coordination
//!
//! Relay signaling, per-peer negotiation and mesh recovery. The session core
//! in [`session`] is synchronous; [`runtime`] drives it on tokio and
//! [`transport`] connects it to a WebSocket relay.

pub mod config;
pub mod error;
pub mod platform;
pub mod runtime;
pub mod session;
pub mod signaling;
pub mod transport;
pub mod utils;
#[cfg(feature = "webrtc-peer")]
pub mod webrtc;

// Re-exports
pub use config::Config;
pub use error::{MeshError, PlatformError};
pub use platform::{MediaStream, MediaTrack, PeerCapability, Platform, TrackKind};
pub use runtime::{PlatformSink, SessionHandle};
pub use session::{ClientIdentity, ClientInfo, Network, NetworkEvent, Status};
pub use signaling::{Envelope, EnvelopeType, Meta, PeerId, Role};
pub use transport::WebSocketRelay;
#[cfg(feature = "webrtc-peer")]
pub use webrtc::WebRtcPlatform;
