//! webrtc-rs platform
//!
//! Backs every link with an `RTCPeerConnection`. Each capability instance
//! owns a driver task that executes requests in order and posts their
//! outcomes to the session through a [`PlatformSink`].

pub mod data_channel;
pub mod media_track;
pub mod peer_connection;

pub use media_track::{LocalTrack, RemoteTrack};
pub use peer_connection::WebRtcCapability;

use crate::config::ConnectionConfig;
use crate::error::{MeshError, PlatformError};
use crate::platform::{CaptureKind, LinkId, MediaStream, PeerCapability, Platform};
use crate::runtime::PlatformSink;
use log::debug;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::interceptor::registry::Registry;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpHeaderExtensionCapability, RTPCodecType};

/// RFC 6464 client-to-mixer audio level header extension
pub(crate) const AUDIO_LEVEL_URI: &str = "urn:ietf:params:rtp-hdrext:ssrc-audio-level";

/// [`Platform`] implementation on top of webrtc-rs
///
/// Screen capture is not available: display requests always fail, so this
/// platform never starts a share and never reports one ending. Hosts that
/// capture the screen themselves feed the stream through
/// [`PlatformSink::capture`] and call [`PlatformSink::sharing_ended`] when
/// the user stops it.
pub struct WebRtcPlatform {
    api: Arc<API>,
    sink: PlatformSink,
    capture: Option<MediaStream>,
}

impl WebRtcPlatform {
    pub fn new(sink: PlatformSink) -> Result<Self, MeshError> {
        Ok(Self {
            api: Arc::new(build_api()?),
            sink,
            capture: None,
        })
    }

    /// Stream handed out when the session asks for camera/microphone.
    ///
    /// Tracks should be [`LocalTrack`]s so links can send them.
    pub fn with_capture(mut self, stream: MediaStream) -> Self {
        self.capture = Some(stream);
        self
    }
}

impl Platform for WebRtcPlatform {
    fn create_peer(
        &mut self,
        link: &LinkId,
        config: &ConnectionConfig,
    ) -> Result<Box<dyn PeerCapability>, PlatformError> {
        let capability =
            WebRtcCapability::spawn(self.api.clone(), link.clone(), config, self.sink.clone())?;
        Ok(Box::new(capability))
    }

    fn acquire_user_media(&mut self) {
        let result = self
            .capture
            .clone()
            .ok_or_else(|| PlatformError::new("no capture source configured"));
        if !self.sink.capture(CaptureKind::UserMedia, result) {
            debug!("Session stopped before capture completed");
        }
    }

    fn acquire_display_media(&mut self) {
        self.sink.capture(
            CaptureKind::Display,
            Err(PlatformError::new("screen capture is not supported")),
        );
    }
}

fn build_api() -> Result<API, MeshError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|e| PlatformError::new(format!("Failed to register codecs: {}", e)))?;

    // Remote audio levels drive dominant-speaker detection
    media_engine
        .register_header_extension(
            RTCRtpHeaderExtensionCapability {
                uri: AUDIO_LEVEL_URI.to_string(),
            },
            RTPCodecType::Audio,
            None,
        )
        .map_err(|e| PlatformError::new(format!("Failed to register audio level extension: {}", e)))?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .map_err(|e| PlatformError::new(format!("Failed to register interceptors: {}", e)))?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}
