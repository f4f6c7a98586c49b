//! Media tracks for webrtc-rs links
//!
//! [`LocalTrack`] wraps a sample-fed local track that links can send.
//! [`RemoteTrack`] stands for a track received from a peer; its RTP is
//! drained by [`pump_remote`], which also reports RFC 6464 audio levels.

use super::AUDIO_LEVEL_URI;
use crate::error::PlatformError;
use crate::platform::{CapabilityEvent, LinkId, MediaTrack, TrackKind, TrackRef};
use crate::runtime::PlatformSink;
use log::{debug, trace};
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Packets between two audio level reports (~0.5s of 20ms Opus frames)
const AUDIO_LEVEL_EVERY: u32 = 25;

/// Track whose media is written by the application
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl LocalTrack {
    pub fn opus(id: &str, stream_id: &str) -> Self {
        Self::new(
            TrackKind::Audio,
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
            id,
            stream_id,
        )
    }

    pub fn vp8(id: &str, stream_id: &str) -> Self {
        Self::new(
            TrackKind::Video,
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: "".to_string(),
                rtcp_feedback: vec![],
            },
            id,
            stream_id,
        )
    }

    fn new(kind: TrackKind, codec: RTCRtpCodecCapability, id: &str, stream_id: &str) -> Self {
        Self {
            id: id.to_string(),
            kind,
            track: Arc::new(TrackLocalStaticSample::new(
                codec,
                id.to_string(),
                stream_id.to_string(),
            )),
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        self.track.clone()
    }

    /// Write one encoded frame; muted or stopped tracks drop it
    pub async fn write_sample(&self, data: Vec<u8>, duration: Duration) -> Result<(), PlatformError> {
        if !self.enabled() || self.stopped.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.track
            .write_sample(&Sample {
                data: data.into(),
                duration,
                ..Default::default()
            })
            .await
            .map_err(|e| PlatformError::new(format!("Failed to write sample on {}: {}", self.id, e)))
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl MediaTrack for LocalTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Sender-side track for `track`, when it is one this platform can send
pub(super) fn local_sender(track: &TrackRef) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
    let local = track.as_any().downcast_ref::<LocalTrack>()?;
    Some(local.rtc_track())
}

/// Track received from a peer
#[derive(Debug)]
pub struct RemoteTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl RemoteTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl MediaTrack for RemoteTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Report a received track, drain its RTP until it ends, then report removal
pub(super) async fn pump_remote(
    track: Arc<TrackRemote>,
    receiver: Arc<RTCRtpReceiver>,
    link: LinkId,
    sink: PlatformSink,
) {
    let kind = match track.kind() {
        RTPCodecType::Audio => TrackKind::Audio,
        RTPCodecType::Video => TrackKind::Video,
        _ => {
            debug!("Ignoring track of unknown kind from {}", link);
            return;
        }
    };
    let remote = Arc::new(RemoteTrack::new(track.id(), kind));
    let stream_id = track.stream_id();
    sink.capability(
        link.clone(),
        CapabilityEvent::TrackAdded {
            track: remote.clone(),
            stream_id: (!stream_id.is_empty()).then_some(stream_id),
        },
    );

    let level_id = if kind == TrackKind::Audio {
        receiver
            .get_parameters()
            .await
            .header_extensions
            .iter()
            .find(|ext| ext.uri == AUDIO_LEVEL_URI)
            .map(|ext| ext.id as u8)
    } else {
        None
    };

    let mut packets = 0u32;
    while !remote.is_stopped() {
        let Ok((packet, _)) = track.read_rtp().await else {
            break;
        };
        let Some(id) = level_id else {
            continue;
        };
        packets = packets.wrapping_add(1);
        if packets % AUDIO_LEVEL_EVERY != 0 {
            continue;
        }
        if let Some(level) = packet.header.get_extension(id).and_then(|ext| audio_level(&ext)) {
            if !sink.capability(link.clone(), CapabilityEvent::AudioLevel(level)) {
                break;
            }
        }
    }

    trace!("Remote track {} from {} ended", remote.id(), link);
    sink.capability(
        link,
        CapabilityEvent::TrackRemoved {
            track_id: remote.id().to_string(),
        },
    );
}

/// Linear 0.0..=1.0 level from an RFC 6464 extension payload
pub fn audio_level(payload: &[u8]) -> Option<f64> {
    let first = payload.first()?;
    let dbov = f64::from(first & 0x7f);
    Some(10f64.powf(-dbov / 20.0))
}
