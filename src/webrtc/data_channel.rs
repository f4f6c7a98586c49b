//! WebRTC DataChannel wiring
//!
//! Forwards channel lifecycle and text messages to the session. Binary
//! frames are accepted when they hold UTF-8 text.

use super::peer_connection::LinkState;
use crate::platform::{CapabilityEvent, LinkId};
use crate::runtime::PlatformSink;
use log::{debug, warn};
use std::sync::Arc;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;

/// Register handlers for a locally created or remotely announced channel
pub(super) fn attach(
    channel: Arc<RTCDataChannel>,
    link: LinkId,
    state: Arc<LinkState>,
    sink: PlatformSink,
) {
    let label = channel.label().to_string();

    let (l, s, st) = (link.clone(), sink.clone(), state.clone());
    let open_label = label.clone();
    channel.on_open(Box::new(move || {
        Box::pin(async move {
            debug!("Data channel '{}' open on {}", open_label, l);
            st.set_channel_open(true);
            s.capability(l, CapabilityEvent::DataChannelOpen);
        })
    }));

    let (l, s, st) = (link.clone(), sink.clone(), state);
    channel.on_close(Box::new(move || {
        let (link, sink, state) = (l.clone(), s.clone(), st.clone());
        Box::pin(async move {
            state.set_channel_open(false);
            sink.capability(link, CapabilityEvent::DataChannelClosed);
        })
    }));

    let (l, s) = (link.clone(), sink.clone());
    channel.on_error(Box::new(move |e: webrtc::Error| {
        let (link, sink) = (l.clone(), s.clone());
        Box::pin(async move {
            warn!("Data channel error on {}: {}", link, e);
            sink.capability(link, CapabilityEvent::DataChannelError(e.to_string()));
        })
    }));

    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        let (link, sink) = (link.clone(), sink.clone());
        Box::pin(async move {
            match decode_message(msg.is_string, &msg.data) {
                Some(text) => {
                    sink.capability(link, CapabilityEvent::DataChannelMessage(text));
                }
                None => debug!("Dropping non-text data channel frame from {}", link),
            }
        })
    }));
}

/// Text carried by a channel frame, if any
pub fn decode_message(is_string: bool, data: &[u8]) -> Option<String> {
    match std::str::from_utf8(data) {
        Ok(text) => Some(text.to_string()),
        Err(_) if is_string => Some(String::from_utf8_lossy(data).into_owned()),
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_frames_decode() {
        assert_eq!(decode_message(true, b"{\"hello\":1}").as_deref(), Some("{\"hello\":1}"));
    }

    #[test]
    fn test_binary_utf8_is_accepted() {
        assert_eq!(decode_message(false, "héllo".as_bytes()).as_deref(), Some("héllo"));
    }

    #[test]
    fn test_binary_garbage_is_dropped() {
        assert_eq!(decode_message(false, &[0xff, 0xfe, 0x00]), None);
    }
}
