//! WebRTC PeerConnection driver
//!
//! [`WebRtcCapability`] turns the synchronous capability requests into
//! commands for a per-link task that owns the `RTCPeerConnection`.

use super::data_channel;
use super::media_track;
use crate::config::{BundlePolicy, ConnectionConfig, IceTransportPolicy};
use crate::error::PlatformError;
use crate::platform::{
    CapabilityEvent, DataChannelInit, IceConnectionState, LinkId, MediaStream, Operation,
    PeerCapability, SignalingState, TrackKind, TrackRef,
};
use crate::runtime::PlatformSink;
use crate::signaling::{IceCandidate, SdpType, SessionDescription};
use log::{debug, trace, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use webrtc::api::API;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;

type LocalTrackRef = Arc<dyn TrackLocal + Send + Sync>;

/// State read synchronously by the session while the driver runs
pub(super) struct LinkState {
    signaling: Mutex<SignalingState>,
    senders: Mutex<Vec<TrackKind>>,
    channel: Mutex<Option<Arc<RTCDataChannel>>>,
    channel_open: AtomicBool,
}

impl LinkState {
    fn new() -> Self {
        Self {
            signaling: Mutex::new(SignalingState::Stable),
            senders: Mutex::new(Vec::new()),
            channel: Mutex::new(None),
            channel_open: AtomicBool::new(false),
        }
    }

    /// Use `channel` for sending unless one is already set
    pub(super) fn adopt_channel(&self, channel: Arc<RTCDataChannel>) {
        let mut current = self.channel.lock();
        if current.is_none() {
            *current = Some(channel);
        }
    }

    pub(super) fn set_channel_open(&self, open: bool) {
        self.channel_open.store(open, Ordering::SeqCst);
    }

    fn channel(&self) -> Option<Arc<RTCDataChannel>> {
        self.channel.lock().clone()
    }
}

enum PeerCommand {
    CreateOffer { ice_restart: bool },
    CreateAnswer,
    SetLocal(SessionDescription),
    SetRemote(SessionDescription),
    AddIce(IceCandidate),
    AddTrack(LocalTrackRef),
    ReplaceTrack(TrackKind, LocalTrackRef),
    RemoveTracks,
    CreateDataChannel(DataChannelInit),
    Send(String),
    Close,
}

/// Capability instance for one link generation
pub struct WebRtcCapability {
    link: LinkId,
    tx: mpsc::UnboundedSender<PeerCommand>,
    state: Arc<LinkState>,
}

impl WebRtcCapability {
    /// Start the driver task; must be called from inside a tokio runtime
    pub(super) fn spawn(
        api: Arc<API>,
        link: LinkId,
        config: &ConnectionConfig,
        sink: PlatformSink,
    ) -> Result<Self, PlatformError> {
        let runtime = Handle::try_current()
            .map_err(|e| PlatformError::new(format!("No async runtime for peer connection: {}", e)))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(LinkState::new());
        runtime.spawn(drive(
            api,
            rtc_configuration(config),
            link.clone(),
            state.clone(),
            sink,
            rx,
        ));

        Ok(Self { link, tx, state })
    }

    fn submit(&self, command: PeerCommand) {
        if self.tx.send(command).is_err() {
            debug!("Peer connection for {} is gone", self.link);
        }
    }
}

impl PeerCapability for WebRtcCapability {
    fn signaling_state(&self) -> SignalingState {
        *self.state.signaling.lock()
    }

    fn create_offer(&mut self, ice_restart: bool) {
        self.submit(PeerCommand::CreateOffer { ice_restart });
    }

    fn create_answer(&mut self) {
        self.submit(PeerCommand::CreateAnswer);
    }

    fn set_local_description(&mut self, description: SessionDescription) {
        self.submit(PeerCommand::SetLocal(description));
    }

    fn set_remote_description(&mut self, description: SessionDescription) {
        self.submit(PeerCommand::SetRemote(description));
    }

    fn add_ice_candidate(&mut self, candidate: IceCandidate) {
        self.submit(PeerCommand::AddIce(candidate));
    }

    fn sender_kinds(&self) -> Vec<TrackKind> {
        self.state.senders.lock().clone()
    }

    fn add_track(&mut self, track: TrackRef, _stream: &MediaStream) {
        let Some(local) = media_track::local_sender(&track) else {
            warn!("Track {} cannot be sent to {}", track.id(), self.link.peer);
            return;
        };
        self.state.senders.lock().push(track.kind());
        self.submit(PeerCommand::AddTrack(local));
    }

    fn replace_track(&mut self, kind: TrackKind, track: TrackRef) {
        match media_track::local_sender(&track) {
            Some(local) => self.submit(PeerCommand::ReplaceTrack(kind, local)),
            None => warn!("Track {} cannot be sent to {}", track.id(), self.link.peer),
        }
    }

    fn remove_tracks(&mut self) {
        self.state.senders.lock().clear();
        self.submit(PeerCommand::RemoveTracks);
    }

    fn create_data_channel(&mut self, init: &DataChannelInit) {
        self.submit(PeerCommand::CreateDataChannel(init.clone()));
    }

    fn data_channel_open(&self) -> bool {
        self.state.channel_open.load(Ordering::SeqCst)
    }

    fn send_data(&mut self, text: String) -> Result<(), PlatformError> {
        if !self.data_channel_open() {
            return Err(PlatformError::new("data channel is not open"));
        }
        self.tx
            .send(PeerCommand::Send(text))
            .map_err(|_| PlatformError::new("peer connection closed"))
    }

    fn close(&mut self) {
        self.state.set_channel_open(false);
        self.submit(PeerCommand::Close);
    }
}

impl Drop for WebRtcCapability {
    fn drop(&mut self) {
        let _ = self.tx.send(PeerCommand::Close);
    }
}

/// Map connection settings onto an `RTCConfiguration`
pub fn rtc_configuration(config: &ConnectionConfig) -> RTCConfiguration {
    let ice_servers = config
        .ice_servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect();

    RTCConfiguration {
        ice_servers,
        ice_transport_policy: match config.ice_transport_policy {
            IceTransportPolicy::All => RTCIceTransportPolicy::All,
            IceTransportPolicy::Relay => RTCIceTransportPolicy::Relay,
        },
        bundle_policy: match config.bundle_policy {
            BundlePolicy::Balanced => RTCBundlePolicy::Balanced,
            BundlePolicy::MaxCompat => RTCBundlePolicy::MaxCompat,
            BundlePolicy::MaxBundle => RTCBundlePolicy::MaxBundle,
        },
        ice_candidate_pool_size: config.ice_candidate_pool_size,
        ..Default::default()
    }
}

async fn drive(
    api: Arc<API>,
    config: RTCConfiguration,
    link: LinkId,
    state: Arc<LinkState>,
    sink: PlatformSink,
    mut rx: mpsc::UnboundedReceiver<PeerCommand>,
) {
    let peer_connection = match api.new_peer_connection(config).await {
        Ok(pc) => Arc::new(pc),
        Err(e) => {
            warn!("Failed to create peer connection for {}: {}", link, e);
            sink.capability(
                link,
                CapabilityEvent::IceConnectionStateChanged(IceConnectionState::Failed),
            );
            return;
        }
    };

    register_callbacks(&peer_connection, &link, &state, &sink);

    while let Some(command) = rx.recv().await {
        if matches!(command, PeerCommand::Close) {
            break;
        }
        execute(&peer_connection, command, &link, &state, &sink).await;
    }

    if let Err(e) = peer_connection.close().await {
        debug!("Closing peer connection for {}: {}", link, e);
    }
    trace!("Driver for {} stopped", link);
}

fn register_callbacks(
    pc: &Arc<RTCPeerConnection>,
    link: &LinkId,
    state: &Arc<LinkState>,
    sink: &PlatformSink,
) {
    let (l, s) = (link.clone(), sink.clone());
    pc.on_negotiation_needed(Box::new(move || {
        let (link, sink) = (l.clone(), s.clone());
        Box::pin(async move {
            sink.capability(link, CapabilityEvent::NegotiationNeeded);
        })
    }));

    let (l, s) = (link.clone(), sink.clone());
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let (link, sink) = (l.clone(), s.clone());
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    sink.capability(
                        link,
                        CapabilityEvent::IceCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }),
                    );
                }
                Err(e) => warn!("Failed to serialize ICE candidate for {}: {}", link, e),
            }
        })
    }));

    let (l, s, st) = (link.clone(), sink.clone(), state.clone());
    pc.on_signaling_state_change(Box::new(move |rtc_state: RTCSignalingState| {
        let (link, sink, state) = (l.clone(), s.clone(), st.clone());
        Box::pin(async move {
            if let Some(signaling) = signaling_state(rtc_state) {
                *state.signaling.lock() = signaling;
                sink.capability(link, CapabilityEvent::SignalingStateChanged(signaling));
            }
        })
    }));

    let (l, s) = (link.clone(), sink.clone());
    pc.on_ice_connection_state_change(Box::new(move |rtc_state: RTCIceConnectionState| {
        let (link, sink) = (l.clone(), s.clone());
        Box::pin(async move {
            if let Some(ice) = ice_connection_state(rtc_state) {
                sink.capability(link, CapabilityEvent::IceConnectionStateChanged(ice));
            }
        })
    }));

    let (l, s) = (link.clone(), sink.clone());
    pc.on_track(Box::new(move |track, receiver, _transceiver| {
        let (link, sink) = (l.clone(), s.clone());
        Box::pin(async move {
            tokio::spawn(media_track::pump_remote(track, receiver, link, sink));
        })
    }));

    let (l, s, st) = (link.clone(), sink.clone(), state.clone());
    pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
        let (link, sink, state) = (l.clone(), s.clone(), st.clone());
        Box::pin(async move {
            debug!("Remote data channel '{}' from {}", channel.label(), link);
            state.adopt_channel(channel.clone());
            data_channel::attach(channel, link, state, sink);
        })
    }));
}

async fn execute(
    pc: &Arc<RTCPeerConnection>,
    command: PeerCommand,
    link: &LinkId,
    state: &Arc<LinkState>,
    sink: &PlatformSink,
) {
    let fail = |operation: Operation, error: String| {
        sink.capability(
            link.clone(),
            CapabilityEvent::OperationFailed {
                operation,
                error: PlatformError::new(error),
            },
        );
    };

    match command {
        PeerCommand::CreateOffer { ice_restart } => {
            let options = RTCOfferOptions {
                ice_restart,
                ..Default::default()
            };
            match pc.create_offer(Some(options)).await {
                Ok(offer) => match session_description(&offer) {
                    Some(desc) => {
                        sink.capability(link.clone(), CapabilityEvent::DescriptionCreated(desc));
                    }
                    None => fail(Operation::CreateOffer, "unexpected description type".into()),
                },
                Err(e) => fail(Operation::CreateOffer, e.to_string()),
            }
        }
        PeerCommand::CreateAnswer => {
            match pc.create_answer(None).await {
                Ok(answer) => match session_description(&answer) {
                    Some(desc) => {
                        sink.capability(link.clone(), CapabilityEvent::DescriptionCreated(desc));
                    }
                    None => fail(Operation::CreateAnswer, "unexpected description type".into()),
                },
                Err(e) => fail(Operation::CreateAnswer, e.to_string()),
            }
        }
        PeerCommand::SetLocal(desc) => {
            let operation = Operation::SetLocalDescription(desc.kind);
            let result = match rtc_description(&desc) {
                Ok(rtc) => pc.set_local_description(rtc).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    sink.capability(link.clone(), CapabilityEvent::LocalDescriptionApplied(desc));
                }
                Err(e) => fail(operation, e.to_string()),
            }
        }
        PeerCommand::SetRemote(desc) => {
            let operation = Operation::SetRemoteDescription(desc.kind);
            let result = match rtc_description(&desc) {
                Ok(rtc) => pc.set_remote_description(rtc).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    sink.capability(link.clone(), CapabilityEvent::RemoteDescriptionApplied(desc));
                }
                Err(e) => fail(operation, e.to_string()),
            }
        }
        PeerCommand::AddIce(candidate) => {
            let init = RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            };
            if let Err(e) = pc.add_ice_candidate(init).await {
                fail(Operation::AddIceCandidate, e.to_string());
            }
        }
        PeerCommand::AddTrack(track) => match pc.add_track(track).await {
            Ok(sender) => {
                // RTCP has to be read for interceptors to run
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 1500];
                    while sender.read(&mut buf).await.is_ok() {}
                });
            }
            Err(e) => fail(Operation::AddTrack, e.to_string()),
        },
        PeerCommand::ReplaceTrack(kind, track) => {
            let codec = codec_type(kind);
            let mut replaced = false;
            for sender in pc.get_senders().await {
                let matches = match sender.track().await {
                    Some(current) => current.kind() == codec,
                    None => false,
                };
                if !matches {
                    continue;
                }
                if let Err(e) = sender.replace_track(Some(track.clone())).await {
                    fail(Operation::ReplaceTrack, e.to_string());
                }
                replaced = true;
            }
            if !replaced {
                fail(Operation::ReplaceTrack, format!("no {} sender", kind));
            }
        }
        PeerCommand::RemoveTracks => {
            for sender in pc.get_senders().await {
                if sender.track().await.is_none() {
                    continue;
                }
                if let Err(e) = pc.remove_track(&sender).await {
                    debug!("Failed to remove sender on {}: {}", link, e);
                }
            }
        }
        PeerCommand::CreateDataChannel(init) => {
            let options = RTCDataChannelInit {
                ordered: Some(init.ordered),
                max_packet_life_time: init.max_packet_life_time,
                ..Default::default()
            };
            match pc.create_data_channel(&init.label, Some(options)).await {
                Ok(channel) => {
                    state.adopt_channel(channel.clone());
                    data_channel::attach(channel, link.clone(), state.clone(), sink.clone());
                }
                Err(e) => fail(Operation::CreateDataChannel, e.to_string()),
            }
        }
        PeerCommand::Send(text) => {
            let Some(channel) = state.channel() else {
                return;
            };
            if let Err(e) = channel.send_text(text).await {
                sink.capability(link.clone(), CapabilityEvent::DataChannelError(e.to_string()));
            }
        }
        PeerCommand::Close => {}
    }
}

fn codec_type(kind: TrackKind) -> RTPCodecType {
    match kind {
        TrackKind::Audio => RTPCodecType::Audio,
        TrackKind::Video => RTPCodecType::Video,
    }
}

fn rtc_description(desc: &SessionDescription) -> Result<RTCSessionDescription, webrtc::Error> {
    match desc.kind {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp.clone()),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp.clone()),
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp.clone()),
        SdpType::Rollback => {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            Ok(rollback)
        }
    }
}

fn session_description(desc: &RTCSessionDescription) -> Option<SessionDescription> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => return None,
    };
    Some(SessionDescription {
        kind,
        sdp: desc.sdp.clone(),
    })
}

fn signaling_state(state: RTCSignalingState) -> Option<SignalingState> {
    Some(match state {
        RTCSignalingState::Stable => SignalingState::Stable,
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
        RTCSignalingState::Unspecified => return None,
    })
}

fn ice_connection_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    Some(match state {
        RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        RTCIceConnectionState::Unspecified => return None,
    })
}
