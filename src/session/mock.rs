//! In-memory platform, relay and scheduler for session tests

use super::events::NetworkEvent;
use super::network::{ClientIdentity, Network};
use super::timer::{Scheduler, TimerId, TimerKind};
use crate::config::{Config, ConnectionConfig};
use crate::error::PlatformError;
use crate::platform::{
    CapabilityEvent, CaptureKind, DataChannelInit, IceConnectionState, LinkId, MediaStream,
    MediaTrack, PeerCapability, Platform, RelaySender, SignalingState, TrackKind, TrackRef,
};
use crate::signaling::{Envelope, EnvelopeType, IceCandidate, Meta, PeerId, SessionDescription};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    CreatePeer,
    CreateOffer { ice_restart: bool },
    CreateAnswer,
    SetLocal(SessionDescription),
    SetRemote(SessionDescription),
    AddIce(IceCandidate),
    AddTrack(String),
    ReplaceTrack(TrackKind, String),
    RemoveTracks,
    CreateDataChannel(DataChannelInit),
    SendData(String),
    Close,
}

#[derive(Default)]
struct MockState {
    calls: Vec<(String, Call)>,
    signaling: HashMap<String, SignalingState>,
    channel_open: HashMap<String, bool>,
    senders: HashMap<String, Vec<TrackKind>>,
    captures: Vec<CaptureKind>,
    fail_create: bool,
}

/// Test-side view of what the mock platform was asked to do
#[derive(Clone)]
pub(crate) struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    pub fn calls_for(&self, peer: &str) -> Vec<Call> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|(target, _)| target == peer)
            .map(|(_, call)| call.clone())
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn set_signaling(&self, peer: &str, state: SignalingState) {
        self.state.lock().signaling.insert(peer.to_string(), state);
    }

    pub fn set_channel_open(&self, peer: &str, open: bool) {
        self.state.lock().channel_open.insert(peer.to_string(), open);
    }

    pub fn fail_create(&self, fail: bool) {
        self.state.lock().fail_create = fail;
    }

    pub fn captures(&self) -> Vec<CaptureKind> {
        self.state.lock().captures.clone()
    }
}

pub(crate) struct MockPlatform {
    state: Arc<Mutex<MockState>>,
}

impl MockPlatform {
    pub fn new() -> (Self, MockHandle) {
        let state = Arc::new(Mutex::new(MockState::default()));
        (
            Self {
                state: state.clone(),
            },
            MockHandle { state },
        )
    }
}

impl Platform for MockPlatform {
    fn create_peer(
        &mut self,
        link: &LinkId,
        _config: &ConnectionConfig,
    ) -> Result<Box<dyn PeerCapability>, PlatformError> {
        let peer = link.peer.to_string();
        let mut state = self.state.lock();
        if state.fail_create {
            return Err(PlatformError::new("create refused"));
        }
        state.calls.push((peer.clone(), Call::CreatePeer));
        state.senders.remove(&peer);
        Ok(Box::new(MockCapability {
            peer,
            state: self.state.clone(),
        }))
    }

    fn acquire_user_media(&mut self) {
        self.state.lock().captures.push(CaptureKind::UserMedia);
    }

    fn acquire_display_media(&mut self) {
        self.state.lock().captures.push(CaptureKind::Display);
    }
}

struct MockCapability {
    peer: String,
    state: Arc<Mutex<MockState>>,
}

impl MockCapability {
    fn record(&self, call: Call) {
        self.state.lock().calls.push((self.peer.clone(), call));
    }
}

impl PeerCapability for MockCapability {
    fn signaling_state(&self) -> SignalingState {
        self.state
            .lock()
            .signaling
            .get(&self.peer)
            .copied()
            .unwrap_or(SignalingState::Stable)
    }

    fn create_offer(&mut self, ice_restart: bool) {
        self.record(Call::CreateOffer { ice_restart });
    }

    fn create_answer(&mut self) {
        self.record(Call::CreateAnswer);
    }

    fn set_local_description(&mut self, description: SessionDescription) {
        self.record(Call::SetLocal(description));
    }

    fn set_remote_description(&mut self, description: SessionDescription) {
        self.record(Call::SetRemote(description));
    }

    fn add_ice_candidate(&mut self, candidate: IceCandidate) {
        self.record(Call::AddIce(candidate));
    }

    fn sender_kinds(&self) -> Vec<TrackKind> {
        self.state
            .lock()
            .senders
            .get(&self.peer)
            .cloned()
            .unwrap_or_default()
    }

    fn add_track(&mut self, track: TrackRef, _stream: &MediaStream) {
        self.state
            .lock()
            .senders
            .entry(self.peer.clone())
            .or_default()
            .push(track.kind());
        self.record(Call::AddTrack(track.id().to_string()));
    }

    fn replace_track(&mut self, kind: TrackKind, track: TrackRef) {
        self.record(Call::ReplaceTrack(kind, track.id().to_string()));
    }

    fn remove_tracks(&mut self) {
        self.state.lock().senders.remove(&self.peer);
        self.record(Call::RemoveTracks);
    }

    fn create_data_channel(&mut self, init: &DataChannelInit) {
        self.record(Call::CreateDataChannel(init.clone()));
    }

    fn data_channel_open(&self) -> bool {
        self.state
            .lock()
            .channel_open
            .get(&self.peer)
            .copied()
            .unwrap_or(false)
    }

    fn send_data(&mut self, text: String) -> Result<(), PlatformError> {
        self.record(Call::SendData(text));
        Ok(())
    }

    fn close(&mut self) {
        self.record(Call::Close);
    }
}

#[derive(Debug)]
pub(crate) struct MockTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl MockTrack {
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl MediaTrack for MockTrack {
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

pub(crate) fn track(id: &str, kind: TrackKind) -> TrackRef {
    Arc::new(MockTrack {
        id: id.to_string(),
        kind,
        enabled: AtomicBool::new(true),
        stopped: AtomicBool::new(false),
    })
}

/// Stream `id` with one track per kind, named `{id}-audio` / `{id}-video`
pub(crate) fn stream(id: &str, kinds: &[TrackKind]) -> MediaStream {
    let tracks = kinds
        .iter()
        .map(|kind| track(&format!("{}-{}", id, kind), *kind))
        .collect();
    MediaStream::new(id, tracks)
}

pub(crate) fn is_stopped(track: &TrackRef) -> bool {
    track
        .as_any()
        .downcast_ref::<MockTrack>()
        .map_or(false, MockTrack::is_stopped)
}

struct MockRelay {
    sent: Arc<Mutex<Vec<String>>>,
}

impl RelaySender for MockRelay {
    fn send(&mut self, text: String) -> Result<(), PlatformError> {
        self.sent.lock().push(text);
        Ok(())
    }
}

struct MockScheduler {
    pending: Arc<Mutex<HashMap<TimerKind, TimerId>>>,
}

impl Scheduler for MockScheduler {
    fn schedule(&mut self, timer: TimerId, _after: Duration) {
        self.pending.lock().insert(timer.kind, timer);
    }

    fn cancel(&mut self, timer: TimerId) {
        let mut pending = self.pending.lock();
        if pending.get(&timer.kind) == Some(&timer) {
            pending.remove(&timer.kind);
        }
    }
}

pub(crate) fn envelope(kind: EnvelopeType, from: &str, time_stamp: u64) -> Envelope {
    Envelope::new(kind, PeerId::from(from), time_stamp)
}

/// A [`Network`] wired to in-memory collaborators, already joined
pub(crate) struct Harness {
    pub network: Network,
    pub platform: MockHandle,
    relay: Arc<Mutex<Vec<String>>>,
    timers: Arc<Mutex<HashMap<TimerKind, TimerId>>>,
    events: broadcast::Receiver<NetworkEvent>,
}

impl Harness {
    pub fn new(id: &str) -> Self {
        Self::with_config(id, Config::default())
    }

    pub fn with_config(id: &str, config: Config) -> Self {
        let (platform, handle) = MockPlatform::new();
        let timers = Arc::new(Mutex::new(HashMap::new()));
        let relay = Arc::new(Mutex::new(Vec::new()));
        let identity = ClientIdentity::new(PeerId::from(id), Meta::new(), 100);

        let mut network = Network::new(
            identity,
            &config,
            Box::new(platform),
            Box::new(MockScheduler {
                pending: timers.clone(),
            }),
        );
        let events = network.subscribe();
        network.connect(Box::new(MockRelay {
            sent: relay.clone(),
        }));
        network.on_open();

        let mut harness = Self {
            network,
            platform: handle,
            relay,
            timers,
            events,
        };
        harness.sent();
        harness.events();
        harness
    }

    pub fn deliver(&mut self, envelope: Envelope) {
        self.network.dispatch(envelope);
    }

    /// Envelopes sent through the relay since the last call
    pub fn sent(&mut self) -> Vec<Envelope> {
        self.relay
            .lock()
            .drain(..)
            .filter_map(|text| Envelope::from_json(&text).ok())
            .collect()
    }

    pub fn events(&mut self) -> Vec<NetworkEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Deliver a capability event to the current instance of `peer`'s link
    pub fn fire(&mut self, peer: &str, event: CapabilityEvent) {
        let peer = PeerId::from(peer);
        let generation = self
            .network
            .connection(&peer)
            .map_or(0, |link| link.generation());
        self.network.on_capability_event(LinkId::new(peer, generation), event);
    }

    /// Drive `peer`'s link to open with a usable data channel
    pub fn establish(&mut self, peer: &str) {
        self.fire(
            peer,
            CapabilityEvent::IceConnectionStateChanged(IceConnectionState::Connected),
        );
        self.platform.set_channel_open(peer, true);
        self.fire(peer, CapabilityEvent::DataChannelOpen);
    }

    pub fn timer(&self, kind: TimerKind) -> Option<TimerId> {
        self.timers.lock().get(&kind).copied()
    }

    pub fn fire_timer(&mut self, kind: TimerKind) {
        let fired = self.timers.lock().remove(&kind);
        if let Some(timer) = fired {
            self.network.on_timer(timer);
        }
    }
}
