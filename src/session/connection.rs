//! Per-peer link state
//!
//! A [`Connection`] owns the negotiation state machine for one remote peer:
//! the capability instance, ICE candidate buffers, the borrowed local stream
//! handle, the received remote stream and the rolling audio level.
//!
//! It never performs I/O itself. Outbound envelopes and link events are
//! pushed into the [`Outbox`] of the [`LinkContext`] the coordinator passes
//! in, and capability completions come back through
//! [`Connection::handle_event`].

use super::network::ClientIdentity;
use super::status::Status;
use crate::config::ConnectionConfig;
use crate::error::{MeshError, PlatformError};
use crate::platform::{
    CapabilityEvent, DataChannelInit, IceConnectionState, LinkId, MediaStream, Operation,
    PeerCapability, Platform, SignalingState, TrackRef,
};
use crate::signaling::{
    Envelope, EnvelopeType, IceCandidate, Meta, PeerId, Role, SdpType, SessionDescription,
};
use crate::utils::{now_millis, AudioLevel};
use log::{debug, info, log, trace, warn, Level};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};

/// Link lifecycle notifications consumed by the coordinator
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum LinkEvent {
    /// Capability created for a new link
    Connected { peer: PeerId, meta: Meta },
    /// ICE connectivity established
    Established { peer: PeerId },
    /// Data channel open
    Ready { peer: PeerId },
    Remote { peer: PeerId, stream: Option<MediaStream> },
    Data { peer: PeerId, payload: Value },
    /// Relay-chain announcement received over the data channel
    Relay { peer: PeerId, chain: Vec<PeerId> },
    /// Unrecoverable; the coordinator tears the link down
    Failed { peer: PeerId },
    Closed { peer: PeerId },
}

/// Side effects collected while a handler runs
#[derive(Debug, Default)]
pub(crate) struct Outbox {
    pub envelopes: VecDeque<Envelope>,
    pub events: VecDeque<LinkEvent>,
}

impl Outbox {
    pub fn is_empty(&self) -> bool {
        self.envelopes.is_empty() && self.events.is_empty()
    }
}

/// Coordinator state a link may read or use while handling one input
pub(crate) struct LinkContext<'a> {
    pub identity: &'a ClientIdentity,
    pub config: &'a ConnectionConfig,
    /// Coordinator-owned local stream
    pub local_stream: Option<&'a MediaStream>,
    pub platform: &'a mut dyn Platform,
    pub outbox: &'a mut Outbox,
    /// Log negotiation details at debug instead of trace
    pub verbose: bool,
}

impl LinkContext<'_> {
    fn level(&self) -> Level {
        if self.verbose {
            Level::Debug
        } else {
            Level::Trace
        }
    }

    fn send(&mut self, envelope: Envelope) {
        self.outbox.envelopes.push_back(envelope);
    }

    fn emit(&mut self, event: LinkEvent) {
        self.outbox.events.push_back(event);
    }

    fn address(&self, kind: EnvelopeType, peer: &PeerId) -> Envelope {
        Envelope::new(kind, self.identity.id.clone(), self.identity.time_stamp).to(peer.clone())
    }
}

/// One remote peer
pub struct Connection {
    peer_id: PeerId,
    role: Role,
    status: Status,
    time_stamp: u64,
    meta: Meta,
    generation: u64,
    capability: Option<Box<dyn PeerCapability>>,
    local_candidates: Vec<IceCandidate>,
    remote_candidates: Vec<IceCandidate>,
    seen_candidates: HashSet<(String, Option<String>)>,
    remote_description: Option<SessionDescription>,
    pending_remote: Option<String>,
    local_stream: Option<MediaStream>,
    remote_stream: Option<MediaStream>,
    audio: AudioLevel,
    negotiation_deferred: bool,
    relay_member: bool,
    connected_at: Option<u64>,
    reconnect_attempts: u32,
}

impl Connection {
    pub fn new(peer_id: PeerId, role: Role, time_stamp: u64, meta: Meta) -> Self {
        Self {
            peer_id,
            role,
            status: Status::New,
            time_stamp,
            meta,
            generation: 0,
            capability: None,
            local_candidates: Vec::new(),
            remote_candidates: Vec::new(),
            seen_candidates: HashSet::new(),
            remote_description: None,
            pending_remote: None,
            local_stream: None,
            remote_stream: None,
            audio: AudioLevel::default(),
            negotiation_deferred: false,
            relay_member: false,
            connected_at: None,
            reconnect_attempts: 0,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn time_stamp(&self) -> u64 {
        self.time_stamp
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    /// Generation of the current capability instance
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn has_capability(&self) -> bool {
        self.capability.is_some()
    }

    pub fn remote_stream(&self) -> Option<&MediaStream> {
        self.remote_stream.as_ref()
    }

    pub fn local_stream(&self) -> Option<&MediaStream> {
        self.local_stream.as_ref()
    }

    pub fn is_stream_attached(&self, stream: &MediaStream) -> bool {
        self.local_stream.as_ref().map_or(false, |s| s.same_as(stream))
    }

    pub fn audio_level(&self) -> f64 {
        self.audio.level()
    }

    pub fn connected_at(&self) -> Option<u64> {
        self.connected_at
    }

    pub fn is_relay_member(&self) -> bool {
        self.relay_member
    }

    pub fn is_negotiation_deferred(&self) -> bool {
        self.negotiation_deferred
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn pending_local_candidates(&self) -> &[IceCandidate] {
        &self.local_candidates
    }

    pub fn pending_remote_candidates(&self) -> &[IceCandidate] {
        &self.remote_candidates
    }

    pub(crate) fn set_role(&mut self, role: Role) {
        self.role = role;
    }

    pub(crate) fn set_meta(&mut self, meta: Meta) {
        self.meta = meta;
    }

    pub(crate) fn set_time_stamp(&mut self, time_stamp: u64) {
        self.time_stamp = time_stamp;
    }

    pub(crate) fn set_relay_member(&mut self, member: bool) {
        self.relay_member = member;
    }

    fn transition(&mut self, next: Status) -> Result<(), MeshError> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(MeshError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        debug!("Link {}: {} -> {}", self.peer_id, self.status, next);
        self.status = next;
        Ok(())
    }

    fn mark_closed(&mut self) {
        if self.status != Status::Closed {
            debug!("Link {}: {} -> closed", self.peer_id, self.status);
            self.status = Status::Closed;
        }
    }

    /// Create the capability instance and data channel
    pub(crate) fn connect(&mut self, ctx: &mut LinkContext<'_>) {
        if self.capability.is_some() {
            return;
        }
        if !self.open_capability(ctx) {
            return;
        }
        info!("Link to {} created as {}", self.peer_id, self.role);
        ctx.emit(LinkEvent::Connected {
            peer: self.peer_id.clone(),
            meta: self.meta.clone(),
        });
        self.add_stream(false, ctx);
    }

    fn open_capability(&mut self, ctx: &mut LinkContext<'_>) -> bool {
        if let Err(e) = self.transition(Status::Connecting) {
            warn!("Cannot connect {}: {}", self.peer_id, e);
            return false;
        }
        self.generation += 1;
        let link = LinkId::new(self.peer_id.clone(), self.generation);

        match ctx.platform.create_peer(&link, ctx.config) {
            Ok(mut capability) => {
                if ctx.config.data_channel {
                    capability.create_data_channel(&DataChannelInit {
                        label: ctx.identity.id.to_string(),
                        ordered: ctx.config.ordered,
                        max_packet_life_time: ctx.config.max_packet_life_time,
                    });
                }
                self.capability = Some(capability);
                true
            }
            Err(e) => {
                warn!("Failed to create peer capability for {}: {}", self.peer_id, e);
                self.fail(ctx);
                false
            }
        }
    }

    /// Tear down and recreate the capability, replaying the local stream
    pub(crate) fn reconnect(&mut self, ctx: &mut LinkContext<'_>) {
        info!("Reconnecting link to {}", self.peer_id);
        self.teardown(ctx);
        self.mark_closed();
        if self.open_capability(ctx) {
            self.add_stream(true, ctx);
        }
    }

    /// Release every owned resource. Safe to call repeatedly.
    pub(crate) fn disconnect(&mut self, ctx: &mut LinkContext<'_>) {
        if self.status == Status::Closed && self.capability.is_none() {
            return;
        }
        info!("Closing link to {}", self.peer_id);
        self.teardown(ctx);
        self.mark_closed();
        ctx.emit(LinkEvent::Closed {
            peer: self.peer_id.clone(),
        });
    }

    fn teardown(&mut self, ctx: &mut LinkContext<'_>) {
        if let Some(mut capability) = self.capability.take() {
            capability.close();
        }
        self.local_candidates.clear();
        self.remote_candidates.clear();
        self.seen_candidates.clear();
        self.remote_description = None;
        self.pending_remote = None;
        self.negotiation_deferred = false;
        self.local_stream = None;
        self.connected_at = None;
        self.audio.reset();
        if self.remote_stream.take().is_some() {
            ctx.emit(LinkEvent::Remote {
                peer: self.peer_id.clone(),
                stream: None,
            });
        }
    }

    fn fail(&mut self, ctx: &mut LinkContext<'_>) {
        if let Err(e) = self.transition(Status::Failed) {
            debug!("Link {} failing outside the failure window: {}", self.peer_id, e);
        }
        ctx.emit(LinkEvent::Failed {
            peer: self.peer_id.clone(),
        });
    }

    fn recover(&mut self, ctx: &mut LinkContext<'_>) {
        if self.reconnect_attempts < ctx.config.max_reconnect_attempts {
            self.reconnect_attempts += 1;
            info!(
                "Recovering link to {} (attempt {}/{})",
                self.peer_id, self.reconnect_attempts, ctx.config.max_reconnect_attempts
            );
            self.reconnect(ctx);
        } else {
            warn!(
                "Giving up on {} after {} reconnect attempts",
                self.peer_id, self.reconnect_attempts
            );
            self.fail(ctx);
        }
    }

    /// The counterpart announced itself again (`peer` envelope)
    pub(crate) fn peer(&mut self, ctx: &mut LinkContext<'_>) {
        if self.capability.is_none() {
            self.connect(ctx);
            return;
        }
        let detached = ctx
            .local_stream
            .map_or(false, |stream| !self.is_stream_attached(stream));
        if detached {
            self.add_stream(false, ctx);
        }
        // Before the first answer the initial negotiation covers the request
        if self.role == Role::Offerer && self.remote_description.is_some() {
            self.negotiate(ctx);
        }
    }

    fn negotiate(&mut self, ctx: &mut LinkContext<'_>) {
        let level = ctx.level();
        let Some(capability) = self.capability.as_mut() else {
            return;
        };
        let state = capability.signaling_state();
        if state != SignalingState::Stable {
            log!(level, "Deferring negotiation with {} ({:?})", self.peer_id, state);
            self.negotiation_deferred = true;
            return;
        }
        match self.role {
            Role::Offerer => {
                log!(level, "Creating offer for {}", self.peer_id);
                capability.create_offer(ctx.config.ice_restart);
            }
            Role::Answerer => {
                log!(level, "Asking {} to renegotiate", self.peer_id);
                let envelope = ctx
                    .address(EnvelopeType::Peer, &self.peer_id)
                    .with_meta(ctx.identity.meta.clone());
                ctx.send(envelope);
            }
        }
    }

    fn is_duplicate_remote(&self, description: &SessionDescription) -> bool {
        self.pending_remote.as_deref() == Some(description.sdp.as_str())
            || self
                .remote_description
                .as_ref()
                .map_or(false, |applied| applied.sdp == description.sdp)
    }

    /// Remote offer received
    pub(crate) fn offer(&mut self, description: SessionDescription, ctx: &mut LinkContext<'_>) {
        if self.capability.is_none() {
            self.connect(ctx);
        }
        let level = ctx.level();
        if self.is_duplicate_remote(&description) {
            log!(level, "Ignoring duplicate offer from {}", self.peer_id);
            return;
        }
        let Some(capability) = self.capability.as_mut() else {
            return;
        };
        let state = capability.signaling_state();
        if state != SignalingState::Stable {
            log!(level, "Ignoring offer from {} in {:?}", self.peer_id, state);
            return;
        }
        log!(level, "Applying offer from {}", self.peer_id);
        self.pending_remote = Some(description.sdp.clone());
        capability.set_remote_description(description);
    }

    /// Remote answer received
    pub(crate) fn answer(&mut self, description: SessionDescription, ctx: &mut LinkContext<'_>) {
        let level = ctx.level();
        if self.is_duplicate_remote(&description) {
            log!(level, "Ignoring duplicate answer from {}", self.peer_id);
            return;
        }
        let Some(capability) = self.capability.as_mut() else {
            log!(level, "Dropping answer from {}: no link", self.peer_id);
            return;
        };
        let state = capability.signaling_state();
        if state != SignalingState::HaveLocalOffer {
            log!(level, "Ignoring answer from {} in {:?}", self.peer_id, state);
            return;
        }
        log!(level, "Applying answer from {}", self.peer_id);
        self.pending_remote = Some(description.sdp.clone());
        capability.set_remote_description(description);
    }

    /// Remote ICE candidate received
    pub(crate) fn ice(&mut self, candidate: IceCandidate, ctx: &mut LinkContext<'_>) {
        let level = ctx.level();
        if self.capability.is_none() {
            log!(level, "Dropping candidate from {}: no link", self.peer_id);
            return;
        }
        if !self.seen_candidates.insert(candidate_key(&candidate)) {
            log!(level, "Ignoring duplicate candidate from {}", self.peer_id);
            return;
        }
        // Later candidates queue behind buffered ones
        if self.remote_candidates.is_empty() && self.can_apply_remote() {
            self.apply_candidate(candidate);
        } else {
            log!(level, "Buffering candidate from {}", self.peer_id);
            self.remote_candidates.push(candidate);
        }
    }

    fn is_stable(&self) -> bool {
        self.capability
            .as_ref()
            .map_or(false, |c| c.signaling_state() == SignalingState::Stable)
    }

    fn can_apply_remote(&self) -> bool {
        self.remote_description.is_some() && self.is_stable()
    }

    fn apply_candidate(&mut self, candidate: IceCandidate) {
        if let Some(capability) = self.capability.as_mut() {
            capability.add_ice_candidate(candidate);
        }
    }

    fn flush_remote_candidates(&mut self) {
        if !self.can_apply_remote() || self.remote_candidates.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.remote_candidates);
        debug!("Applying {} buffered candidates from {}", pending.len(), self.peer_id);
        for candidate in pending {
            self.apply_candidate(candidate);
        }
    }

    fn on_local_candidate(&mut self, candidate: IceCandidate, ctx: &mut LinkContext<'_>) {
        if self.local_candidates.is_empty() && self.is_stable() {
            let envelope = ctx
                .address(EnvelopeType::Ice, &self.peer_id)
                .with_candidate(candidate);
            ctx.send(envelope);
        } else {
            log!(ctx.level(), "Buffering local candidate for {}", self.peer_id);
            self.local_candidates.push(candidate);
        }
    }

    fn flush_local_candidates(&mut self, ctx: &mut LinkContext<'_>) {
        for candidate in std::mem::take(&mut self.local_candidates) {
            let envelope = ctx
                .address(EnvelopeType::Ice, &self.peer_id)
                .with_candidate(candidate);
            ctx.send(envelope);
        }
    }

    /// Attach the coordinator's local stream, replacing senders per kind.
    ///
    /// Only happens in the stable signaling state unless `force` is set.
    pub(crate) fn add_stream(&mut self, force: bool, ctx: &mut LinkContext<'_>) -> bool {
        let Some(stream) = ctx.local_stream else {
            return false;
        };
        let Some(capability) = self.capability.as_mut() else {
            return false;
        };
        if !force && capability.signaling_state() != SignalingState::Stable {
            log!(ctx.level(), "Postponing stream attach for {}", self.peer_id);
            return false;
        }

        let mut kinds = capability.sender_kinds();
        for track in stream.tracks() {
            let kind = track.kind();
            if kinds.contains(&kind) {
                capability.replace_track(kind, track);
            } else {
                capability.add_track(track, stream);
                kinds.push(kind);
            }
        }
        debug!("Attached stream {} to {}", stream.id(), self.peer_id);
        self.local_stream = Some(stream.clone());
        true
    }

    pub(crate) fn remove_stream(&mut self) {
        if let Some(capability) = self.capability.as_mut() {
            capability.remove_tracks();
        }
        self.local_stream = None;
    }

    /// Send over the data channel. Dropped unless the link is open.
    pub fn send(&mut self, text: &str) -> bool {
        if self.status != Status::Open {
            return false;
        }
        let Some(capability) = self.capability.as_mut() else {
            return false;
        };
        if !capability.data_channel_open() {
            return false;
        }
        match capability.send_data(text.to_string()) {
            Ok(()) => true,
            Err(e) => {
                debug!("Failed to send to {}: {}", self.peer_id, e);
                false
            }
        }
    }

    /// Apply a capability completion. Stale generations are dropped.
    pub(crate) fn handle_event(
        &mut self,
        generation: u64,
        event: CapabilityEvent,
        ctx: &mut LinkContext<'_>,
    ) {
        if generation != self.generation || self.capability.is_none() {
            trace!(
                "Dropping stale event for {}#{} (current #{}): {:?}",
                self.peer_id,
                generation,
                self.generation,
                event
            );
            return;
        }

        match event {
            CapabilityEvent::NegotiationNeeded => self.negotiate(ctx),
            CapabilityEvent::DescriptionCreated(description) => {
                if let Some(capability) = self.capability.as_mut() {
                    capability.set_local_description(description);
                }
            }
            CapabilityEvent::LocalDescriptionApplied(description) => {
                self.on_local_description(description, ctx)
            }
            CapabilityEvent::RemoteDescriptionApplied(description) => {
                self.on_remote_description(description)
            }
            CapabilityEvent::OperationFailed { operation, error } => {
                self.on_operation_failed(operation, error, ctx)
            }
            CapabilityEvent::IceCandidate(candidate) => self.on_local_candidate(candidate, ctx),
            CapabilityEvent::SignalingStateChanged(state) => self.on_signaling_state(state, ctx),
            CapabilityEvent::IceConnectionStateChanged(state) => self.on_ice_state(state, ctx),
            CapabilityEvent::TrackAdded { track, stream_id } => {
                self.on_track_added(track, stream_id, ctx)
            }
            CapabilityEvent::TrackRemoved { track_id } => self.on_track_removed(&track_id, ctx),
            CapabilityEvent::DataChannelOpen => self.on_channel_open(ctx),
            CapabilityEvent::DataChannelMessage(text) => self.on_channel_message(&text, ctx),
            CapabilityEvent::DataChannelError(e) => {
                trace!("Ignoring data channel error from {}: {}", self.peer_id, e)
            }
            CapabilityEvent::DataChannelClosed => {
                info!("Data channel to {} closed", self.peer_id);
                self.disconnect(ctx);
            }
            CapabilityEvent::AudioLevel(sample) => self.audio.push(sample),
        }
    }

    fn on_local_description(&mut self, description: SessionDescription, ctx: &mut LinkContext<'_>) {
        let kind = match description.kind {
            SdpType::Offer => EnvelopeType::Offer,
            SdpType::Answer => EnvelopeType::Answer,
            other => {
                trace!("Not forwarding local {:?} description to {}", other, self.peer_id);
                return;
            }
        };
        log!(ctx.level(), "Sending {} to {}", kind, self.peer_id);
        let envelope = ctx.address(kind, &self.peer_id).with_sdp(description);
        ctx.send(envelope);
    }

    fn on_remote_description(&mut self, description: SessionDescription) {
        self.pending_remote = None;
        let kind = description.kind;
        if self.remote_description.as_ref() != Some(&description) {
            // A new description may restart ICE; keep only what is still buffered
            self.seen_candidates = self.remote_candidates.iter().map(candidate_key).collect();
        }
        self.remote_description = Some(description);
        if kind == SdpType::Offer {
            if let Some(capability) = self.capability.as_mut() {
                capability.create_answer();
            }
        }
        self.flush_remote_candidates();
    }

    fn on_operation_failed(
        &mut self,
        operation: Operation,
        error: PlatformError,
        ctx: &mut LinkContext<'_>,
    ) {
        log!(ctx.level(), "{:?} failed for {}: {}", operation, self.peer_id, error);
        match operation {
            Operation::SetRemoteDescription(kind) => {
                self.pending_remote = None;
                if kind == SdpType::Answer {
                    self.recover(ctx);
                }
            }
            // Wrong-state and mismatch errors are transient
            _ => {}
        }
    }

    fn on_signaling_state(&mut self, state: SignalingState, ctx: &mut LinkContext<'_>) {
        log!(ctx.level(), "Signaling state for {}: {:?}", self.peer_id, state);
        match state {
            SignalingState::Stable => {
                let detached = ctx
                    .local_stream
                    .map_or(false, |stream| !self.is_stream_attached(stream));
                if detached {
                    self.add_stream(false, ctx);
                }
                self.flush_local_candidates(ctx);
                self.flush_remote_candidates();
                if self.negotiation_deferred {
                    self.negotiation_deferred = false;
                    self.negotiate(ctx);
                }
            }
            SignalingState::Closed => self.disconnect(ctx),
            _ => {}
        }
    }

    fn on_ice_state(&mut self, state: IceConnectionState, ctx: &mut LinkContext<'_>) {
        match state {
            IceConnectionState::Connected | IceConnectionState::Completed => {
                self.reconnect_attempts = 0;
                if self.status == Status::Connecting && self.transition(Status::Connected).is_ok() {
                    info!("ICE connected to {}", self.peer_id);
                    ctx.emit(LinkEvent::Established {
                        peer: self.peer_id.clone(),
                    });
                }
                if !ctx.config.data_channel && self.open() {
                    info!("Link to {} open without data channel", self.peer_id);
                    self.emit_ready(ctx);
                }
            }
            IceConnectionState::Disconnected => {
                info!("ICE disconnected from {}, renegotiating", self.peer_id);
                self.negotiate(ctx);
            }
            IceConnectionState::Failed => {
                warn!("ICE failed for {}", self.peer_id);
                self.recover(ctx);
            }
            IceConnectionState::New | IceConnectionState::Checking | IceConnectionState::Closed => {
                trace!("ICE state for {}: {:?}", self.peer_id, state);
            }
        }
    }

    fn on_track_added(&mut self, track: TrackRef, stream_id: Option<String>, ctx: &mut LinkContext<'_>) {
        let stream_id = stream_id.unwrap_or_else(|| track.id().to_string());
        let same_stream = self
            .remote_stream
            .as_ref()
            .map_or(false, |stream| stream.id() == stream_id);

        if same_stream {
            let added = self
                .remote_stream
                .as_ref()
                .map_or(false, |stream| stream.add_track(track));
            if !added {
                return;
            }
        } else {
            self.audio.reset();
            self.remote_stream = Some(MediaStream::new(stream_id, vec![track]));
        }
        debug!("Remote track from {}", self.peer_id);
        ctx.emit(LinkEvent::Remote {
            peer: self.peer_id.clone(),
            stream: self.remote_stream.clone(),
        });
    }

    fn on_track_removed(&mut self, track_id: &str, ctx: &mut LinkContext<'_>) {
        let emptied = match self.remote_stream.as_ref() {
            Some(stream) => stream.remove_track(track_id) && stream.is_empty(),
            None => false,
        };
        if emptied {
            debug!("Remote stream from {} ended", self.peer_id);
            self.remote_stream = None;
            self.audio.reset();
            ctx.emit(LinkEvent::Remote {
                peer: self.peer_id.clone(),
                stream: None,
            });
        }
    }

    fn on_channel_open(&mut self, ctx: &mut LinkContext<'_>) {
        if self.status == Status::Connecting && self.transition(Status::Connected).is_ok() {
            ctx.emit(LinkEvent::Established {
                peer: self.peer_id.clone(),
            });
        }
        if self.open() {
            info!("Data channel to {} open", self.peer_id);
            self.emit_ready(ctx);
        }
    }

    fn open(&mut self) -> bool {
        if self.status == Status::Connected && self.transition(Status::Open).is_ok() {
            self.connected_at = Some(now_millis());
            return true;
        }
        false
    }

    fn emit_ready(&self, ctx: &mut LinkContext<'_>) {
        ctx.emit(LinkEvent::Ready {
            peer: self.peer_id.clone(),
        });
    }

    fn on_channel_message(&mut self, text: &str, ctx: &mut LinkContext<'_>) {
        let value: Value =
            serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()));
        let peer = self.peer_id.clone();

        match value.get("type").and_then(Value::as_str) {
            Some("relay") => {
                let chain = value
                    .get("relayChain")
                    .cloned()
                    .and_then(|chain| serde_json::from_value::<Vec<PeerId>>(chain).ok())
                    .unwrap_or_default();
                ctx.emit(LinkEvent::Relay { peer, chain });
            }
            Some("data") => {
                let payload = value.get("data").cloned().unwrap_or(Value::Null);
                ctx.emit(LinkEvent::Data { peer, payload });
            }
            _ => ctx.emit(LinkEvent::Data {
                peer,
                payload: value,
            }),
        }
    }
}

/// Candidates are distinct per ICE generation
fn candidate_key(candidate: &IceCandidate) -> (String, Option<String>) {
    (candidate.candidate.clone(), candidate.username_fragment.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::TrackKind;
    use crate::session::mock::{self, Call, MockHandle, MockPlatform};

    struct Fixture {
        identity: ClientIdentity,
        config: ConnectionConfig,
        platform: MockPlatform,
        handle: MockHandle,
        outbox: Outbox,
        stream: Option<MediaStream>,
    }

    impl Fixture {
        fn new() -> Self {
            let (platform, handle) = MockPlatform::new();
            Self {
                identity: ClientIdentity::new(PeerId::from("me"), Meta::new(), 1),
                config: ConnectionConfig::default(),
                platform,
                handle,
                outbox: Outbox::default(),
                stream: None,
            }
        }

        fn ctx(&mut self) -> LinkContext<'_> {
            LinkContext {
                identity: &self.identity,
                config: &self.config,
                local_stream: self.stream.as_ref(),
                platform: &mut self.platform,
                outbox: &mut self.outbox,
                verbose: true,
            }
        }

        fn connected(&mut self, role: Role) -> Connection {
            let mut link = Connection::new(PeerId::from("a"), role, 5, Meta::new());
            link.connect(&mut self.ctx());
            self.outbox.events.clear();
            self.handle.clear_calls();
            link
        }

        fn fire(&mut self, link: &mut Connection, event: CapabilityEvent) {
            let generation = link.generation();
            link.handle_event(generation, event, &mut self.ctx());
        }

        fn sent(&mut self) -> Vec<Envelope> {
            self.outbox.envelopes.drain(..).collect()
        }

        fn events(&mut self) -> Vec<LinkEvent> {
            self.outbox.events.drain(..).collect()
        }
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{} 1 udp 1 10.0.0.{} 5000 typ host", n, n), Some("0"))
    }

    #[test]
    fn connect_creates_capability_and_channel() {
        let mut fx = Fixture::new();
        let mut link = Connection::new(PeerId::from("a"), Role::Offerer, 5, Meta::new());
        link.connect(&mut fx.ctx());

        assert_eq!(link.status(), Status::Connecting);
        assert_eq!(link.generation(), 1);
        let calls = fx.handle.calls_for("a");
        assert_eq!(calls[0], Call::CreatePeer);
        assert!(matches!(&calls[1], Call::CreateDataChannel(init) if init.label == "me" && init.ordered));
        assert!(matches!(fx.events()[0], LinkEvent::Connected { .. }));

        // Second connect is a no-op
        link.connect(&mut fx.ctx());
        assert_eq!(link.generation(), 1);
    }

    #[test]
    fn create_failure_fails_link() {
        let mut fx = Fixture::new();
        fx.handle.fail_create(true);
        let mut link = Connection::new(PeerId::from("a"), Role::Offerer, 5, Meta::new());
        link.connect(&mut fx.ctx());
        assert_eq!(link.status(), Status::Failed);
        assert!(!link.has_capability());
        assert_eq!(fx.events(), vec![LinkEvent::Failed { peer: PeerId::from("a") }]);
    }

    #[test]
    fn offerer_negotiates_with_ice_restart() {
        let mut fx = Fixture::new();
        let mut link = fx.connected(Role::Offerer);
        fx.fire(&mut link, CapabilityEvent::NegotiationNeeded);
        assert_eq!(fx.handle.calls_for("a"), vec![Call::CreateOffer { ice_restart: true }]);

        fx.fire(&mut link, CapabilityEvent::DescriptionCreated(SessionDescription::offer("o1")));
        fx.fire(&mut link, CapabilityEvent::LocalDescriptionApplied(SessionDescription::offer("o1")));
        let sent = fx.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, EnvelopeType::Offer);
        assert_eq!(sent[0].peer_id, Some(PeerId::from("a")));
        assert_eq!(sent[0].sdp, Some(SessionDescription::offer("o1")));
    }

    #[test]
    fn answerer_asks_for_offer_instead_of_offering() {
        let mut fx = Fixture::new();
        let mut link = fx.connected(Role::Answerer);
        fx.fire(&mut link, CapabilityEvent::NegotiationNeeded);
        assert!(fx.handle.calls_for("a").is_empty());
        let sent = fx.sent();
        assert_eq!(sent[0].kind, EnvelopeType::Peer);
    }

    #[test]
    fn negotiation_is_deferred_until_stable() {
        let mut fx = Fixture::new();
        let mut link = fx.connected(Role::Offerer);
        fx.handle.set_signaling("a", SignalingState::HaveLocalOffer);
        fx.fire(&mut link, CapabilityEvent::NegotiationNeeded);
        assert!(link.is_negotiation_deferred());
        assert!(fx.handle.calls_for("a").is_empty());

        fx.handle.set_signaling("a", SignalingState::Stable);
        fx.fire(&mut link, CapabilityEvent::SignalingStateChanged(SignalingState::Stable));
        assert!(!link.is_negotiation_deferred());
        assert_eq!(fx.handle.calls_for("a"), vec![Call::CreateOffer { ice_restart: true }]);
    }

    #[test]
    fn offer_is_answered() {
        let mut fx = Fixture::new();
        let mut link = fx.connected(Role::Answerer);
        link.offer(SessionDescription::offer("o1"), &mut fx.ctx());
        assert_eq!(fx.handle.calls_for("a"), vec![Call::SetRemote(SessionDescription::offer("o1"))]);

        fx.handle.clear_calls();
        fx.fire(&mut link, CapabilityEvent::RemoteDescriptionApplied(SessionDescription::offer("o1")));
        assert_eq!(fx.handle.calls_for("a"), vec![Call::CreateAnswer]);
        fx.fire(&mut link, CapabilityEvent::LocalDescriptionApplied(SessionDescription::answer("a1")));
        assert_eq!(fx.sent()[0].kind, EnvelopeType::Answer);
    }

    #[test]
    fn duplicate_offer_is_ignored() {
        let mut fx = Fixture::new();
        let mut link = fx.connected(Role::Answerer);
        link.offer(SessionDescription::offer("o1"), &mut fx.ctx());
        link.offer(SessionDescription::offer("o1"), &mut fx.ctx());
        assert_eq!(fx.handle.calls_for("a").len(), 1);
    }

    #[test]
    fn offer_outside_stable_is_ignored() {
        let mut fx = Fixture::new();
        let mut link = fx.connected(Role::Answerer);
        fx.handle.set_signaling("a", SignalingState::HaveLocalOffer);
        link.offer(SessionDescription::offer("o1"), &mut fx.ctx());
        assert!(fx.handle.calls_for("a").is_empty());
    }

    #[test]
    fn offer_without_capability_connects_first() {
        let mut fx = Fixture::new();
        let mut link = Connection::new(PeerId::from("a"), Role::Answerer, 5, Meta::new());
        link.offer(SessionDescription::offer("o1"), &mut fx.ctx());
        let calls = fx.handle.calls_for("a");
        assert_eq!(calls[0], Call::CreatePeer);
        assert_eq!(calls.last(), Some(&Call::SetRemote(SessionDescription::offer("o1"))));
    }

    #[test]
    fn answer_only_applies_with_local_offer() {
        let mut fx = Fixture::new();
        let mut link = fx.connected(Role::Offerer);
        link.answer(SessionDescription::answer("a1"), &mut fx.ctx());
        assert!(fx.handle.calls_for("a").is_empty());

        fx.handle.set_signaling("a", SignalingState::HaveLocalOffer);
        link.answer(SessionDescription::answer("a1"), &mut fx.ctx());
        link.answer(SessionDescription::answer("a1"), &mut fx.ctx());
        assert_eq!(fx.handle.calls_for("a"), vec![Call::SetRemote(SessionDescription::answer("a1"))]);
    }

    #[test]
    fn failed_answer_triggers_reconnect() {
        let mut fx = Fixture::new();
        let mut link = fx.connected(Role::Offerer);
        fx.fire(
            &mut link,
            CapabilityEvent::OperationFailed {
                operation: Operation::SetRemoteDescription(SdpType::Answer),
                error: PlatformError::new("mismatch"),
            },
        );
        assert_eq!(link.generation(), 2);
        assert_eq!(link.status(), Status::Connecting);
        assert_eq!(link.reconnect_attempts(), 1);
    }

    #[test]
    fn transient_errors_do_not_change_status() {
        let mut fx = Fixture::new();
        let mut link = fx.connected(Role::Offerer);
        fx.fire(
            &mut link,
            CapabilityEvent::OperationFailed {
                operation: Operation::CreateOffer,
                error: PlatformError::new("wrong state"),
            },
        );
        assert_eq!(link.status(), Status::Connecting);
        assert_eq!(link.generation(), 1);
    }

    #[test]
    fn remote_candidates_buffer_until_stable_with_description() {
        let mut fx = Fixture::new();
        let mut link = fx.connected(Role::Offerer);
        fx.handle.set_signaling("a", SignalingState::HaveLocalOffer);

        link.ice(candidate(1), &mut fx.ctx());
        link.ice(candidate(2), &mut fx.ctx());
        link.ice(candidate(1), &mut fx.ctx());
        assert_eq!(link.pending_remote_candidates().len(), 2);
        assert!(fx.handle.calls_for("a").is_empty());

        fx.fire(&mut link, CapabilityEvent::RemoteDescriptionApplied(SessionDescription::answer("a1")));
        assert!(fx.handle.calls_for("a").is_empty());

        fx.handle.set_signaling("a", SignalingState::Stable);
        fx.fire(&mut link, CapabilityEvent::SignalingStateChanged(SignalingState::Stable));
        assert_eq!(
            fx.handle.calls_for("a"),
            vec![Call::AddIce(candidate(1)), Call::AddIce(candidate(2))]
        );
        assert!(link.pending_remote_candidates().is_empty());

        // Flushed exactly once
        fx.fire(&mut link, CapabilityEvent::SignalingStateChanged(SignalingState::Stable));
        assert_eq!(fx.handle.calls_for("a").len(), 2);
    }

    #[test]
    fn candidates_apply_directly_once_stable() {
        let mut fx = Fixture::new();
        let mut link = fx.connected(Role::Offerer);
        fx.fire(&mut link, CapabilityEvent::RemoteDescriptionApplied(SessionDescription::answer("a1")));
        link.ice(candidate(3), &mut fx.ctx());
        assert_eq!(fx.handle.calls_for("a"), vec![Call::AddIce(candidate(3))]);
    }

    #[test]
    fn local_candidates_flush_in_order_on_stable() {
        let mut fx = Fixture::new();
        let mut link = fx.connected(Role::Offerer);
        fx.handle.set_signaling("a", SignalingState::HaveLocalOffer);
        fx.fire(&mut link, CapabilityEvent::IceCandidate(candidate(1)));
        fx.fire(&mut link, CapabilityEvent::IceCandidate(candidate(2)));
        assert!(fx.sent().is_empty());

        fx.handle.set_signaling("a", SignalingState::Stable);
        fx.fire(&mut link, CapabilityEvent::SignalingStateChanged(SignalingState::Stable));
        let sent: Vec<_> = fx.sent().into_iter().filter_map(|e| e.candidate).collect();
        assert_eq!(sent, vec![candidate(1), candidate(2)]);
    }

    fn restart_candidate(ufrag: &str) -> IceCandidate {
        IceCandidate {
            username_fragment: Some(ufrag.to_string()),
            ..candidate(7)
        }
    }

    #[test]
    fn remote_candidate_queues_behind_buffered_ones() {
        let mut fx = Fixture::new();
        let mut link = fx.connected(Role::Offerer);
        fx.handle.set_signaling("a", SignalingState::HaveLocalOffer);
        link.ice(candidate(1), &mut fx.ctx());
        fx.fire(&mut link, CapabilityEvent::RemoteDescriptionApplied(SessionDescription::answer("a1")));

        // Platform is already stable but the state change is still queued
        fx.handle.set_signaling("a", SignalingState::Stable);
        link.ice(candidate(2), &mut fx.ctx());
        assert!(fx.handle.calls_for("a").is_empty());

        fx.fire(&mut link, CapabilityEvent::SignalingStateChanged(SignalingState::Stable));
        assert_eq!(
            fx.handle.calls_for("a"),
            vec![Call::AddIce(candidate(1)), Call::AddIce(candidate(2))]
        );
    }

    #[test]
    fn local_candidate_queues_behind_buffered_ones() {
        let mut fx = Fixture::new();
        let mut link = fx.connected(Role::Offerer);
        fx.handle.set_signaling("a", SignalingState::HaveLocalOffer);
        fx.fire(&mut link, CapabilityEvent::IceCandidate(candidate(1)));

        fx.handle.set_signaling("a", SignalingState::Stable);
        fx.fire(&mut link, CapabilityEvent::IceCandidate(candidate(2)));
        assert!(fx.sent().is_empty());

        fx.fire(&mut link, CapabilityEvent::SignalingStateChanged(SignalingState::Stable));
        let sent: Vec<_> = fx.sent().into_iter().filter_map(|e| e.candidate).collect();
        assert_eq!(sent, vec![candidate(1), candidate(2)]);
    }

    #[test]
    fn restarted_ice_accepts_repeated_candidate_string() {
        let mut fx = Fixture::new();
        let mut link = fx.connected(Role::Offerer);
        fx.fire(&mut link, CapabilityEvent::RemoteDescriptionApplied(SessionDescription::answer("a1")));
        link.ice(restart_candidate("u1"), &mut fx.ctx());
        link.ice(restart_candidate("u1"), &mut fx.ctx());
        assert_eq!(fx.handle.calls_for("a"), vec![Call::AddIce(restart_candidate("u1"))]);

        fx.fire(&mut link, CapabilityEvent::IceConnectionStateChanged(IceConnectionState::Disconnected));
        fx.fire(&mut link, CapabilityEvent::RemoteDescriptionApplied(SessionDescription::answer("a2")));
        fx.handle.clear_calls();
        link.ice(restart_candidate("u2"), &mut fx.ctx());
        assert_eq!(fx.handle.calls_for("a"), vec![Call::AddIce(restart_candidate("u2"))]);
    }

    #[test]
    fn new_description_keeps_buffered_candidates_unique() {
        let mut fx = Fixture::new();
        let mut link = fx.connected(Role::Offerer);
        fx.handle.set_signaling("a", SignalingState::HaveLocalOffer);
        link.ice(candidate(1), &mut fx.ctx());
        fx.fire(&mut link, CapabilityEvent::RemoteDescriptionApplied(SessionDescription::answer("a1")));
        link.ice(candidate(1), &mut fx.ctx());
        assert_eq!(link.pending_remote_candidates().len(), 1);
    }

    #[test]
    fn link_without_channel_opens_on_ice() {
        let mut fx = Fixture::new();
        fx.config.data_channel = false;
        let mut link = fx.connected(Role::Offerer);
        fx.fire(&mut link, CapabilityEvent::IceConnectionStateChanged(IceConnectionState::Connected));
        assert_eq!(link.status(), Status::Open);
        assert!(link.connected_at().is_some());

        fx.fire(&mut link, CapabilityEvent::IceConnectionStateChanged(IceConnectionState::Completed));
        assert_eq!(
            fx.events(),
            vec![
                LinkEvent::Established { peer: PeerId::from("a") },
                LinkEvent::Ready { peer: PeerId::from("a") },
            ]
        );
    }

    #[test]
    fn reconnect_clears_connect_time() {
        let mut fx = Fixture::new();
        let mut link = fx.connected(Role::Offerer);
        fx.fire(&mut link, CapabilityEvent::DataChannelOpen);
        assert!(link.connected_at().is_some());

        link.reconnect(&mut fx.ctx());
        assert_eq!(link.status(), Status::Connecting);
        assert_eq!(link.connected_at(), None);
    }

    #[test]
    fn status_follows_ice_and_channel() {
        let mut fx = Fixture::new();
        let mut link = fx.connected(Role::Offerer);
        fx.fire(&mut link, CapabilityEvent::IceConnectionStateChanged(IceConnectionState::Connected));
        assert_eq!(link.status(), Status::Connected);
        fx.fire(&mut link, CapabilityEvent::DataChannelOpen);
        assert_eq!(link.status(), Status::Open);
        assert!(link.connected_at().is_some());
        assert_eq!(
            fx.events(),
            vec![
                LinkEvent::Established { peer: PeerId::from("a") },
                LinkEvent::Ready { peer: PeerId::from("a") },
            ]
        );
    }

    #[test]
    fn channel_open_before_ice_still_walks_every_state() {
        let mut fx = Fixture::new();
        let mut link = fx.connected(Role::Offerer);
        fx.fire(&mut link, CapabilityEvent::DataChannelOpen);
        assert_eq!(link.status(), Status::Open);
        assert_eq!(fx.events().len(), 2);
    }

    #[test]
    fn ice_disconnected_renegotiates_in_place() {
        let mut fx = Fixture::new();
        let mut link = fx.connected(Role::Offerer);
        fx.fire(&mut link, CapabilityEvent::IceConnectionStateChanged(IceConnectionState::Disconnected));
        assert_eq!(link.generation(), 1);
        assert_eq!(fx.handle.calls_for("a"), vec![Call::CreateOffer { ice_restart: true }]);
    }

    #[test]
    fn ice_failed_reconnects_and_replays_stream() {
        let mut fx = Fixture::new();
        fx.stream = Some(mock::stream("local", &[TrackKind::Audio, TrackKind::Video]));
        let mut link = fx.connected(Role::Offerer);
        // Capability state is unstable, forcing the replay path
        fx.handle.set_signaling("a", SignalingState::HaveLocalOffer);

        fx.fire(&mut link, CapabilityEvent::IceConnectionStateChanged(IceConnectionState::Failed));
        assert_eq!(link.generation(), 2);
        let calls = fx.handle.calls_for("a");
        assert_eq!(calls[0], Call::Close);
        assert_eq!(calls[1], Call::CreatePeer);
        assert!(calls.contains(&Call::AddTrack("local-audio".to_string())));
        assert!(calls.contains(&Call::AddTrack("local-video".to_string())));
        assert!(link.is_stream_attached(fx.stream.as_ref().unwrap()));
    }

    #[test]
    fn repeated_ice_failure_gives_up() {
        let mut fx = Fixture::new();
        fx.config.max_reconnect_attempts = 1;
        let mut link = fx.connected(Role::Offerer);
        fx.fire(&mut link, CapabilityEvent::IceConnectionStateChanged(IceConnectionState::Failed));
        fx.events();
        fx.fire(&mut link, CapabilityEvent::IceConnectionStateChanged(IceConnectionState::Failed));
        assert_eq!(link.status(), Status::Failed);
        assert_eq!(fx.events(), vec![LinkEvent::Failed { peer: PeerId::from("a") }]);
    }

    #[test]
    fn stale_generation_is_dropped() {
        let mut fx = Fixture::new();
        let mut link = fx.connected(Role::Offerer);
        link.reconnect(&mut fx.ctx());
        fx.handle.clear_calls();
        link.handle_event(1, CapabilityEvent::NegotiationNeeded, &mut fx.ctx());
        assert!(fx.handle.calls_for("a").is_empty());
    }

    #[test]
    fn events_after_disconnect_are_dropped() {
        let mut fx = Fixture::new();
        let mut link = fx.connected(Role::Offerer);
        link.disconnect(&mut fx.ctx());
        fx.handle.clear_calls();
        link.handle_event(1, CapabilityEvent::NegotiationNeeded, &mut fx.ctx());
        assert!(fx.handle.calls_for("a").is_empty());
    }

    #[test]
    fn disconnect_is_idempotent() {
        let mut fx = Fixture::new();
        let mut link = fx.connected(Role::Offerer);
        link.disconnect(&mut fx.ctx());
        link.disconnect(&mut fx.ctx());
        assert_eq!(link.status(), Status::Closed);
        assert_eq!(fx.events(), vec![LinkEvent::Closed { peer: PeerId::from("a") }]);
        assert_eq!(fx.handle.calls_for("a"), vec![Call::Close]);
    }

    #[test]
    fn signaling_closed_disconnects() {
        let mut fx = Fixture::new();
        let mut link = fx.connected(Role::Offerer);
        fx.fire(&mut link, CapabilityEvent::SignalingStateChanged(SignalingState::Closed));
        assert_eq!(link.status(), Status::Closed);
    }

    #[test]
    fn add_stream_replaces_existing_senders() {
        let mut fx = Fixture::new();
        let mut link = fx.connected(Role::Offerer);
        fx.stream = Some(mock::stream("cam", &[TrackKind::Audio, TrackKind::Video]));
        assert!(link.add_stream(false, &mut fx.ctx()));

        fx.stream = Some(mock::stream("screen", &[TrackKind::Video]));
        assert!(link.add_stream(false, &mut fx.ctx()));
        let calls = fx.handle.calls_for("a");
        assert_eq!(
            calls,
            vec![
                Call::AddTrack("cam-audio".to_string()),
                Call::AddTrack("cam-video".to_string()),
                Call::ReplaceTrack(TrackKind::Video, "screen-video".to_string()),
            ]
        );
    }

    #[test]
    fn add_stream_waits_for_stable_unless_forced() {
        let mut fx = Fixture::new();
        let mut link = fx.connected(Role::Offerer);
        fx.stream = Some(mock::stream("cam", &[TrackKind::Audio]));
        fx.handle.set_signaling("a", SignalingState::HaveRemoteOffer);
        assert!(!link.add_stream(false, &mut fx.ctx()));

        fx.handle.set_signaling("a", SignalingState::Stable);
        fx.fire(&mut link, CapabilityEvent::SignalingStateChanged(SignalingState::Stable));
        assert!(link.is_stream_attached(fx.stream.as_ref().unwrap()));
    }

    #[test]
    fn send_requires_open_channel() {
        let mut fx = Fixture::new();
        let mut link = fx.connected(Role::Offerer);
        assert!(!link.send("hello"));

        fx.fire(&mut link, CapabilityEvent::DataChannelOpen);
        assert!(!link.send("hello"));
        fx.handle.set_channel_open("a", true);
        assert!(link.send("hello"));
        assert_eq!(fx.handle.calls_for("a"), vec![Call::SendData("hello".to_string())]);
    }

    #[test]
    fn channel_messages_are_classified() {
        let mut fx = Fixture::new();
        let mut link = fx.connected(Role::Offerer);
        fx.fire(
            &mut link,
            CapabilityEvent::DataChannelMessage(r#"{"type":"relay","relayChain":["x","y"]}"#.to_string()),
        );
        fx.fire(
            &mut link,
            CapabilityEvent::DataChannelMessage(r#"{"type":"data","data":{"n":1}}"#.to_string()),
        );
        fx.fire(&mut link, CapabilityEvent::DataChannelMessage("plain".to_string()));

        let events = fx.events();
        assert_eq!(
            events[0],
            LinkEvent::Relay {
                peer: PeerId::from("a"),
                chain: vec![PeerId::from("x"), PeerId::from("y")],
            }
        );
        assert_eq!(
            events[1],
            LinkEvent::Data { peer: PeerId::from("a"), payload: serde_json::json!({"n": 1}) }
        );
        assert_eq!(
            events[2],
            LinkEvent::Data { peer: PeerId::from("a"), payload: Value::String("plain".to_string()) }
        );
    }

    #[test]
    fn remote_tracks_group_into_stream() {
        let mut fx = Fixture::new();
        let mut link = fx.connected(Role::Offerer);
        let audio = mock::track("r-audio", TrackKind::Audio);
        let video = mock::track("r-video", TrackKind::Video);
        fx.fire(&mut link, CapabilityEvent::TrackAdded { track: audio, stream_id: Some("rs".into()) });
        fx.fire(&mut link, CapabilityEvent::TrackAdded { track: video, stream_id: Some("rs".into()) });
        assert_eq!(link.remote_stream().map(|s| s.tracks().len()), Some(2));

        fx.fire(&mut link, CapabilityEvent::AudioLevel(0.8));
        assert!(link.audio_level() > 0.0);

        fx.fire(&mut link, CapabilityEvent::TrackRemoved { track_id: "r-audio".into() });
        fx.fire(&mut link, CapabilityEvent::TrackRemoved { track_id: "r-video".into() });
        assert!(link.remote_stream().is_none());
        assert_eq!(link.audio_level(), 0.0);
        let events = fx.events();
        assert_eq!(
            events.last(),
            Some(&LinkEvent::Remote { peer: PeerId::from("a"), stream: None })
        );
    }

    #[test]
    fn peer_renegotiates_only_after_first_answer() {
        let mut fx = Fixture::new();
        let mut link = fx.connected(Role::Offerer);
        link.peer(&mut fx.ctx());
        assert!(fx.handle.calls_for("a").is_empty());

        fx.fire(&mut link, CapabilityEvent::RemoteDescriptionApplied(SessionDescription::answer("a1")));
        link.peer(&mut fx.ctx());
        assert_eq!(fx.handle.calls_for("a"), vec![Call::CreateOffer { ice_restart: true }]);
    }

    #[test]
    fn peer_reattaches_local_stream() {
        let mut fx = Fixture::new();
        let mut link = fx.connected(Role::Answerer);
        fx.stream = Some(mock::stream("cam", &[TrackKind::Audio]));
        link.peer(&mut fx.ctx());
        assert_eq!(fx.handle.calls_for("a"), vec![Call::AddTrack("cam-audio".to_string())]);
        link.peer(&mut fx.ctx());
        assert_eq!(fx.handle.calls_for("a").len(), 1);
    }
}
