//! Session coordinator
//!
//! [`Network`] owns this client's identity, the peer registry, the local
//! capture stream, relay-chain bookkeeping, the admission queue and the
//! dominant-speaker poll. Every entry point runs to completion and then
//! drains the side effects its links produced.

use super::admission::AdmissionQueue;
use super::connection::{Connection, LinkContext, LinkEvent, Outbox};
use super::events::{EventBus, NetworkEvent};
use super::registry::PeerRegistry;
use super::relay_chain::{ChainUpdate, RelayChain};
use super::role::{assign_role, Participant};
use super::status::Status;
use super::timer::{Scheduler, TimerId, TimerKind, TimerSet};
use crate::config::{Config, ConnectionConfig, IdentityConfig, NetworkConfig};
use crate::error::PlatformError;
use crate::platform::{
    CapabilityEvent, CaptureKind, LinkId, MediaStream, Platform, RelaySender, TrackKind,
};
use crate::signaling::{Envelope, EnvelopeType, Meta, PeerId, Role};
use crate::utils::now_millis;
use log::{debug, info, trace, warn};
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::broadcast;

/// This client's identity
#[derive(Debug, Clone, PartialEq)]
pub struct ClientIdentity {
    pub id: PeerId,
    pub meta: Meta,
    /// Session start (ms since epoch), used in role tie-breaks
    pub time_stamp: u64,
}

impl ClientIdentity {
    pub fn new(id: PeerId, meta: Meta, time_stamp: u64) -> Self {
        Self { id, meta, time_stamp }
    }

    pub fn from_config(config: &IdentityConfig) -> Self {
        let id = config
            .client_id
            .as_deref()
            .map(PeerId::from)
            .unwrap_or_else(PeerId::random);
        Self::new(id, config.meta.clone(), now_millis())
    }
}

/// Snapshot of one link
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: PeerId,
    pub role: Role,
    pub status: Status,
    pub meta: Meta,
    pub time_stamp: u64,
    pub connected_at: Option<u64>,
    pub has_remote_stream: bool,
    pub relay_member: bool,
}

impl From<&Connection> for ClientInfo {
    fn from(link: &Connection) -> Self {
        Self {
            id: link.peer_id().clone(),
            role: link.role(),
            status: link.status(),
            meta: link.meta().clone(),
            time_stamp: link.time_stamp(),
            connected_at: link.connected_at(),
            has_remote_stream: link.remote_stream().is_some(),
            relay_member: link.is_relay_member(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingCapture {
    kind: CaptureKind,
    video: bool,
    audio: bool,
}

pub struct Network {
    identity: ClientIdentity,
    network: NetworkConfig,
    connection: ConnectionConfig,
    platform: Box<dyn Platform>,
    relay: Option<Box<dyn RelaySender>>,
    relay_open: bool,
    joined: bool,
    links: PeerRegistry,
    stream: Option<MediaStream>,
    camera: Option<MediaStream>,
    screen: Option<MediaStream>,
    pending_capture: Option<PendingCapture>,
    relay_chain: RelayChain,
    admission: AdmissionQueue,
    speaker: Option<PeerId>,
    timers: TimerSet,
    events: EventBus,
    outbox: Outbox,
}

impl Network {
    pub fn new(
        identity: ClientIdentity,
        config: &Config,
        platform: Box<dyn Platform>,
        scheduler: Box<dyn Scheduler>,
    ) -> Self {
        Self {
            identity,
            network: config.network.clone(),
            connection: config.connection.clone(),
            platform,
            relay: None,
            relay_open: false,
            joined: false,
            links: PeerRegistry::new(),
            stream: None,
            camera: None,
            screen: None,
            pending_capture: None,
            relay_chain: RelayChain::new(),
            admission: AdmissionQueue::new(config.network.max_connections),
            speaker: None,
            timers: TimerSet::new(scheduler),
            events: EventBus::new(config.network.event_capacity),
            outbox: Outbox::default(),
        }
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events.subscribe()
    }

    pub fn event_bus(&self) -> EventBus {
        self.events.clone()
    }

    pub fn is_joined(&self) -> bool {
        self.joined
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.is_some()
    }

    pub fn local_stream(&self) -> Option<&MediaStream> {
        self.stream.as_ref()
    }

    pub fn relay_chain(&self) -> &[PeerId] {
        self.relay_chain.peers()
    }

    pub fn pending_admissions(&self) -> Vec<PeerId> {
        self.admission.peers()
    }

    pub fn dominant_speaker(&self) -> Option<&PeerId> {
        self.speaker.as_ref()
    }

    pub fn connection(&self, peer: &PeerId) -> Option<&Connection> {
        self.links.get(peer)
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        self.links.iter().map(ClientInfo::from).collect()
    }

    pub fn client_status(&self, peer: &PeerId) -> Option<Status> {
        self.links.get(peer).map(Connection::status)
    }

    // ---- relay wiring ----

    /// Attach the outbound half of a relay transport
    pub fn connect(&mut self, relay: Box<dyn RelaySender>) {
        self.relay = Some(relay);
        self.relay_open = false;
    }

    pub fn on_open(&mut self) {
        info!("Relay open, joining as {}", self.identity.id);
        self.relay_open = true;
        self.send_join();
    }

    pub fn on_error(&mut self, reason: &str) {
        warn!("Relay error: {}", reason);
    }

    pub fn on_close(&mut self) {
        info!("Relay closed");
        self.relay_open = false;
        self.joined = false;
    }

    pub fn on_message(&mut self, text: &str) {
        match Envelope::from_json(text) {
            Ok(envelope) => self.dispatch(envelope),
            Err(e) => debug!("Dropping malformed envelope: {}", e),
        }
    }

    /// Route one inbound envelope
    pub fn dispatch(&mut self, envelope: Envelope) {
        if envelope.client_id == self.identity.id {
            return;
        }
        if !envelope.is_addressed_to(&self.identity.id) {
            trace!("Dropping {} for another peer", envelope.kind);
            return;
        }
        debug!("Received {} from {}", envelope.kind, envelope.client_id);
        self.route(envelope);
        self.flush();
    }

    fn route(&mut self, envelope: Envelope) {
        let peer = envelope.client_id.clone();
        match envelope.kind {
            EnvelopeType::Join => self.on_join(envelope),
            EnvelopeType::Peer => self.on_peer(envelope),
            EnvelopeType::Offer => {
                if let Some(sdp) = envelope.sdp {
                    self.with_link(&peer, |link, ctx| link.offer(sdp, ctx));
                }
            }
            EnvelopeType::Answer => {
                if let Some(sdp) = envelope.sdp {
                    self.with_link(&peer, |link, ctx| link.answer(sdp, ctx));
                }
            }
            EnvelopeType::Ice => {
                if let Some(candidate) = envelope.candidate {
                    self.with_link(&peer, |link, ctx| link.ice(candidate, ctx));
                }
            }
            EnvelopeType::Rollback => {
                self.with_link(&peer, |link, ctx| link.reconnect(ctx));
            }
            EnvelopeType::Leave | EnvelopeType::Disconnect => self.on_leave(&peer),
            EnvelopeType::Meta => self.on_meta(envelope),
            _ => self.events.emit(NetworkEvent::Message(envelope)),
        }
    }

    fn on_join(&mut self, envelope: Envelope) {
        let peer = envelope.client_id.clone();

        if self.is_linked(&peer) {
            self.on_rejoin(envelope);
            return;
        }

        if self.network.relay_chain && self.relay_chain.conflicts_with(envelope.chain()) {
            warn!(
                "Rejecting join from {}: relay chain {:?} overlaps {:?}",
                peer,
                envelope.chain(),
                self.relay_chain.peers()
            );
            self.admission.remove(&peer);
            self.with_link(&peer, |link, ctx| link.disconnect(ctx));
            return;
        }

        if !self.links.contains(&peer) && self.admission.at_capacity(self.links.len()) {
            info!("Connection limit reached, queueing join from {}", peer);
            self.admission.enqueue(envelope);
            self.arm_admission_retry();
            return;
        }

        let chain_changed = self.network.relay_chain
            && self.relay_chain.accept_join(envelope.chain(), &self.identity.id)
                == ChainUpdate::Adopted;

        self.open(&envelope);
        let echo = self.announce(EnvelopeType::Peer).to(peer);
        self.send(echo);

        if chain_changed {
            self.on_chain_changed();
        }
    }

    /// A live peer re-announcing itself, e.g. after its relay reconnected.
    /// Its chain already contains the links it shares with us.
    fn on_rejoin(&mut self, envelope: Envelope) {
        let peer = envelope.client_id.clone();
        debug!("Join from linked peer {}, keeping link", peer);
        if let Some(meta) = envelope.meta.filter(|meta| !meta.is_empty()) {
            if let Some(link) = self.links.get_mut(&peer) {
                link.set_meta(meta);
            }
        }
        let echo = self.announce(EnvelopeType::Peer).to(peer);
        self.send(echo);
    }

    fn is_linked(&self, peer: &PeerId) -> bool {
        self.links
            .get(peer)
            .map_or(false, |link| !matches!(link.status(), Status::Closed | Status::Failed))
    }

    fn on_peer(&mut self, envelope: Envelope) {
        let peer = envelope.client_id.clone();

        if self.links.contains(&peer) {
            if let Some(meta) = envelope.meta.clone() {
                if let Some(link) = self.links.get_mut(&peer) {
                    link.set_meta(meta);
                }
            }
            self.with_link(&peer, |link, ctx| link.peer(ctx));
            self.merge_chain(&peer, envelope.chain());
            return;
        }

        if self.network.relay_chain && self.relay_chain.rejects_extension(envelope.chain()) {
            warn!("Ignoring peer {}: relay chain {:?} overlaps ours", peer, envelope.chain());
            return;
        }

        if self.admission.at_capacity(self.links.len()) {
            info!("Connection limit reached, queueing peer {}", peer);
            self.admission.enqueue(envelope);
            self.arm_admission_retry();
            return;
        }

        // Role is settled before adopting the announced chain
        self.open(&envelope);
        self.merge_chain(&peer, envelope.chain());
    }

    /// Create the link for `envelope`'s sender, or restart an existing one
    fn open(&mut self, envelope: &Envelope) {
        let peer = envelope.client_id.clone();
        let role = self.role_for(envelope);
        let meta = envelope.meta.clone().unwrap_or_default();
        let time_stamp = envelope.time_stamp;

        if self.links.contains(&peer) {
            info!("Reopening link to {} as {}", peer, role);
            self.with_link(&peer, |link, ctx| {
                link.set_role(role);
                link.set_time_stamp(time_stamp);
                if !meta.is_empty() {
                    link.set_meta(meta);
                }
                link.reconnect(ctx);
            });
            return;
        }

        let mut link = Connection::new(peer.clone(), role, time_stamp, meta);
        link.set_relay_member(self.relay_chain.contains(&peer));
        if let Err(e) = self.links.insert(link) {
            warn!("Cannot open link: {}", e);
            return;
        }
        self.with_link(&peer, |link, ctx| link.connect(ctx));
    }

    fn role_for(&self, envelope: &Envelope) -> Role {
        let overlay = self.network.relay_chain;
        let local = Participant {
            id: &self.identity.id,
            time_stamp: self.identity.time_stamp,
            forced: self.network.forced_role,
            relay_member: overlay && !self.relay_chain.is_empty(),
        };
        let remote = Participant {
            id: &envelope.client_id,
            time_stamp: envelope.time_stamp,
            forced: envelope.role,
            relay_member: overlay && !envelope.chain().is_empty(),
        };
        assign_role(&local, &remote, self.network.role_policy)
    }

    fn on_leave(&mut self, peer: &PeerId) {
        self.admission.remove(peer);
        if self.with_link(peer, |link, ctx| link.disconnect(ctx)).is_none() {
            trace!("Leave from unknown peer {}", peer);
        }
    }

    fn on_meta(&mut self, envelope: Envelope) {
        let peer = envelope.client_id;
        let meta = envelope.meta.unwrap_or_default();
        if let Some(link) = self.links.get_mut(&peer) {
            link.set_meta(meta.clone());
        }
        self.events.emit(NetworkEvent::Meta { peer, meta });
    }

    // ---- relay chain ----

    fn merge_chain(&mut self, from: &PeerId, chain: &[PeerId]) {
        if !self.network.relay_chain {
            return;
        }
        match self.relay_chain.accept_extension(chain, &self.identity.id) {
            ChainUpdate::Adopted => self.on_chain_changed(),
            ChainUpdate::Conflict => {
                warn!("Relay chain from {} conflicts with ours, dropping link", from);
                self.with_link(from, |link, ctx| link.disconnect(ctx));
            }
            ChainUpdate::Unchanged => {}
        }
    }

    /// Refresh membership flags and forward the chain to links outside it
    fn on_chain_changed(&mut self) {
        let chain = self.relay_chain.peers().to_vec();
        debug!("Relay chain is now {:?}", chain);

        let message = json!({
            "type": "relay",
            "clientId": self.identity.id,
            "timeStamp": self.identity.time_stamp,
            "relayChain": chain,
        })
        .to_string();

        for link in self.links.iter_mut() {
            let member = chain.contains(link.peer_id());
            link.set_relay_member(member);
            if !member && link.send(&message) {
                debug!("Forwarded relay chain to {}", link.peer_id());
            }
        }
    }

    // ---- capability and timer inputs ----

    /// Feed back a completion from the platform
    pub fn on_capability_event(&mut self, link: LinkId, event: CapabilityEvent) {
        let generation = link.generation;
        if self
            .with_link(&link.peer, |conn, ctx| conn.handle_event(generation, event, ctx))
            .is_none()
        {
            trace!("Dropping event for unknown link {}", link);
        }
        self.flush();
    }

    pub fn on_timer(&mut self, timer: TimerId) {
        if !self.timers.accept(timer) {
            trace!("Ignoring stale timer {:?}", timer);
            return;
        }
        match timer.kind {
            TimerKind::AudioPoll => {
                if self.stream.is_none() {
                    return;
                }
                self.check_audio();
                self.timers.schedule(TimerKind::AudioPoll, self.audio_poll_interval());
            }
            TimerKind::AdmissionRetry => self.admit_pending(),
        }
        self.flush();
    }

    fn audio_poll_interval(&self) -> Duration {
        Duration::from_millis(self.network.audio_poll_ms)
    }

    /// Pick the loudest remote peer; switch only on a strictly louder one
    fn check_audio(&mut self) {
        let current = self
            .speaker
            .as_ref()
            .and_then(|peer| self.links.get(peer))
            .map_or(0.0, Connection::audio_level);

        let mut loudest: Option<(&PeerId, f64)> = None;
        for link in self.links.iter() {
            let level = link.audio_level();
            if level > 0.0 && loudest.map_or(true, |(_, best)| level > best) {
                loudest = Some((link.peer_id(), level));
            }
        }

        let Some((peer, level)) = loudest else {
            return;
        };
        if self.speaker.as_ref() == Some(peer) {
            return;
        }
        if self.speaker.is_some() && level <= current {
            return;
        }

        let peer = peer.clone();
        let stream = self.links.get(&peer).and_then(|link| link.remote_stream().cloned());
        debug!("Dominant speaker is now {} ({:.3})", peer, level);
        self.speaker = Some(peer.clone());
        self.events.emit(NetworkEvent::Audio { peer, stream });
    }

    // ---- admission ----

    fn arm_admission_retry(&mut self) {
        if !self.timers.is_active(TimerKind::AdmissionRetry) {
            self.timers.schedule(
                TimerKind::AdmissionRetry,
                Duration::from_millis(self.network.admission_retry_ms),
            );
        }
    }

    fn admit_pending(&mut self) {
        while !self.admission.at_capacity(self.links.len()) {
            let Some(envelope) = self.admission.dequeue() else {
                break;
            };
            let peer = envelope.client_id.clone();
            info!("Admitting queued {} from {}", envelope.kind, peer);
            match envelope.kind {
                EnvelopeType::Peer => {
                    self.on_peer(envelope);
                    // The sender's link may hold an offer we dropped while queued
                    if self.links.contains(&peer) {
                        let rollback = self.envelope(EnvelopeType::Rollback).to(peer);
                        self.send(rollback);
                    }
                }
                _ => self.on_join(envelope),
            }
        }

        if self.admission.is_empty() {
            self.timers.cancel(TimerKind::AdmissionRetry);
        } else {
            self.arm_admission_retry();
        }
    }

    // ---- local media ----

    /// Acquire camera and microphone, then attach them to every link.
    /// `video`/`audio` set the initial enabled flags.
    pub fn start_streaming(&mut self, video: bool, audio: bool) {
        if !self.joined && self.relay_open {
            info!("Rejoining session");
            self.send_join();
        }
        self.pending_capture = Some(PendingCapture {
            kind: CaptureKind::UserMedia,
            video,
            audio,
        });
        self.platform.acquire_user_media();
    }

    /// Acquire a screen capture to stand in for camera video
    pub fn start_sharing(&mut self) {
        self.pending_capture = Some(PendingCapture {
            kind: CaptureKind::Display,
            video: true,
            audio: false,
        });
        self.platform.acquire_display_media();
    }

    /// Deliver a capture result requested earlier
    pub fn on_capture(&mut self, kind: CaptureKind, result: Result<MediaStream, PlatformError>) {
        let pending = match self.pending_capture.take() {
            Some(pending) if pending.kind == kind => pending,
            other => {
                self.pending_capture = other;
                debug!("Discarding unrequested {:?} capture", kind);
                if let Ok(stream) = result {
                    stream.stop();
                }
                return;
            }
        };

        match result {
            Err(e) => {
                warn!("{:?} capture failed: {}", kind, e);
                self.events.emit(NetworkEvent::Error {
                    reason: format!("capture failed: {}", e),
                });
            }
            Ok(stream) => match kind {
                CaptureKind::UserMedia => self.on_user_media(stream, pending.video, pending.audio),
                CaptureKind::Display => self.on_display_media(stream),
            },
        }
        self.flush();
    }

    fn on_user_media(&mut self, stream: MediaStream, video: bool, audio: bool) {
        stream.set_enabled(TrackKind::Video, video);
        stream.set_enabled(TrackKind::Audio, audio);

        for previous in [self.screen.take(), self.camera.take(), self.stream.take()]
            .into_iter()
            .flatten()
        {
            previous.stop();
        }

        info!("Local stream {} ready", stream.id());
        self.stream = Some(stream.clone());
        self.attach_all();
        self.events.emit(NetworkEvent::Stream {
            stream: Some(stream),
        });

        if self.network.relay_chain && self.relay_chain.commit(&self.identity.id) {
            self.on_chain_changed();
        }

        self.speaker = None;
        self.timers.schedule(TimerKind::AudioPoll, self.audio_poll_interval());
    }

    fn on_display_media(&mut self, screen: MediaStream) {
        match self.screen.take() {
            Some(previous) => previous.stop(),
            None => self.camera = self.stream.take(),
        }

        let mut tracks = screen.tracks_of(TrackKind::Video);
        if let Some(camera) = &self.camera {
            tracks.extend(camera.tracks_of(TrackKind::Audio));
        }
        let composite = MediaStream::new(format!("{}+share", screen.id()), tracks);

        info!("Sharing screen {}", screen.id());
        self.screen = Some(screen);
        self.stream = Some(composite.clone());
        self.attach_all();
        self.events.emit(NetworkEvent::Stream {
            stream: Some(composite),
        });
    }

    /// Stop the screen share and restore the camera. Returns false when
    /// nothing was being shared.
    pub fn stop_sharing(&mut self) -> bool {
        let Some(screen) = self.screen.take() else {
            return false;
        };
        info!("Stopping screen share {}", screen.id());
        screen.stop();
        self.stream = self.camera.take();

        if self.stream.is_some() {
            self.attach_all();
        } else {
            for link in self.links.iter_mut() {
                link.remove_stream();
            }
        }
        self.events.emit(NetworkEvent::Stream {
            stream: self.stream.clone(),
        });
        self.flush();
        true
    }

    /// The platform ended the share (e.g. the user closed the picker)
    pub fn on_sharing_ended(&mut self) {
        if self.stop_sharing() {
            self.events.emit(NetworkEvent::Inactive);
        }
    }

    /// Stop every local track, tell peers, and leave the session
    pub fn stop_streaming(&mut self) {
        let had_stream = self.stream.is_some();
        for stream in [self.screen.take(), self.camera.take(), self.stream.take()]
            .into_iter()
            .flatten()
        {
            stream.stop();
        }
        for link in self.links.iter_mut() {
            link.remove_stream();
        }
        if self.joined {
            let announce = self.envelope(EnvelopeType::Disconnect);
            self.send(announce);
        }
        self.timers.cancel(TimerKind::AudioPoll);
        self.speaker = None;
        if had_stream {
            info!("Local stream stopped");
            self.events.emit(NetworkEvent::Stream { stream: None });
        }
        self.disconnect();
    }

    fn attach_all(&mut self) {
        for peer in self.links.ids() {
            self.with_link(&peer, |link, ctx| {
                link.add_stream(false, ctx);
            });
        }
    }

    pub fn toggle_video(&mut self) -> Option<bool> {
        self.toggle(TrackKind::Video, EnvelopeType::Video)
    }

    pub fn toggle_audio(&mut self) -> Option<bool> {
        self.toggle(TrackKind::Audio, EnvelopeType::Sound)
    }

    fn toggle(&mut self, kind: TrackKind, announce: EnvelopeType) -> Option<bool> {
        let state = self.stream.as_ref()?.toggle(kind)?;
        debug!("Local {} {}", kind, if state { "enabled" } else { "disabled" });
        let envelope = self.envelope(announce).with_state(state);
        self.send(envelope);
        Some(state)
    }

    // ---- identity and data ----

    /// Replace local metadata and gossip it
    pub fn set_meta(&mut self, meta: Meta) {
        self.identity.meta = meta.clone();
        let envelope = self.envelope(EnvelopeType::Meta).with_meta(meta);
        self.send(envelope);
    }

    /// Send `payload` to every open link; returns how many accepted it
    pub fn broadcast(&mut self, payload: Value) -> usize {
        let message = json!({
            "type": "data",
            "clientId": self.identity.id,
            "timeStamp": now_millis(),
            "data": payload,
        })
        .to_string();

        let mut delivered = 0;
        for link in self.links.iter_mut() {
            if link.send(&message) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Leave the session and tear down every link. Idempotent.
    ///
    /// The local stream handle is released without stopping its tracks;
    /// use [`Network::stop_streaming`] to stop capture.
    pub fn disconnect(&mut self) {
        if self.joined {
            let leave = self.envelope(EnvelopeType::Leave);
            self.send(leave);
            self.joined = false;
            info!("Left session");
        }
        self.admission.clear();
        self.timers.cancel_all();
        self.pending_capture = None;

        for peer in self.links.ids() {
            self.with_link(&peer, |link, ctx| link.disconnect(ctx));
        }
        self.flush();

        self.speaker = None;
        self.relay_chain.clear();
        self.screen = None;
        self.camera = None;
        if self.stream.take().is_some() {
            self.events.emit(NetworkEvent::Stream { stream: None });
        }
    }

    // ---- plumbing ----

    fn envelope(&self, kind: EnvelopeType) -> Envelope {
        Envelope::new(kind, self.identity.id.clone(), self.identity.time_stamp)
    }

    /// `join`/`peer` announcement with identity, role hint and chain
    fn announce(&self, kind: EnvelopeType) -> Envelope {
        let envelope = self
            .envelope(kind)
            .with_meta(self.identity.meta.clone())
            .with_role(self.network.forced_role);
        if self.network.relay_chain {
            envelope.with_relay_chain(self.relay_chain.peers().to_vec())
        } else {
            envelope
        }
    }

    fn send_join(&mut self) {
        let join = self.announce(EnvelopeType::Join);
        self.send(join);
        self.joined = true;
    }

    fn send(&mut self, envelope: Envelope) {
        let Some(relay) = self.relay.as_mut() else {
            debug!("No relay attached, dropping {} envelope", envelope.kind);
            return;
        };
        match envelope.to_json() {
            Ok(text) => {
                if let Err(e) = relay.send(text) {
                    warn!("Failed to send {} envelope: {}", envelope.kind, e);
                }
            }
            Err(e) => warn!("{}", e),
        }
    }

    fn with_link<R>(
        &mut self,
        peer: &PeerId,
        f: impl FnOnce(&mut Connection, &mut LinkContext<'_>) -> R,
    ) -> Option<R> {
        let link = self.links.get_mut(peer)?;
        let mut ctx = LinkContext {
            identity: &self.identity,
            config: &self.connection,
            local_stream: self.stream.as_ref(),
            platform: self.platform.as_mut(),
            outbox: &mut self.outbox,
            verbose: self.network.debug,
        };
        Some(f(link, &mut ctx))
    }

    /// Drain envelopes and link events produced by the last handler
    fn flush(&mut self) {
        while !self.outbox.is_empty() {
            if let Some(envelope) = self.outbox.envelopes.pop_front() {
                self.send(envelope);
                continue;
            }
            if let Some(event) = self.outbox.events.pop_front() {
                self.on_link_event(event);
            }
        }
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Connected { peer, meta } => {
                self.events.emit(NetworkEvent::Connect { peer, meta });
            }
            LinkEvent::Established { peer } => {
                debug!("Link to {} established", peer);
                self.admit_pending();
            }
            LinkEvent::Ready { peer } => {
                self.events.emit(NetworkEvent::Ready { peer });
                self.admit_pending();
            }
            LinkEvent::Remote { peer, stream } => {
                self.events.emit(NetworkEvent::Remote { peer, stream });
            }
            LinkEvent::Data { peer, payload } => {
                self.events.emit(NetworkEvent::Data { peer, payload });
            }
            LinkEvent::Relay { peer, chain } => self.merge_chain(&peer, &chain),
            LinkEvent::Failed { peer } => {
                warn!("Link to {} failed", peer);
                self.events.emit(NetworkEvent::Fail { peer: peer.clone() });
                self.with_link(&peer, |link, ctx| link.disconnect(ctx));
            }
            LinkEvent::Closed { peer } => {
                self.links.remove(&peer);
                if self.speaker.as_ref() == Some(&peer) {
                    self.speaker = None;
                }
                info!("Disconnected from {}", peer);
                self.events.emit(NetworkEvent::Disconnect { peer });
                self.admit_pending();
            }
        }
    }
}
