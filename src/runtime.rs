//! Tokio driver for the session core
//!
//! A single task owns the [`Network`] and serialises every input through one
//! channel: relay callbacks, capability completions, capture results, timer
//! firings and API commands. Handlers never run concurrently.

use crate::config::Config;
use crate::error::{MeshError, PlatformError};
use crate::platform::{CapabilityEvent, CaptureKind, LinkId, MediaStream, Platform, RelaySender};
use crate::session::{
    ClientIdentity, ClientInfo, EventBus, Network, NetworkEvent, Scheduler, Status, TimerId,
};
use crate::signaling::{Meta, PeerId};
use log::{debug, info, trace};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

enum Input {
    RelayOpen,
    RelayError(String),
    RelayMessage(String),
    RelayClosed,
    Capability(LinkId, CapabilityEvent),
    Capture(CaptureKind, Result<MediaStream, PlatformError>),
    SharingEnded,
    Timer(TimerId),
    Command(Command),
}

enum Command {
    Connect(Box<dyn RelaySender>),
    Disconnect,
    StartStreaming { video: bool, audio: bool },
    StopStreaming,
    StartSharing,
    StopSharing(oneshot::Sender<bool>),
    ToggleVideo(oneshot::Sender<Option<bool>>),
    ToggleAudio(oneshot::Sender<Option<bool>>),
    SetMeta(Meta),
    Broadcast(Value, oneshot::Sender<usize>),
    Clients(oneshot::Sender<Vec<ClientInfo>>),
    ClientStatus(PeerId, oneshot::Sender<Option<Status>>),
    Shutdown(oneshot::Sender<()>),
}

/// Where a [`Platform`] posts its asynchronous completions
#[derive(Clone)]
pub struct PlatformSink {
    tx: mpsc::UnboundedSender<Input>,
}

impl PlatformSink {
    /// Returns false once the session has stopped
    pub fn capability(&self, link: LinkId, event: CapabilityEvent) -> bool {
        self.tx.send(Input::Capability(link, event)).is_ok()
    }

    pub fn capture(&self, kind: CaptureKind, result: Result<MediaStream, PlatformError>) -> bool {
        self.tx.send(Input::Capture(kind, result)).is_ok()
    }

    /// The user stopped a screen share from outside the application
    pub fn sharing_ended(&self) -> bool {
        self.tx.send(Input::SharingEnded).is_ok()
    }
}

/// Inbound half of a relay transport
#[derive(Clone)]
pub struct RelayCallbacks {
    tx: mpsc::UnboundedSender<Input>,
}

impl RelayCallbacks {
    pub fn on_open(&self) {
        let _ = self.tx.send(Input::RelayOpen);
    }

    pub fn on_error(&self, reason: impl Into<String>) {
        let _ = self.tx.send(Input::RelayError(reason.into()));
    }

    pub fn on_message(&self, text: impl Into<String>) {
        let _ = self.tx.send(Input::RelayMessage(text.into()));
    }

    pub fn on_close(&self) {
        let _ = self.tx.send(Input::RelayClosed);
    }
}

/// [`Scheduler`] backed by sleeping tokio tasks; cancel aborts the task
struct TokioScheduler {
    tx: mpsc::UnboundedSender<Input>,
    tasks: HashMap<TimerId, JoinHandle<()>>,
}

impl TokioScheduler {
    fn new(tx: mpsc::UnboundedSender<Input>) -> Self {
        Self {
            tx,
            tasks: HashMap::new(),
        }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&mut self, timer: TimerId, after: Duration) {
        self.tasks.retain(|_, task| !task.is_finished());
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(Input::Timer(timer));
        });
        self.tasks.insert(timer, task);
    }

    fn cancel(&mut self, timer: TimerId) {
        if let Some(task) = self.tasks.remove(&timer) {
            task.abort();
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }
}

/// Cloneable handle to a running session
#[derive(Clone)]
pub struct SessionHandle {
    id: PeerId,
    tx: mpsc::UnboundedSender<Input>,
    events: EventBus,
}

impl SessionHandle {
    /// Start the session task. `make_platform` receives the sink its
    /// completions must be posted to.
    pub fn spawn<P, F>(identity: ClientIdentity, config: &Config, make_platform: F) -> Result<Self, MeshError>
    where
        P: Platform + 'static,
        F: FnOnce(PlatformSink) -> Result<P, MeshError>,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let platform = make_platform(PlatformSink { tx: tx.clone() })?;
        let scheduler = TokioScheduler::new(tx.clone());

        let id = identity.id.clone();
        let network = Network::new(identity, config, Box::new(platform), Box::new(scheduler));
        let events = network.event_bus();

        info!("Starting session {}", id);
        tokio::spawn(run(network, rx));

        Ok(Self { id, tx, events })
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events.subscribe()
    }

    /// Attach a relay transport; feed its inbound side into the returned
    /// callbacks
    pub fn connect(&self, relay: impl RelaySender + 'static) -> Result<RelayCallbacks, MeshError> {
        self.command(Command::Connect(Box::new(relay)))?;
        Ok(RelayCallbacks {
            tx: self.tx.clone(),
        })
    }

    pub fn disconnect(&self) -> Result<(), MeshError> {
        self.command(Command::Disconnect)
    }

    pub fn start_streaming(&self, video: bool, audio: bool) -> Result<(), MeshError> {
        self.command(Command::StartStreaming { video, audio })
    }

    pub fn stop_streaming(&self) -> Result<(), MeshError> {
        self.command(Command::StopStreaming)
    }

    pub fn start_sharing(&self) -> Result<(), MeshError> {
        self.command(Command::StartSharing)
    }

    pub async fn stop_sharing(&self) -> Result<bool, MeshError> {
        self.request(Command::StopSharing).await
    }

    pub async fn toggle_video(&self) -> Result<Option<bool>, MeshError> {
        self.request(Command::ToggleVideo).await
    }

    pub async fn toggle_audio(&self) -> Result<Option<bool>, MeshError> {
        self.request(Command::ToggleAudio).await
    }

    pub fn set_meta(&self, meta: Meta) -> Result<(), MeshError> {
        self.command(Command::SetMeta(meta))
    }

    /// Send `payload` to every open link; resolves to the number reached
    pub async fn broadcast(&self, payload: Value) -> Result<usize, MeshError> {
        self.request(|reply| Command::Broadcast(payload, reply)).await
    }

    pub async fn clients(&self) -> Result<Vec<ClientInfo>, MeshError> {
        self.request(Command::Clients).await
    }

    pub async fn client_status(&self, peer: PeerId) -> Result<Option<Status>, MeshError> {
        self.request(|reply| Command::ClientStatus(peer, reply)).await
    }

    /// Leave the session and stop the task
    pub async fn shutdown(&self) -> Result<(), MeshError> {
        self.request(Command::Shutdown).await
    }

    fn command(&self, command: Command) -> Result<(), MeshError> {
        self.tx
            .send(Input::Command(command))
            .map_err(|_| MeshError::SessionClosed)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, MeshError> {
        let (reply, response) = oneshot::channel();
        self.command(make(reply))?;
        response.await.map_err(|_| MeshError::SessionClosed)
    }
}

async fn run(mut network: Network, mut rx: mpsc::UnboundedReceiver<Input>) {
    while let Some(input) = rx.recv().await {
        match input {
            Input::RelayOpen => network.on_open(),
            Input::RelayError(reason) => network.on_error(&reason),
            Input::RelayMessage(text) => network.on_message(&text),
            Input::RelayClosed => network.on_close(),
            Input::Capability(link, event) => network.on_capability_event(link, event),
            Input::Capture(kind, result) => network.on_capture(kind, result),
            Input::SharingEnded => network.on_sharing_ended(),
            Input::Timer(timer) => network.on_timer(timer),
            Input::Command(Command::Shutdown(done)) => {
                network.disconnect();
                let _ = done.send(());
                break;
            }
            Input::Command(command) => apply(&mut network, command),
        }
    }
    debug!("Session {} stopped", network.identity().id);
}

fn apply(network: &mut Network, command: Command) {
    match command {
        Command::Connect(relay) => network.connect(relay),
        Command::Disconnect => network.disconnect(),
        Command::StartStreaming { video, audio } => network.start_streaming(video, audio),
        Command::StopStreaming => network.stop_streaming(),
        Command::StartSharing => network.start_sharing(),
        Command::StopSharing(reply) => {
            let _ = reply.send(network.stop_sharing());
        }
        Command::ToggleVideo(reply) => {
            let _ = reply.send(network.toggle_video());
        }
        Command::ToggleAudio(reply) => {
            let _ = reply.send(network.toggle_audio());
        }
        Command::SetMeta(meta) => network.set_meta(meta),
        Command::Broadcast(payload, reply) => {
            let _ = reply.send(network.broadcast(payload));
        }
        Command::Clients(reply) => {
            let _ = reply.send(network.clients());
        }
        Command::ClientStatus(peer, reply) => {
            let _ = reply.send(network.client_status(&peer));
        }
        Command::Shutdown(done) => {
            trace!("Shutdown handled by the session loop");
            let _ = done.send(());
        }
    }
}
