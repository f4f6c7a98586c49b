//! meshrtc - Main entry point
//!
//! Joins a mesh through a WebSocket relay, logs session events and
//! broadcasts every line read from stdin as a data message.

mod args;

use args::Args;
use clap::Parser;
use log::{debug, error, info, warn};
use meshrtc::session::ClientIdentity;
use meshrtc::{Config, NetworkEvent, SessionHandle, WebRtcPlatform, WebSocketRelay};
use serde_json::json;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();
    let loaded = args.load_config();

    // Initialize logging with noise filtering for third-party WebRTC crates
    let log_level = match (&loaded, args.verbose) {
        (_, true) => "debug".to_string(),
        (Ok(cfg), false) => cfg.logging.level.clone(),
        (Err(_), false) => "info".to_string(),
    };
    env_logger::Builder::new()
        .parse_filters(&std::env::var("MESHRTC_LOG").unwrap_or(log_level))
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .init();

    info!("meshrtc v{}", env!("CARGO_PKG_VERSION"));

    let config = match loaded {
        Ok(cfg) => {
            info!("Loaded configuration from {:?}", args.config);
            cfg
        }
        Err(e) => {
            warn!("Failed to load config: {}, using defaults", e);
            let mut cfg = Config::default();
            args.apply_overrides(&mut cfg);
            cfg
        }
    };

    // Validate configuration
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e.into());
    }

    let identity = ClientIdentity::from_config(&config.identity);
    let session = Arc::new(SessionHandle::spawn(identity, &config, WebRtcPlatform::new)?);
    info!("Client id: {}", session.id());

    let mut events = session.subscribe();
    let event_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!("Event log lagged, skipped {}", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let relay = WebSocketRelay::new(&config.relay);
    info!("Relay: {}", relay.url());
    let relay_session = session.clone();
    let relay_task = tokio::spawn(async move {
        relay.run_forever(&relay_session).await;
    });

    let input_session = session.clone();
    let input_task = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match input_session.broadcast(json!({ "message": line })).await {
                Ok(reached) => debug!("Broadcast reached {} peer(s)", reached),
                Err(e) => {
                    warn!("Broadcast failed: {}", e);
                    break;
                }
            }
        }
    });

    signal::ctrl_c().await?;
    info!("Shutting down...");

    if let Err(e) = session.shutdown().await {
        warn!("Session shutdown: {}", e);
    }
    input_task.abort();
    relay_task.abort();
    event_task.abort();

    info!("meshrtc stopped");
    Ok(())
}

fn log_event(event: &NetworkEvent) {
    match event {
        NetworkEvent::Connect { peer, meta } => info!("Peer {} connecting {:?}", peer, meta),
        NetworkEvent::Ready { peer } => info!("Peer {} ready", peer),
        NetworkEvent::Disconnect { peer } => info!("Peer {} left", peer),
        NetworkEvent::Fail { peer } => warn!("Link to {} failed", peer),
        NetworkEvent::Data { peer, payload } => info!("{}: {}", peer, payload),
        NetworkEvent::Error { reason } => warn!("{}", reason),
        other => debug!("Event: {}", other.name()),
    }
}
