//! Configuration management for meshrtc

use crate::error::MeshError;
use crate::session::role::RolePolicy;
use crate::signaling::{Meta, Role};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Local identity
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Session coordination
    #[serde(default)]
    pub network: NetworkConfig,

    /// Per-link peer connection settings
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Message relay
    #[serde(default)]
    pub relay: RelayConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Client id; a random UUID when unset
    #[serde(default)]
    pub client_id: Option<String>,

    /// Metadata announced to peers (e.g. `name = "alice"`)
    #[serde(default)]
    pub meta: Meta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Cap on concurrent links; further requests are queued
    #[serde(default)]
    pub max_connections: Option<usize>,

    /// Role this client asks for on every link
    #[serde(default)]
    pub forced_role: Option<Role>,

    /// Which side offers when nothing else decides
    #[serde(default)]
    pub role_policy: RolePolicy,

    /// Constrain links into a relay chain instead of a full mesh
    #[serde(default)]
    pub relay_chain: bool,

    /// Dominant-speaker sampling interval
    #[serde(default = "default_audio_poll_ms")]
    pub audio_poll_ms: u64,

    /// Admission queue re-check interval
    #[serde(default = "default_admission_retry_ms")]
    pub admission_retry_ms: u64,

    /// Event bus buffer per subscriber
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Log negotiation details at debug level
    #[serde(default)]
    pub debug: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_connections: None,
            forced_role: None,
            role_policy: RolePolicy::default(),
            relay_chain: false,
            audio_poll_ms: default_audio_poll_ms(),
            admission_retry_ms: default_admission_retry_ms(),
            event_capacity: default_event_capacity(),
            debug: false,
        }
    }
}

/// STUN/TURN server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceTransportPolicy {
    #[default]
    All,
    Relay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BundlePolicy {
    #[default]
    Balanced,
    MaxCompat,
    MaxBundle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServerConfig>,

    #[serde(default)]
    pub ice_transport_policy: IceTransportPolicy,

    #[serde(default)]
    pub bundle_policy: BundlePolicy,

    #[serde(default)]
    pub ice_candidate_pool_size: u8,

    /// Open a data channel on every link
    #[serde(default = "default_true")]
    pub data_channel: bool,

    /// Ordered delivery on the data channel
    #[serde(default = "default_true")]
    pub ordered: bool,

    /// Partial reliability: give up on a message after this many ms
    #[serde(default)]
    pub max_packet_life_time: Option<u16>,

    /// Full reconnects allowed after ICE failure before the link fails
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Request an ICE restart on renegotiation offers
    #[serde(default = "default_true")]
    pub ice_restart: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            ice_transport_policy: IceTransportPolicy::All,
            bundle_policy: BundlePolicy::Balanced,
            ice_candidate_pool_size: 0,
            data_channel: true,
            ordered: true,
            max_packet_life_time: None,
            max_reconnect_attempts: default_max_reconnect_attempts(),
            ice_restart: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// WebSocket URL of the message relay
    #[serde(default = "default_relay_url")]
    pub url: String,

    /// Delay before reconnecting a dropped relay socket
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: default_relay_url(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults when it
    /// does not exist
    pub fn load(path: &PathBuf) -> Result<Self, MeshError> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| MeshError::Config(format!("Failed to read {:?}: {}", path, e)))?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), MeshError> {
        let invalid = |msg: &str| Err(MeshError::Config(msg.to_string()));

        if self.network.max_connections == Some(0) {
            return invalid("Network max_connections must be at least 1");
        }

        if self.network.audio_poll_ms == 0 {
            return invalid("Network audio_poll_ms must be non-zero");
        }

        if self.network.admission_retry_ms == 0 {
            return invalid("Network admission_retry_ms must be non-zero");
        }

        if self.network.event_capacity == 0 {
            return invalid("Network event_capacity must be non-zero");
        }

        if let Some(ref id) = self.identity.client_id {
            if id.trim().is_empty() {
                return invalid("Identity client_id must not be blank");
            }
        }

        for server in &self.connection.ice_servers {
            if server.urls.is_empty() {
                return invalid("ICE server entries need at least one URL");
            }
            for url in &server.urls {
                if !(url.starts_with("stun:") || url.starts_with("turn:") || url.starts_with("turns:")) {
                    return Err(MeshError::Config(format!(
                        "ICE server URL must use stun:, turn: or turns: ({})",
                        url
                    )));
                }
                if url.starts_with("turn") && server.credential.is_none() {
                    return Err(MeshError::Config(format!("TURN server {} needs a credential", url)));
                }
            }
        }

        if !(self.relay.url.starts_with("ws://") || self.relay.url.starts_with("wss://")) {
            return invalid("Relay url must start with ws:// or wss://");
        }

        if log::LevelFilter::from_str(&self.logging.level).is_err() {
            return Err(MeshError::Config(format!(
                "Unknown log level {:?}",
                self.logging.level
            )));
        }

        Ok(())
    }
}


fn default_true() -> bool {
    true
}

fn default_audio_poll_ms() -> u64 {
    1000
}

fn default_admission_retry_ms() -> u64 {
    2000
}

fn default_event_capacity() -> usize {
    256
}

fn default_max_reconnect_attempts() -> u32 {
    3
}

fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig {
        urls: vec!["stun:stun.l.google.com:19302".to_string()],
        username: None,
        credential: None,
    }]
}

fn default_relay_url() -> String {
    "ws://127.0.0.1:8080".to_string()
}

fn default_reconnect_delay_ms() -> u64 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}
