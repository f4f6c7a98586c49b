use clap::Parser;
use meshrtc::config::Config;
use meshrtc::MeshError;
use serde_json::Value;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "meshrtc")]
#[command(version)]
#[command(about = "Join a WebRTC mesh through a message relay", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "meshrtc.toml")]
    pub config: PathBuf,

    /// Relay WebSocket URL
    #[arg(short, long)]
    pub url: Option<String>,

    /// Client id (random when unset)
    #[arg(long)]
    pub id: Option<String>,

    /// Display name announced to peers
    #[arg(short, long)]
    pub name: Option<String>,

    /// Cap on concurrent links
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Arrange links into a relay chain
    #[arg(long, action)]
    pub relay_chain: bool,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,
}

impl Args {
    pub fn load_config(&self) -> Result<Config, MeshError> {
        let mut config = Config::load(&self.config)?;
        self.apply_overrides(&mut config);
        Ok(config)
    }

    /// Command line values win over the file
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(ref url) = self.url {
            config.relay.url = url.clone();
        }
        if let Some(ref id) = self.id {
            config.identity.client_id = Some(id.clone());
        }
        if let Some(ref name) = self.name {
            config
                .identity
                .meta
                .insert("name".to_string(), Value::String(name.clone()));
        }
        if self.max_connections.is_some() {
            config.network.max_connections = self.max_connections;
        }
        if self.relay_chain {
            config.network.relay_chain = true;
        }
        if self.verbose {
            config.network.debug = true;
        }
    }
}
