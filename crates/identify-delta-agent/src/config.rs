//! Agent configuration.

use anyhow::{bail, Context, Result};
use identify_delta_core::PeerId;
use serde::Deserialize;
use uuid::Uuid;

/// Agent configuration.
#[derive(Debug, Clone, Default)]
pub struct AgentConfig {
    /// Local host identifier
    pub host_id: Option<Uuid>,

    /// Protocols registered at startup
    pub protocols: Vec<String>,

    /// Peers connected at startup
    pub peers: Vec<PeerConfig>,

    /// Push service configuration
    pub push: PushConfig,
}

/// Push service configuration.
#[derive(Debug, Clone)]
pub struct PushConfig {
    /// Capacity of the outbound push queue shared by all peers
    pub outbound_buffer: usize,
}

/// A remote peer known at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
    /// Peer identifier
    pub peer_id: PeerId,

    /// Protocols the peer is known to support
    #[serde(default)]
    pub protocols: Vec<String>,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self { outbound_buffer: 64 }
    }
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `IDENTIFY_DELTA_HOST_ID`: Local host UUID
    /// - `IDENTIFY_DELTA_PROTOCOLS`: Comma-separated protocols to register
    /// - `IDENTIFY_DELTA_PEERS`: JSON array of `{"peer_id", "protocols"}`
    /// - `IDENTIFY_DELTA_OUTBOUND_BUFFER`: Outbound push queue capacity
    ///
    /// # Errors
    ///
    /// Returns error if a variable is present but malformed.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns error if a variable is present but malformed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(id) = lookup("IDENTIFY_DELTA_HOST_ID") {
            config.host_id = Some(Uuid::parse_str(&id).context("Invalid IDENTIFY_DELTA_HOST_ID")?);
        }

        if let Some(protocols) = lookup("IDENTIFY_DELTA_PROTOCOLS") {
            config.protocols = protocols
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(ToString::to_string)
                .collect();
        }

        if let Some(peers_json) = lookup("IDENTIFY_DELTA_PEERS") {
            config.peers =
                serde_json::from_str(&peers_json).context("Invalid IDENTIFY_DELTA_PEERS JSON")?;
        }

        if let Some(buffer) = lookup("IDENTIFY_DELTA_OUTBOUND_BUFFER") {
            let buffer: usize = buffer
                .parse()
                .context("Invalid IDENTIFY_DELTA_OUTBOUND_BUFFER")?;
            if buffer == 0 {
                bail!("IDENTIFY_DELTA_OUTBOUND_BUFFER must be greater than zero");
            }
            config.push.outbound_buffer = buffer;
        }

        Ok(config)
    }
}
