//! Simulated host: the registry, peer store, and identify service wired together.

use crate::config::AgentConfig;
use crate::service::{IdentifyService, Outbound};
use anyhow::{Context, Result};
use identify_delta_core::{PeerId, PeerStore, ProtocolId, ProtocolRegistry, ProtocolSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// A host command read from the simulator's input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Register protocols locally
    Add(Vec<ProtocolId>),
    /// Unregister protocols locally
    Remove(Vec<ProtocolId>),
    /// A peer connected
    Connect(PeerId),
    /// A peer disconnected
    Disconnect(PeerId),
    /// Record protocols a peer was observed to support
    Learn(PeerId, Vec<ProtocolId>),
    /// Forget protocols a peer was observed to support
    Forget(PeerId, Vec<ProtocolId>),
    /// Ask whether a peer supports any of the protocols
    Supports(PeerId, Vec<ProtocolId>),
    /// Show local protocols and connected peers
    List,
}

impl Command {
    /// Parse one input line. Blank lines and `#` comments yield `None`.
    ///
    /// # Errors
    ///
    /// Returns error on an unknown command or missing arguments.
    pub fn parse(line: &str) -> Result<Option<Self>, CommandError> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };
        if verb.starts_with('#') {
            return Ok(None);
        }

        let rest: Vec<&str> = words.collect();
        let command = match verb {
            "add" => Self::Add(protocols(verb, &rest)?),
            "remove" => Self::Remove(protocols(verb, &rest)?),
            "connect" => Self::Connect(single_peer(verb, &rest)?),
            "disconnect" => Self::Disconnect(single_peer(verb, &rest)?),
            "learn" => {
                let (peer, ids) = peer_and_protocols(verb, &rest)?;
                Self::Learn(peer, ids)
            }
            "forget" => {
                let (peer, ids) = peer_and_protocols(verb, &rest)?;
                Self::Forget(peer, ids)
            }
            "supports" => {
                let (peer, ids) = peer_and_protocols(verb, &rest)?;
                Self::Supports(peer, ids)
            }
            "list" => Self::List,
            other => return Err(CommandError::Unknown(other.to_string())),
        };

        Ok(Some(command))
    }
}

fn protocols(verb: &str, args: &[&str]) -> Result<Vec<ProtocolId>, CommandError> {
    if args.is_empty() {
        return Err(CommandError::MissingArgument(verb.to_string()));
    }
    Ok(args.iter().copied().map(ProtocolId::from).collect())
}

fn single_peer(verb: &str, args: &[&str]) -> Result<PeerId, CommandError> {
    match args {
        [peer] => Ok(PeerId::from(*peer)),
        _ => Err(CommandError::MissingArgument(verb.to_string())),
    }
}

fn peer_and_protocols(
    verb: &str,
    args: &[&str],
) -> Result<(PeerId, Vec<ProtocolId>), CommandError> {
    match args {
        [peer, ids @ ..] if !ids.is_empty() => Ok((PeerId::from(*peer), protocols(verb, ids)?)),
        _ => Err(CommandError::MissingArgument(verb.to_string())),
    }
}

/// The outcome of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Whether a mutation changed anything
    Changed(bool),
    /// Answer to a support query
    Supports(bool),
    /// Current local state
    Listing {
        /// This host's identity
        host_id: Uuid,
        /// Locally registered protocols
        protocols: ProtocolSet,
        /// Connected peers
        peers: Vec<PeerId>,
    },
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Changed(changed) => write!(f, "changed: {changed}"),
            Self::Supports(supported) => write!(f, "supported: {supported}"),
            Self::Listing {
                host_id,
                protocols,
                peers,
            } => {
                let protocols: Vec<&str> = protocols.iter().map(ProtocolId::as_str).collect();
                let peers: Vec<&str> = peers.iter().map(PeerId::as_str).collect();
                write!(
                    f,
                    "host: {host_id} protocols: [{}] peers: [{}]",
                    protocols.join(", "),
                    peers.join(", ")
                )
            }
        }
    }
}

/// The local host.
pub struct Host {
    host_id: Uuid,
    registry: Arc<ProtocolRegistry>,
    peers: Arc<PeerStore>,
    service: IdentifyService,
}

impl Host {
    /// Build the host from configuration, registering the configured
    /// protocols and connecting the configured peers.
    ///
    /// Without a configured `host_id` a random one is generated.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if a configured peer cannot be connected.
    pub fn new(config: &AgentConfig) -> Result<(Self, mpsc::Receiver<Outbound>)> {
        let registry = Arc::new(ProtocolRegistry::with_protocols(
            config.protocols.iter().cloned(),
        ));
        let peers = Arc::new(PeerStore::new());
        let (service, outbound) =
            IdentifyService::new(&config.push, Arc::clone(&registry), Arc::clone(&peers));

        let host = Self {
            host_id: config.host_id.unwrap_or_else(Uuid::new_v4),
            registry,
            peers,
            service,
        };

        for peer in &config.peers {
            host.peers
                .set_protocols(&peer.peer_id, peer.protocols.iter().cloned())
                .context("Failed to seed peer store")?;
            host.service
                .connected(peer.peer_id.clone())
                .with_context(|| format!("Failed to connect peer {}", peer.peer_id))?;
        }

        Ok((host, outbound))
    }

    /// This host's identity.
    #[must_use]
    pub fn host_id(&self) -> Uuid {
        self.host_id
    }

    /// Execute a command.
    ///
    /// # Errors
    ///
    /// Returns error if the registry, peer store, or a handler fails.
    pub async fn execute(&self, command: Command) -> Result<Reply> {
        tracing::debug!(?command, "Executing command");

        let reply = match command {
            Command::Add(ids) => Reply::Changed(self.registry.add(ids)?),
            Command::Remove(ids) => Reply::Changed(self.registry.remove(ids)?),
            Command::Connect(peer) => Reply::Changed(self.service.connected(peer)?),
            Command::Disconnect(peer) => {
                let known = self.service.connected_peers().contains(&peer);
                self.service.disconnected(&peer).await?;
                Reply::Changed(known)
            }
            Command::Learn(peer, ids) => {
                self.peers.add_protocols(&peer, ids)?;
                Reply::Changed(true)
            }
            Command::Forget(peer, ids) => {
                self.peers.remove_protocols(&peer, ids)?;
                Reply::Changed(true)
            }
            Command::Supports(peer, ids) => Reply::Supports(self.service.peer_supports(&peer, &ids)),
            Command::List => Reply::Listing {
                host_id: self.host_id,
                protocols: self.registry.protocols()?,
                peers: self.service.connected_peers(),
            },
        };

        tracing::info!(host_id = %self.host_id, %reply, "Command done");
        Ok(reply)
    }

    /// Close every peer handler.
    ///
    /// # Errors
    ///
    /// Returns the first handler failure.
    pub async fn close(&self) -> Result<()> {
        self.service
            .close()
            .await
            .context("Failed to close identify service")
    }
}

/// Errors from parsing simulator input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// Unrecognized command verb
    #[error("unknown command: {0}")]
    Unknown(String),
    /// Required arguments missing
    #[error("missing arguments for {0}")]
    MissingArgument(String),
}
