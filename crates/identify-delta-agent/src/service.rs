//! Identify push service: one delta handler per connected peer.

use crate::config::PushConfig;
use identify_delta_core::{
    HandlerError, PeerHandler, PeerId, PeerStore, ProtocolId, ProtocolRegistry,
};
use identify_delta_proto::DeltaMessage;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A CBOR-encoded [`DeltaMessage`] ready to be written to a peer's push stream.
#[derive(Debug, Clone)]
pub struct Outbound {
    /// Destination peer
    pub peer: PeerId,
    /// Encoded delta message
    pub payload: Vec<u8>,
}

struct PeerEntry {
    handler: Arc<PeerHandler>,
    pusher: JoinHandle<()>,
}

/// Owns the [`PeerHandler`]s of all connected peers.
pub struct IdentifyService {
    registry: Arc<ProtocolRegistry>,
    peers: Arc<PeerStore>,
    handlers: Mutex<HashMap<PeerId, PeerEntry>>,
    outbound: mpsc::Sender<Outbound>,
}

impl IdentifyService {
    /// Create the service and the queue of outbound pushes.
    #[must_use]
    pub fn new(
        config: &PushConfig,
        registry: Arc<ProtocolRegistry>,
        peers: Arc<PeerStore>,
    ) -> (Self, mpsc::Receiver<Outbound>) {
        let (outbound, rx) = mpsc::channel(config.outbound_buffer);

        (
            Self {
                registry,
                peers,
                handlers: Mutex::new(HashMap::new()),
                outbound,
            },
            rx,
        )
    }

    /// Start tracking a newly connected peer.
    ///
    /// Returns `false` if the peer already has a handler.
    ///
    /// # Errors
    ///
    /// Returns error if the handler cannot subscribe to the registry.
    pub fn connected(&self, peer: PeerId) -> Result<bool, ServiceError> {
        let mut handlers = self.handlers();
        if handlers.contains_key(&peer) {
            return Ok(false);
        }

        let handler = Arc::new(PeerHandler::new(
            peer.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.peers),
        ));
        handler.start()?;

        let pusher = tokio::spawn(push_deltas(Arc::clone(&handler), self.outbound.clone()));
        handlers.insert(peer.clone(), PeerEntry { handler, pusher });

        tracing::info!(%peer, "Peer connected");
        Ok(true)
    }

    /// Stop tracking a disconnected peer.
    ///
    /// Unknown peers are ignored.
    ///
    /// # Errors
    ///
    /// Returns error if the peer's handler had failed.
    pub async fn disconnected(&self, peer: &PeerId) -> Result<(), ServiceError> {
        let entry = self.handlers().remove(peer);
        let Some(entry) = entry else {
            return Ok(());
        };

        tracing::info!(%peer, "Peer disconnected");
        close_entry(peer, entry).await
    }

    /// Check whether a peer is known to support any of `candidates`.
    #[must_use]
    pub fn peer_supports(&self, peer: &PeerId, candidates: &[ProtocolId]) -> bool {
        if let Some(entry) = self.handlers().get(peer) {
            return entry.handler.peer_supports_protos(candidates);
        }

        self.peers
            .supports_protocols(peer, candidates)
            .is_ok_and(|supported| !supported.is_empty())
    }

    /// Peers with a running handler.
    #[must_use]
    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.handlers().keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Close every handler.
    ///
    /// A failing handler does not stop the others from closing.
    ///
    /// # Errors
    ///
    /// Returns the first handler failure.
    pub async fn close(&self) -> Result<(), ServiceError> {
        let entries: Vec<(PeerId, PeerEntry)> = self.handlers().drain().collect();
        tracing::info!(peers = entries.len(), "Closing identify service");

        let mut first_error = None;
        for (peer, entry) in entries {
            if let Err(err) = close_entry(&peer, entry).await {
                first_error.get_or_insert(err);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    fn handlers(&self) -> MutexGuard<'_, HashMap<PeerId, PeerEntry>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn close_entry(peer: &PeerId, entry: PeerEntry) -> Result<(), ServiceError> {
    let result = entry.handler.close().await;

    // A pusher parked on a full outbound queue would never notice the close.
    entry.pusher.abort();
    if let Err(err) = entry.pusher.await {
        if err.is_panic() {
            tracing::warn!(%peer, error = %err, "Push task panicked");
        }
    }

    result.map_err(|source| ServiceError::Handler {
        peer: peer.clone(),
        source,
    })
}

async fn push_deltas(handler: Arc<PeerHandler>, outbound: mpsc::Sender<Outbound>) {
    let peer = handler.peer().clone();

    loop {
        let delta = match handler.next_delta().await {
            Ok(delta) => delta,
            Err(HandlerError::Closed) => break,
            Err(err) => {
                tracing::warn!(%peer, error = %err, "Stopping delta push");
                break;
            }
        };

        // Only the baseline can be empty; nothing to tell the peer.
        if delta.is_empty() {
            continue;
        }

        let message = DeltaMessage::from(&delta);
        let payload = match message.to_cbor() {
            Ok(payload) => payload,
            Err(err) => {
                // The handler's snapshot already includes this delta.
                tracing::error!(
                    %peer,
                    error = %err,
                    "Failed to encode delta message, stopping delta push"
                );
                break;
            }
        };

        tracing::debug!(
            %peer,
            added = ?message.added_protocols,
            removed = ?message.removed_protocols,
            payload_len = payload.len(),
            "Queueing protocol delta"
        );

        let push = Outbound {
            peer: peer.clone(),
            payload,
        };
        if outbound.send(push).await.is_err() {
            tracing::warn!(%peer, "Outbound receiver dropped, stopping delta push");
            break;
        }
    }
}

/// Errors for the identify service.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    /// A peer handler failed
    #[error("handler for peer {peer} failed: {source}")]
    Handler {
        /// The affected peer
        peer: PeerId,
        /// The handler's failure
        source: HandlerError,
    },
    /// A handler could not be started
    #[error("failed to start handler: {0}")]
    Start(#[from] HandlerError),
}
