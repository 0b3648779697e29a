//! Per-peer protocol delta tracking.
//!
//! A [`PeerHandler`] remembers which protocols have already been announced
//! to one remote peer and produces the [`Delta`] needed to bring that peer
//! up to date with the [`ProtocolRegistry`].
//!
//! # Lifecycle
//!
//! ```text
//! Created --start()--> Running --close()--> Closed
//!    |                                        ^
//!    +----------------close()-----------------+
//! ```
//!
//! While running, a background task owns the snapshot and answers
//! [`PeerHandler::next_delta`] requests one at a time. A request is held
//! until the registry differs from the snapshot; any number of registry
//! changes seen in the meantime are folded into a single delta.

use crate::delta::Delta;
use crate::peerstore::PeerStore;
use crate::protocol::{PeerId, ProtocolId, ProtocolSet};
use crate::registry::{ProtocolRegistry, RegistryError, Subscription};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

type DeltaRequest = oneshot::Sender<Delta>;

/// Observable lifecycle state of a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    /// Constructed, background task not yet spawned
    Created,
    /// Background task running
    Running,
    /// Closed; terminal
    Closed,
}

enum Lifecycle {
    Created,
    Running {
        requests: mpsc::Sender<DeltaRequest>,
        shutdown: watch::Sender<bool>,
        task: JoinHandle<Result<(), HandlerError>>,
    },
    Closed,
}

/// Tracks the protocols announced to a single remote peer.
pub struct PeerHandler {
    peer: PeerId,
    registry: Arc<ProtocolRegistry>,
    peers: Arc<PeerStore>,
    lifecycle: Mutex<Lifecycle>,
}

impl PeerHandler {
    /// Create a handler for `peer`. Nothing runs until [`start`](Self::start).
    #[must_use]
    pub fn new(peer: PeerId, registry: Arc<ProtocolRegistry>, peers: Arc<PeerStore>) -> Self {
        Self {
            peer,
            registry,
            peers,
            lifecycle: Mutex::new(Lifecycle::Created),
        }
    }

    /// The remote peer this handler tracks.
    #[must_use]
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> HandlerState {
        match *self.lifecycle() {
            Lifecycle::Created => HandlerState::Created,
            Lifecycle::Running { .. } => HandlerState::Running,
            Lifecycle::Closed => HandlerState::Closed,
        }
    }

    /// Subscribe to the registry and spawn the background task.
    ///
    /// Must be called from within a Tokio runtime. Calling it on a handler
    /// that is not freshly created does nothing.
    ///
    /// # Errors
    ///
    /// Returns error if the registry refuses the subscription.
    pub fn start(&self) -> Result<(), HandlerError> {
        let mut lifecycle = self.lifecycle();
        if !matches!(*lifecycle, Lifecycle::Created) {
            tracing::warn!(peer = %self.peer, "Ignoring start on a handler that is not new");
            return Ok(());
        }

        let subscription = self.registry.subscribe()?;
        let (requests, request_rx) = mpsc::channel(1);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let peer_loop = PeerLoop {
            peer: self.peer.clone(),
            registry: Arc::clone(&self.registry),
            subscription,
            requests: request_rx,
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(peer_loop.run());

        *lifecycle = Lifecycle::Running {
            requests,
            shutdown,
            task,
        };

        tracing::debug!(peer = %self.peer, "Peer handler started");
        Ok(())
    }

    /// Wait for the next change to announce to this peer.
    ///
    /// The first call after [`start`](Self::start) returns the registry's
    /// state relative to an empty snapshot, even if that is empty. The
    /// baseline is read when that first call is served, not at `start`, so
    /// mutations made in between are folded into it. Every later call waits
    /// until the registry differs from what was last returned and never
    /// yields an empty delta.
    ///
    /// Dropping the returned future before it completes leaves the snapshot
    /// untouched.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::NotStarted`] before `start`, and
    /// [`HandlerError::Closed`] once the handler is closed, including when
    /// `close` races with this call.
    pub async fn next_delta(&self) -> Result<Delta, HandlerError> {
        let requests = self.requests()?;

        let (reply_tx, reply_rx) = oneshot::channel();
        requests
            .send(reply_tx)
            .await
            .map_err(|_| HandlerError::Closed)?;

        reply_rx.await.map_err(|_| HandlerError::Closed)
    }

    /// Stop the background task and release the registry subscription.
    ///
    /// Safe to call before `start` and any number of times. Waits only for
    /// the background task to observe the shutdown signal.
    ///
    /// # Errors
    ///
    /// Returns the fault that stopped the background task, if any.
    pub async fn close(&self) -> Result<(), HandlerError> {
        let previous = std::mem::replace(&mut *self.lifecycle(), Lifecycle::Closed);

        let Lifecycle::Running { shutdown, task, .. } = previous else {
            return Ok(());
        };

        let _ = shutdown.send(true);

        let result = match task.await {
            Ok(result) => result,
            Err(err) => Err(HandlerError::TaskFailed(err.to_string())),
        };

        match &result {
            Ok(()) => tracing::debug!(peer = %self.peer, "Peer handler closed"),
            Err(err) => tracing::warn!(peer = %self.peer, error = %err, "Peer handler failed"),
        }
        result
    }

    /// Check whether the remote peer is known to support any of `candidates`.
    ///
    /// Reads the peer store only; independent of what has been announced.
    #[must_use]
    pub fn peer_supports_protos(&self, candidates: &[ProtocolId]) -> bool {
        match self.peers.supports_protocols(&self.peer, candidates) {
            Ok(supported) => !supported.is_empty(),
            Err(err) => {
                tracing::warn!(peer = %self.peer, error = %err, "Peer store lookup failed");
                false
            }
        }
    }

    fn requests(&self) -> Result<mpsc::Sender<DeltaRequest>, HandlerError> {
        match &*self.lifecycle() {
            Lifecycle::Created => Err(HandlerError::NotStarted),
            Lifecycle::Running { requests, .. } => Ok(requests.clone()),
            Lifecycle::Closed => Err(HandlerError::Closed),
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for PeerHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerHandler")
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// How a single delta request ended.
enum Served {
    Delivered,
    Abandoned,
    Shutdown,
}

/// The background half of a [`PeerHandler`]. Sole owner of the snapshot.
struct PeerLoop {
    peer: PeerId,
    registry: Arc<ProtocolRegistry>,
    subscription: Subscription,
    requests: mpsc::Receiver<DeltaRequest>,
    shutdown: watch::Receiver<bool>,
}

impl PeerLoop {
    async fn run(mut self) -> Result<(), HandlerError> {
        let result = self.serve_requests().await;
        self.registry.unsubscribe(self.subscription.id());
        result
    }

    async fn serve_requests(&mut self) -> Result<(), HandlerError> {
        let mut snapshot = ProtocolSet::new();
        let mut baseline_sent = false;

        loop {
            // A dropped sender also counts as shutdown.
            let reply = tokio::select! {
                biased;
                _ = self.shutdown.changed() => return Ok(()),
                request = self.requests.recv() => match request {
                    Some(reply) => reply,
                    None => return Ok(()),
                },
            };

            match self.serve(&mut snapshot, reply, !baseline_sent).await? {
                Served::Delivered => baseline_sent = true,
                Served::Abandoned => {}
                Served::Shutdown => return Ok(()),
            }
        }
    }

    async fn serve(
        &mut self,
        snapshot: &mut ProtocolSet,
        mut reply: DeltaRequest,
        allow_empty: bool,
    ) -> Result<Served, HandlerError> {
        loop {
            // Anything pending is covered by the read below.
            self.subscription.drain();
            let current = self.registry.protocols()?;
            let delta = Delta::between(snapshot, &current);

            if allow_empty || !delta.is_empty() {
                tracing::debug!(
                    peer = %self.peer,
                    added = delta.added.len(),
                    removed = delta.removed.len(),
                    "Computed protocol delta"
                );

                return Ok(match reply.send(delta) {
                    Ok(()) => {
                        *snapshot = current;
                        Served::Delivered
                    }
                    Err(_) => Served::Abandoned,
                });
            }

            tokio::select! {
                biased;
                _ = self.shutdown.changed() => return Ok(Served::Shutdown),
                () = reply.closed() => return Ok(Served::Abandoned),
                changed = self.subscription.changed() => {
                    if !changed {
                        return Err(HandlerError::SubscriptionLost);
                    }
                }
            }
        }
    }
}

/// Errors that can occur with a peer handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// `next_delta` called before `start`
    #[error("peer handler not started")]
    NotStarted,
    /// The handler has been closed
    #[error("peer handler closed")]
    Closed,
    /// The protocol registry could not be read
    #[error("protocol registry unavailable: {0}")]
    Registry(#[from] RegistryError),
    /// The registry stopped delivering change notifications
    #[error("registry subscription lost")]
    SubscriptionLost,
    /// The background task panicked or was cancelled
    #[error("peer handler task failed: {0}")]
    TaskFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::protocol_set;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);
    const QUIET: Duration = Duration::from_millis(50);

    fn handler_for(peer: &str, registry: &Arc<ProtocolRegistry>) -> PeerHandler {
        PeerHandler::new(
            PeerId::from(peer),
            Arc::clone(registry),
            Arc::new(PeerStore::new()),
        )
    }

    async fn next(handler: &PeerHandler) -> Delta {
        timeout(WAIT, handler.next_delta())
            .await
            .expect("timed out waiting for delta")
            .expect("handler failed")
    }

    #[tokio::test]
    async fn make_apply_delta() {
        let registry = Arc::new(ProtocolRegistry::new());
        let handler = handler_for("remote", &registry);
        handler.start().unwrap();

        // Nothing registered yet.
        let baseline = next(&handler).await;
        assert!(baseline.is_empty());

        registry.add(["p1"]).unwrap();
        let delta = next(&handler).await;
        assert_eq!(delta.added, protocol_set(["p1"]));
        assert!(delta.removed.is_empty());

        registry.add(["p2"]).unwrap();
        registry.add(["p3"]).unwrap();
        let delta = next(&handler).await;
        assert_eq!(delta.added, protocol_set(["p2", "p3"]));
        assert!(delta.removed.is_empty());

        registry.remove(["p3"]).unwrap();
        let delta = next(&handler).await;
        assert!(delta.added.is_empty());
        assert_eq!(delta.removed, protocol_set(["p3"]));

        registry.remove(["p2"]).unwrap();
        registry.remove(["p1"]).unwrap();
        let delta = next(&handler).await;
        assert!(delta.added.is_empty());
        assert_eq!(delta.removed, protocol_set(["p1", "p2"]));

        handler.close().await.unwrap();
    }

    #[tokio::test]
    async fn baseline_reflects_registry_at_start() {
        let registry = Arc::new(ProtocolRegistry::with_protocols(["p1", "p2"]));
        let handler = handler_for("remote", &registry);
        handler.start().unwrap();

        let baseline = next(&handler).await;
        assert_eq!(baseline.added, protocol_set(["p1", "p2"]));
        assert!(baseline.removed.is_empty());

        handler.close().await.unwrap();
    }

    #[tokio::test]
    async fn changes_before_first_call_fold_into_baseline() {
        let registry = Arc::new(ProtocolRegistry::with_protocols(["p1", "p2"]));
        let handler = handler_for("remote", &registry);
        handler.start().unwrap();

        registry.add(["p3"]).unwrap();
        registry.remove(["p1"]).unwrap();

        let baseline = next(&handler).await;
        assert_eq!(baseline.added, protocol_set(["p2", "p3"]));
        assert!(baseline.removed.is_empty());

        // The folded-in mutations are not announced again.
        assert!(timeout(QUIET, handler.next_delta()).await.is_err());

        handler.close().await.unwrap();
    }

    #[tokio::test]
    async fn handler_close() {
        let registry = Arc::new(ProtocolRegistry::new());
        let handler = handler_for("remote", &registry);
        handler.start().unwrap();
        assert_eq!(handler.state(), HandlerState::Running);

        handler.close().await.unwrap();
        assert_eq!(handler.state(), HandlerState::Closed);
        assert_eq!(registry.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let registry = Arc::new(ProtocolRegistry::new());
        let handler = handler_for("remote", &registry);
        handler.start().unwrap();

        timeout(WAIT, handler.close()).await.unwrap().unwrap();
        timeout(WAIT, handler.close()).await.unwrap().unwrap();
        assert_eq!(handler.next_delta().await, Err(HandlerError::Closed));
    }

    #[tokio::test]
    async fn close_before_start() {
        let registry = Arc::new(ProtocolRegistry::new());
        let handler = handler_for("remote", &registry);

        assert_eq!(handler.next_delta().await, Err(HandlerError::NotStarted));
        timeout(WAIT, handler.close()).await.unwrap().unwrap();
        assert_eq!(handler.state(), HandlerState::Closed);

        // Start after close is ignored.
        handler.start().unwrap();
        assert_eq!(handler.state(), HandlerState::Closed);
        assert_eq!(registry.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn pending_change_at_close_is_not_delivered() {
        let registry = Arc::new(ProtocolRegistry::new());
        let handler = handler_for("remote", &registry);
        handler.start().unwrap();
        next(&handler).await;

        registry.add(["p1"]).unwrap();
        timeout(WAIT, handler.close()).await.unwrap().unwrap();

        assert_eq!(handler.next_delta().await, Err(HandlerError::Closed));
        assert_eq!(registry.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn dropping_handler_stops_loop() {
        let registry = Arc::new(ProtocolRegistry::new());
        let handler = handler_for("remote", &registry);
        handler.start().unwrap();
        next(&handler).await;
        assert_eq!(registry.subscriber_count(), 1);

        drop(handler);

        timeout(WAIT, async {
            while registry.subscriber_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("loop kept its subscription after the handler was dropped");
    }

    #[tokio::test]
    async fn second_start_is_ignored() {
        let registry = Arc::new(ProtocolRegistry::new());
        let handler = handler_for("remote", &registry);

        handler.start().unwrap();
        handler.start().unwrap();
        assert_eq!(registry.subscriber_count(), 1);

        handler.close().await.unwrap();
    }

    #[tokio::test]
    async fn net_zero_change_yields_no_delta() {
        let registry = Arc::new(ProtocolRegistry::new());
        let handler = handler_for("remote", &registry);
        handler.start().unwrap();
        next(&handler).await;

        registry.add(["p1"]).unwrap();
        registry.remove(["p1"]).unwrap();

        assert!(timeout(QUIET, handler.next_delta()).await.is_err());

        registry.add(["p2"]).unwrap();
        let delta = next(&handler).await;
        assert_eq!(delta.added, protocol_set(["p2"]));
        assert!(delta.removed.is_empty());

        handler.close().await.unwrap();
    }

    #[tokio::test]
    async fn abandoned_request_does_not_advance_snapshot() {
        let registry = Arc::new(ProtocolRegistry::new());
        let handler = handler_for("remote", &registry);
        handler.start().unwrap();
        next(&handler).await;

        assert!(timeout(QUIET, handler.next_delta()).await.is_err());

        registry.add(["p1"]).unwrap();
        let delta = next(&handler).await;
        assert_eq!(delta.added, protocol_set(["p1"]));

        handler.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_races_in_flight_next_delta() {
        let registry = Arc::new(ProtocolRegistry::new());
        let handler = Arc::new(handler_for("remote", &registry));
        handler.start().unwrap();
        next(&handler).await;

        let waiter = {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move { handler.next_delta().await })
        };
        tokio::time::sleep(QUIET).await;

        timeout(WAIT, handler.close()).await.unwrap().unwrap();

        let result = timeout(WAIT, waiter).await.unwrap().unwrap();
        assert_eq!(result, Err(HandlerError::Closed));
        assert_eq!(registry.subscriber_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn deltas_reconstruct_registry_under_churn() {
        let registry = Arc::new(ProtocolRegistry::new());
        let handler = Arc::new(handler_for("remote", &registry));
        handler.start().unwrap();

        let mutator = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                for round in 0..200u32 {
                    let id = format!("p{}", round % 7);
                    if round % 3 == 0 {
                        registry.remove([id]).unwrap();
                    } else {
                        registry.add([id]).unwrap();
                    }
                    if round % 10 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
                registry.add(["final"]).unwrap();
            })
        };

        let mut view = ProtocolSet::new();
        let mut first = true;
        loop {
            let delta = next(&handler).await;
            assert!(delta.added.is_disjoint(&delta.removed));
            assert!(first || !delta.is_empty());
            first = false;

            delta.apply_to(&mut view);
            // "final" is the last mutation, so seeing it means we are caught up.
            if view.contains(&ProtocolId::from("final")) {
                break;
            }
        }

        mutator.await.unwrap();
        assert_eq!(view, registry.protocols().unwrap());
        handler.close().await.unwrap();
    }

    #[tokio::test]
    async fn handlers_track_peers_independently() {
        let registry = Arc::new(ProtocolRegistry::new());
        let fast = handler_for("fast", &registry);
        let slow = handler_for("slow", &registry);
        fast.start().unwrap();
        slow.start().unwrap();
        next(&fast).await;
        next(&slow).await;

        registry.add(["p1"]).unwrap();
        assert_eq!(next(&fast).await.added, protocol_set(["p1"]));

        registry.add(["p2"]).unwrap();
        assert_eq!(next(&fast).await.added, protocol_set(["p2"]));

        // The slow peer catches up in one step.
        assert_eq!(next(&slow).await.added, protocol_set(["p1", "p2"]));

        fast.close().await.unwrap();
        slow.close().await.unwrap();
    }

    #[tokio::test]
    async fn lost_subscription_is_reported_on_close() {
        let registry = Arc::new(ProtocolRegistry::new());
        let handler = Arc::new(handler_for("remote", &registry));
        handler.start().unwrap();
        next(&handler).await;

        let waiter = {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move { handler.next_delta().await })
        };
        tokio::time::sleep(QUIET).await;

        registry.clear_subscribers();

        let result = timeout(WAIT, waiter).await.unwrap().unwrap();
        assert_eq!(result, Err(HandlerError::Closed));
        assert_eq!(handler.close().await, Err(HandlerError::SubscriptionLost));
    }

    #[tokio::test]
    async fn peer_supports_proto() {
        let registry = Arc::new(ProtocolRegistry::new());
        let peers = Arc::new(PeerStore::new());
        let remote = PeerId::from("test");
        let handler = PeerHandler::new(remote.clone(), registry, Arc::clone(&peers));

        peers.add_protocols(&remote, ["test"]).unwrap();
        assert!(handler.peer_supports_protos(&["test".into()]));
        assert!(handler.peer_supports_protos(&["random".into(), "test".into()]));
        assert!(!handler.peer_supports_protos(&["random".into()]));

        // remove support for protocol and check
        peers.remove_protocols(&remote, ["test"]).unwrap();
        assert!(!handler.peer_supports_protos(&["test".into()]));

        let stranger = PeerHandler::new(
            PeerId::from("stranger"),
            Arc::new(ProtocolRegistry::new()),
            peers,
        );
        assert!(!stranger.peer_supports_protos(&["test".into()]));
    }
}
