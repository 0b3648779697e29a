//! The local host's protocol registry.
//!
//! The registry is the single source of truth for the protocols the host
//! serves. Every mutation that changes the set wakes all subscribers through
//! a single-slot channel: a subscriber that has not yet consumed its pending
//! wake-up simply keeps the one it has, so any burst of mutations between two
//! reads collapses into one notification.

use crate::protocol::{ProtocolId, ProtocolSet};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Token identifying a registry subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A subscription to "protocol set changed" notifications.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    rx: mpsc::Receiver<()>,
}

impl Subscription {
    /// The token to pass to [`ProtocolRegistry::unsubscribe`].
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Wait for the next change notification.
    ///
    /// Returns `false` once the registry has dropped this subscription.
    pub async fn changed(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }

    /// Discard a pending notification, if any.
    ///
    /// Returns `true` if one was pending.
    pub fn drain(&mut self) -> bool {
        self.rx.try_recv().is_ok()
    }
}

/// Thread-safe protocol registry with change subscriptions.
#[derive(Debug, Default)]
pub struct ProtocolRegistry {
    protocols: RwLock<ProtocolSet>,
    subscribers: Mutex<HashMap<SubscriptionId, mpsc::Sender<()>>>,
    next_id: AtomicU64,
}

impl ProtocolRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry pre-populated with protocols.
    #[must_use]
    pub fn with_protocols<I, P>(ids: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<ProtocolId>,
    {
        Self {
            protocols: RwLock::new(ids.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    /// Register protocols.
    ///
    /// Subscribers are notified once if at least one protocol was new.
    ///
    /// # Errors
    ///
    /// Returns error if the registry lock is poisoned.
    pub fn add<I, P>(&self, ids: I) -> Result<bool, RegistryError>
    where
        I: IntoIterator<Item = P>,
        P: Into<ProtocolId>,
    {
        let changed = {
            let mut protocols = self.protocols.write().map_err(|_| RegistryError::Poisoned)?;
            ids.into_iter()
                .fold(false, |changed, id| protocols.insert(id.into()) || changed)
        };

        if changed {
            self.notify();
        }
        Ok(changed)
    }

    /// Unregister protocols.
    ///
    /// Subscribers are notified once if at least one protocol was present.
    ///
    /// # Errors
    ///
    /// Returns error if the registry lock is poisoned.
    pub fn remove<I, P>(&self, ids: I) -> Result<bool, RegistryError>
    where
        I: IntoIterator<Item = P>,
        P: Into<ProtocolId>,
    {
        let changed = {
            let mut protocols = self.protocols.write().map_err(|_| RegistryError::Poisoned)?;
            ids.into_iter().fold(false, |changed, id| {
                let id: ProtocolId = id.into();
                protocols.remove(&id) || changed
            })
        };

        if changed {
            self.notify();
        }
        Ok(changed)
    }

    /// Read the current protocol set.
    ///
    /// # Errors
    ///
    /// Returns error if the registry lock is poisoned.
    pub fn protocols(&self) -> Result<ProtocolSet, RegistryError> {
        self.protocols
            .read()
            .map(|protocols| protocols.clone())
            .map_err(|_| RegistryError::Poisoned)
    }

    /// Check whether a protocol is registered.
    ///
    /// # Errors
    ///
    /// Returns error if the registry lock is poisoned.
    pub fn contains(&self, id: &ProtocolId) -> Result<bool, RegistryError> {
        self.protocols
            .read()
            .map(|protocols| protocols.contains(id))
            .map_err(|_| RegistryError::Poisoned)
    }

    /// Subscribe to change notifications.
    ///
    /// # Errors
    ///
    /// Returns error if the subscriber table lock is poisoned.
    pub fn subscribe(&self) -> Result<Subscription, RegistryError> {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(1);

        self.subscribers
            .lock()
            .map_err(|_| RegistryError::Poisoned)?
            .insert(id, tx);

        tracing::debug!(subscription = %id, "Registry subscriber added");
        Ok(Subscription { id, rx })
    }

    /// Stop delivering notifications to a subscription.
    ///
    /// Unknown tokens are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let removed = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some();

        if removed {
            tracing::debug!(subscription = %id, "Registry subscriber removed");
        }
    }

    /// Drop every subscription.
    ///
    /// Subscribers observe this as a closed notification channel.
    pub fn clear_subscribers(&self) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if !subscribers.is_empty() {
            tracing::info!(count = subscribers.len(), "Dropping all registry subscribers");
            subscribers.clear();
        }
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    // Runs after the set has changed, so it must not fail the mutation.
    fn notify(&self) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        subscribers.retain(|id, tx| match tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => true,
            Err(TrySendError::Closed(())) => {
                tracing::debug!(subscription = %id, "Pruning closed registry subscriber");
                false
            }
        });
    }
}

/// Errors that can occur with the registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// A thread panicked while holding a registry lock
    #[error("protocol registry lock poisoned")]
    Poisoned,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::protocol_set;

    #[test]
    fn add_and_remove_report_changes() {
        let registry = ProtocolRegistry::new();

        assert!(registry.add(["p1", "p2"]).unwrap());
        assert!(!registry.add(["p1"]).unwrap());
        assert!(registry.remove(["p2", "p9"]).unwrap());
        assert!(!registry.remove(["p9"]).unwrap());

        assert_eq!(registry.protocols().unwrap(), protocol_set(["p1"]));
        assert!(registry.contains(&"p1".into()).unwrap());
    }

    #[tokio::test]
    async fn burst_of_mutations_coalesces_into_one_notification() {
        let registry = ProtocolRegistry::new();
        let mut sub = registry.subscribe().unwrap();

        registry.add(["p1"]).unwrap();
        registry.add(["p2"]).unwrap();
        registry.remove(["p1"]).unwrap();

        assert!(sub.drain());
        assert!(!sub.drain());
    }

    #[tokio::test]
    async fn unchanged_mutation_does_not_notify() {
        let registry = ProtocolRegistry::with_protocols(["p1"]);
        let mut sub = registry.subscribe().unwrap();

        registry.add(["p1"]).unwrap();
        registry.remove(["p2"]).unwrap();

        assert!(!sub.drain());
    }

    #[tokio::test]
    async fn every_subscriber_is_notified() {
        let registry = ProtocolRegistry::new();
        let mut a = registry.subscribe().unwrap();
        let mut b = registry.subscribe().unwrap();

        registry.add(["p1"]).unwrap();

        assert!(a.changed().await);
        assert!(b.changed().await);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let registry = ProtocolRegistry::new();
        let mut sub = registry.subscribe().unwrap();
        assert_eq!(registry.subscriber_count(), 1);

        registry.unsubscribe(sub.id());
        registry.unsubscribe(sub.id());
        assert_eq!(registry.subscriber_count(), 0);

        registry.add(["p1"]).unwrap();
        assert!(!sub.changed().await);
    }

    #[tokio::test]
    async fn clear_closes_every_subscription() {
        let registry = ProtocolRegistry::new();
        let mut a = registry.subscribe().unwrap();
        let mut b = registry.subscribe().unwrap();

        registry.clear_subscribers();

        assert_eq!(registry.subscriber_count(), 0);
        assert!(!a.changed().await);
        assert!(!b.changed().await);
    }

    #[tokio::test]
    async fn mutation_notifies_despite_poisoned_subscriber_table() {
        let registry = std::sync::Arc::new(ProtocolRegistry::new());
        let mut sub = registry.subscribe().unwrap();

        let poisoner = std::sync::Arc::clone(&registry);
        let joined = std::thread::spawn(move || {
            let _guard = poisoner.subscribers.lock().unwrap();
            panic!("poison subscriber table");
        })
        .join();
        assert!(joined.is_err());
        assert!(registry.subscribers.is_poisoned());

        assert!(registry.add(["p1"]).unwrap());
        assert!(sub.changed().await);
        assert!(registry.remove(["p1"]).unwrap());
        assert!(sub.changed().await);
        assert!(registry.protocols().unwrap().is_empty());
    }

    #[test]
    fn dropped_subscriptions_are_pruned() {
        let registry = ProtocolRegistry::new();
        drop(registry.subscribe().unwrap());
        assert_eq!(registry.subscriber_count(), 1);

        registry.add(["p1"]).unwrap();
        assert_eq!(registry.subscriber_count(), 0);
    }
}
