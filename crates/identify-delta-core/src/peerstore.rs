//! Protocols observed to be supported by remote peers.

use crate::protocol::{PeerId, ProtocolId, ProtocolSet};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Concurrent peer capability store.
///
/// Written by whatever observes remote peers (identify responses, pushes)
/// and read concurrently by every peer handler.
#[derive(Debug, Default)]
pub struct PeerStore {
    protocols: RwLock<HashMap<PeerId, ProtocolSet>>,
}

impl PeerStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record additional protocols for a peer.
    ///
    /// # Errors
    ///
    /// Returns error if the store lock is poisoned.
    pub fn add_protocols<I, P>(&self, peer: &PeerId, ids: I) -> Result<(), StoreError>
    where
        I: IntoIterator<Item = P>,
        P: Into<ProtocolId>,
    {
        self.write()?
            .entry(peer.clone())
            .or_default()
            .extend(ids.into_iter().map(Into::into));
        Ok(())
    }

    /// Replace the protocols recorded for a peer.
    ///
    /// # Errors
    ///
    /// Returns error if the store lock is poisoned.
    pub fn set_protocols<I, P>(&self, peer: &PeerId, ids: I) -> Result<(), StoreError>
    where
        I: IntoIterator<Item = P>,
        P: Into<ProtocolId>,
    {
        self.write()?
            .insert(peer.clone(), ids.into_iter().map(Into::into).collect());
        Ok(())
    }

    /// Forget protocols for a peer.
    ///
    /// # Errors
    ///
    /// Returns error if the store lock is poisoned.
    pub fn remove_protocols<I, P>(&self, peer: &PeerId, ids: I) -> Result<(), StoreError>
    where
        I: IntoIterator<Item = P>,
        P: Into<ProtocolId>,
    {
        let mut store = self.write()?;
        if let Some(known) = store.get_mut(peer) {
            for id in ids {
                let id: ProtocolId = id.into();
                known.remove(&id);
            }
        }
        Ok(())
    }

    /// Forget everything recorded for a peer.
    ///
    /// # Errors
    ///
    /// Returns error if the store lock is poisoned.
    pub fn remove_peer(&self, peer: &PeerId) -> Result<(), StoreError> {
        self.write()?.remove(peer);
        Ok(())
    }

    /// Protocols recorded for a peer (empty if unknown).
    ///
    /// # Errors
    ///
    /// Returns error if the store lock is poisoned.
    pub fn protocols(&self, peer: &PeerId) -> Result<ProtocolSet, StoreError> {
        Ok(self.read()?.get(peer).cloned().unwrap_or_default())
    }

    /// The subset of `candidates` the peer is known to support.
    ///
    /// # Errors
    ///
    /// Returns error if the store lock is poisoned.
    pub fn supports_protocols(
        &self,
        peer: &PeerId,
        candidates: &[ProtocolId],
    ) -> Result<Vec<ProtocolId>, StoreError> {
        let store = self.read()?;
        let Some(known) = store.get(peer) else {
            return Ok(Vec::new());
        };

        Ok(candidates
            .iter()
            .filter(|id| known.contains(*id))
            .cloned()
            .collect())
    }

    /// All peers with a record.
    ///
    /// # Errors
    ///
    /// Returns error if the store lock is poisoned.
    pub fn peers(&self) -> Result<Vec<PeerId>, StoreError> {
        Ok(self.read()?.keys().cloned().collect())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<PeerId, ProtocolSet>>, StoreError> {
        self.protocols.read().map_err(|_| StoreError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<PeerId, ProtocolSet>>, StoreError> {
        self.protocols.write().map_err(|_| StoreError::Poisoned)
    }
}

/// Errors that can occur with the peer store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// A thread panicked while holding the store lock
    #[error("peer store lock poisoned")]
    Poisoned,
}
