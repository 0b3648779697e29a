//! Protocol set deltas.
//!
//! A [`Delta`] describes how a peer's view of the local host's protocols has
//! to change to match the host's current protocol set.
//!
//! # Invariants
//!
//! For `delta = Delta::between(previous, current)`:
//! - `added ∩ removed = ∅`
//! - `previous ∪ added − removed = current`

use crate::protocol::ProtocolSet;
use serde::{Deserialize, Serialize};

/// Protocols added and removed between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    /// Protocols present now but not in the previous snapshot
    pub added: ProtocolSet,
    /// Protocols present in the previous snapshot but not now
    pub removed: ProtocolSet,
}

impl Delta {
    /// Create an empty delta.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute the delta that takes `previous` to `current`.
    #[must_use]
    pub fn between(previous: &ProtocolSet, current: &ProtocolSet) -> Self {
        Self {
            added: current.difference(previous).cloned().collect(),
            removed: previous.difference(current).cloned().collect(),
        }
    }

    /// Check if the delta carries no change.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Apply this delta to a snapshot.
    pub fn apply_to(&self, snapshot: &mut ProtocolSet) {
        snapshot.extend(self.added.iter().cloned());
        for id in &self.removed {
            snapshot.remove(id);
        }
    }
}
