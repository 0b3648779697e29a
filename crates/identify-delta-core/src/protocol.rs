//! Protocol and peer identifiers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// An opaque application protocol identifier, e.g. `/ipfs/id/push/1.0.0`.
///
/// Two identifiers name the same protocol iff their strings are equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolId(String);

impl ProtocolId {
    /// Create a protocol identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ProtocolId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ProtocolId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for ProtocolId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An opaque identifier for a remote peer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Create a peer identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A set of protocol identifiers.
///
/// Ordered so that deltas and log output are deterministic.
pub type ProtocolSet = BTreeSet<ProtocolId>;

/// Build a [`ProtocolSet`] from anything convertible into protocol identifiers.
pub fn protocol_set<I, P>(ids: I) -> ProtocolSet
where
    I: IntoIterator<Item = P>,
    P: Into<ProtocolId>,
{
    ids.into_iter().map(Into::into).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_set_deduplicates() {
        let set = protocol_set(["/a/1.0.0", "/b/1.0.0", "/a/1.0.0"]);
        assert_eq!(set.len(), 2);
        assert!(set.contains(&ProtocolId::from("/a/1.0.0")));
    }

    #[test]
    fn identifiers_display_verbatim() {
        assert_eq!(PeerId::from("QmPeer").to_string(), "QmPeer");
        assert_eq!(ProtocolId::new("/ipfs/ping/1.0.0").as_str(), "/ipfs/ping/1.0.0");
    }
}
