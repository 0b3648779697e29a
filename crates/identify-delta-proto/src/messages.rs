//! Protocol messages for identify delta pushes.

use identify_delta_core::{Delta, ProtocolId, ProtocolSet};
use serde::{Deserialize, Serialize};

/// Protocol identifier the push stream is opened with.
pub const PUSH_PROTOCOL_ID: &str = "/p2p/id/delta/1.0.0";

/// Longest protocol identifier accepted from the wire, in bytes.
pub const MAX_PROTOCOL_ID_LEN: usize = 1024;

/// A protocol delta pushed to a single peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaMessage {
    /// Protocols the sender now serves
    pub added_protocols: Vec<String>,
    /// Protocols the sender no longer serves
    pub removed_protocols: Vec<String>,
}

impl DeltaMessage {
    /// Validate the message and convert it back into a [`Delta`].
    ///
    /// # Errors
    ///
    /// Returns error if an identifier is empty, too long, or appears as both
    /// added and removed.
    pub fn into_delta(self) -> Result<Delta, MessageError> {
        let added = validate_all(self.added_protocols)?;
        let removed = validate_all(self.removed_protocols)?;

        if let Some(id) = added.intersection(&removed).next() {
            return Err(MessageError::Conflict(id.to_string()));
        }

        Ok(Delta { added, removed })
    }

    /// Serialize to CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_cbor(&self) -> Result<Vec<u8>, MessageError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| MessageError::Serialize(e.to_string()))?;
        Ok(bytes)
    }

    /// Deserialize from CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, MessageError> {
        ciborium::from_reader(bytes).map_err(|e| MessageError::Deserialize(e.to_string()))
    }
}

impl From<&Delta> for DeltaMessage {
    fn from(delta: &Delta) -> Self {
        Self {
            added_protocols: delta.added.iter().map(ToString::to_string).collect(),
            removed_protocols: delta.removed.iter().map(ToString::to_string).collect(),
        }
    }
}

fn validate_all(ids: Vec<String>) -> Result<ProtocolSet, MessageError> {
    ids.into_iter()
        .map(|id| {
            if id.is_empty() {
                Err(MessageError::EmptyProtocolId)
            } else if id.len() > MAX_PROTOCOL_ID_LEN {
                Err(MessageError::ProtocolIdTooLong(id.len()))
            } else {
                Ok(ProtocolId::from(id))
            }
        })
        .collect()
}

/// Errors for message operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    /// Serialization failed
    #[error("serialization error: {0}")]
    Serialize(String),
    /// Deserialization failed
    #[error("deserialization error: {0}")]
    Deserialize(String),
    /// An empty protocol identifier
    #[error("empty protocol identifier")]
    EmptyProtocolId,
    /// A protocol identifier over [`MAX_PROTOCOL_ID_LEN`] bytes
    #[error("protocol identifier of {0} bytes exceeds limit")]
    ProtocolIdTooLong(usize),
    /// A protocol listed as both added and removed
    #[error("protocol {0} both added and removed")]
    Conflict(String),
}
