//! # Identify Delta Core
//!
//! Per-peer tracking of the protocols a local host advertises.
//!
//! This crate provides:
//! - Protocol and peer identifiers plus the [`Delta`] computed between two protocol sets
//! - [`ProtocolRegistry`], the host's protocol set with coalescing change notifications
//! - [`PeerStore`], the protocols each remote peer is known to support
//! - [`PeerHandler`], one background task per connected peer producing cumulative deltas

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod delta;
pub mod handler;
pub mod peerstore;
pub mod protocol;
pub mod registry;

pub use delta::Delta;
pub use handler::{HandlerError, HandlerState, PeerHandler};
pub use peerstore::{PeerStore, StoreError};
pub use protocol::{protocol_set, PeerId, ProtocolId, ProtocolSet};
pub use registry::{ProtocolRegistry, RegistryError, Subscription, SubscriptionId};
