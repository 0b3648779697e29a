//! # Identify Delta Protocol
//!
//! Push payloads announcing changes to the protocols a host serves.
//!
//! ## Messages
//!
//! - `DeltaMessage`: protocols added and removed since the last push to a peer

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod messages;

pub use messages::{DeltaMessage, MessageError, MAX_PROTOCOL_ID_LEN, PUSH_PROTOCOL_ID};
