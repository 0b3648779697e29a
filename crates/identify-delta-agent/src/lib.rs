//! # Identify Delta Agent
//!
//! Keeps every connected peer informed of the protocols this host serves.
//!
//! ## Architecture
//!
//! The agent runs one pair of tasks per connected peer:
//! 1. **Handler**: tracks what the peer has been told and waits for registry changes
//! 2. **Pusher**: encodes each delta and queues it on the shared outbound channel
//!
//! The host side (registry mutations, connects and disconnects) is driven by
//! [`Host`], which the binary feeds from stdin.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod host;
pub mod service;

pub use config::{AgentConfig, PeerConfig, PushConfig};
pub use host::{Command, CommandError, Host, Reply};
pub use service::{IdentifyService, Outbound, ServiceError};
