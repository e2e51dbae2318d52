//! Shared protocol types for the device gateway.
//!
//! This crate defines the identity newtypes, the published event value,
//! the realtime wire envelope and the strongly-typed error enums shared
//! across the workspace.

pub mod error;
pub mod event;
pub mod message;
pub mod wire;

/// Re-export of all protocol error types.
pub use error::*;
/// Re-export of the fan-out event value.
pub use event::PublishedEvent;
/// Re-export of channel/connection identity types.
pub use message::{ChannelId, ConnectionId};
/// Re-export of the realtime wire envelope.
pub use wire::WsMessage;
