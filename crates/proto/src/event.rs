use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::ChannelId;

/// Event published against a channel and fanned out to its subscribers.
///
/// Exists only for the duration of a fan-out; the gateway never persists it.
/// `payload` is opaque and passed through unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedEvent {
    /// Target channel.
    pub channel_id: ChannelId,
    /// Event name chosen by the publisher (e.g. "status").
    pub event: String,
    /// Opaque payload.
    pub payload: serde_json::Value,
    /// Time the publisher handed the event to the registry.
    pub sent_at: DateTime<Utc>,
}

impl PublishedEvent {
    /// Creates an event stamped with the current time.
    pub fn new(
        channel_id: impl Into<ChannelId>,
        event: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            event: event.into(),
            payload,
            sent_at: Utc::now(),
        }
    }
}
