//! Realtime wire envelope exchanged over WebSocket text frames.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::PublishedEvent;
use crate::message::{ChannelId, ConnectionId};

/// WebSocket message envelope for client-server communication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsMessage {
    /// Client subscribes to a device channel.
    #[serde(rename = "join_device")]
    JoinDevice { device_id: ChannelId },
    /// Server acknowledges a join.
    #[serde(rename = "joined")]
    Joined { device_id: ChannelId },
    /// Server greets a freshly accepted connection.
    #[serde(rename = "connected")]
    Connected { connection_id: ConnectionId },
    /// Server pushes a published event.
    #[serde(rename = "event")]
    Event {
        device_id: ChannelId,
        event: String,
        payload: serde_json::Value,
        sent_at: DateTime<Utc>,
    },
    /// Heartbeat ping from client.
    #[serde(rename = "ping")]
    Ping,
    /// Heartbeat pong from server.
    #[serde(rename = "pong")]
    Pong,
    /// Any other well-formed message type; ignored by the gateway.
    #[serde(other)]
    Unknown,
}

impl From<PublishedEvent> for WsMessage {
    fn from(event: PublishedEvent) -> Self {
        Self::Event {
            device_id: event.channel_id,
            event: event.event,
            payload: event.payload,
            sent_at: event.sent_at,
        }
    }
}
