//! In-memory channel membership and fan-out.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use proto::{ChannelId, ConnectionId, PublishedEvent};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Per-connection delivery queue fed by [`ChannelRegistry::publish`].
pub type Outbox = mpsc::Sender<Arc<PublishedEvent>>;

/// The only call request handlers need to push events to subscribers.
pub trait EventPublisher: Send + Sync {
    /// Fan `event` out to the current subscribers of its channel.
    ///
    /// Returns how many connections the event was handed to. Zero
    /// subscribers is not an error.
    fn publish(&self, event: PublishedEvent) -> usize;
}

/// Registry record for one live connection.
struct ConnectionEntry {
    outbox: Outbox,
    channels: HashSet<ChannelId>,
}

/// Maps device channels to the connections subscribed to them.
///
/// Lock order is connections before channels. Nothing holds a `channels`
/// guard while acquiring a `connections` guard.
#[derive(Default)]
pub struct ChannelRegistry {
    /// connection_id -> outbox + joined channels
    connections: DashMap<ConnectionId, ConnectionEntry>,
    /// channel_id -> subscribed connection ids
    channels: DashMap<ChannelId, HashSet<ConnectionId>>,
}

impl ChannelRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly accepted connection with no subscriptions.
    pub fn register(&self, id: ConnectionId, outbox: Outbox) {
        debug!(connection_id = %id, "Registering connection");
        self.connections.insert(
            id,
            ConnectionEntry {
                outbox,
                channels: HashSet::new(),
            },
        );
    }

    /// Subscribe `id` to `channel`, creating the channel if needed.
    ///
    /// Returns `true` when this call added the subscription. Repeated joins
    /// and joins for a connection that already left are no-ops.
    pub fn join(&self, channel: ChannelId, id: ConnectionId) -> bool {
        let Some(mut conn) = self.connections.get_mut(&id) else {
            debug!(connection_id = %id, channel = %channel, "Join for unknown connection ignored");
            return false;
        };
        if !conn.channels.insert(channel.clone()) {
            return false;
        }
        debug!(connection_id = %id, channel = %channel, "Joined channel");
        self.channels.entry(channel).or_default().insert(id);
        true
    }

    /// Remove `id` from every channel it joined and forget the connection.
    ///
    /// Returns the number of channels it was removed from. Calling it for
    /// an unknown or already removed connection returns 0.
    pub fn leave(&self, id: ConnectionId) -> usize {
        let Some((_, entry)) = self.connections.remove(&id) else {
            return 0;
        };
        for channel in &entry.channels {
            let now_empty = match self.channels.get_mut(channel) {
                Some(mut subscribers) => {
                    subscribers.remove(&id);
                    subscribers.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.channels
                    .remove_if(channel, |_, subscribers| subscribers.is_empty());
            }
        }
        debug!(connection_id = %id, channels = entry.channels.len(), "Connection left");
        entry.channels.len()
    }

    /// Deliver `event` to the snapshot of current subscribers of its channel.
    pub fn publish(&self, event: PublishedEvent) -> usize {
        let subscribers: Vec<ConnectionId> = match self.channels.get(&event.channel_id) {
            Some(set) => set.iter().copied().collect(),
            None => {
                debug!(channel = %event.channel_id, "Publish to channel without subscribers");
                return 0;
            }
        };

        let channel = event.channel_id.clone();
        let event = Arc::new(event);
        let mut delivered = 0;
        for id in subscribers {
            // Gone between snapshot and send: it has already left.
            let Some(conn) = self.connections.get(&id) else {
                continue;
            };
            match conn.outbox.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(connection_id = %id, channel = %channel, "Outbox full, event dropped");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(connection_id = %id, channel = %channel, "Outbox closed, event dropped");
                }
            }
        }
        debug!(channel = %channel, delivered, "Event published");
        delivered
    }

    /// Number of connections currently subscribed to `channel`.
    pub fn subscriber_count(&self, channel: &ChannelId) -> usize {
        self.channels.get(channel).map(|s| s.len()).unwrap_or(0)
    }

    /// Channels `id` is subscribed to, in no particular order.
    pub fn channels_of(&self, id: ConnectionId) -> Vec<ChannelId> {
        self.connections
            .get(&id)
            .map(|conn| conn.channels.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether `id` is registered and not yet left.
    pub fn is_registered(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of channels with at least one subscriber.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

impl EventPublisher for ChannelRegistry {
    fn publish(&self, event: PublishedEvent) -> usize {
        ChannelRegistry::publish(self, event)
    }
}
