//! A realtime channel: one topic, its subscribers, and its presence state.
//!
//! Channels store only connection ids; the hub resolves ids back to live
//! connections, which keeps the connection↔channel graph acyclic.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::filter::ChangeFilter;
use crate::presence::{PresenceDiff, PresenceState};
use crate::protocol::{BroadcastConfig, PgChangeRequest};

/// One postgres-changes subscription with its server-assigned id.
#[derive(Debug, Clone)]
pub struct PgChangeSub {
    pub id: i64,
    pub request: PgChangeRequest,
    pub filter: Option<ChangeFilter>,
}

/// One connection's membership in a channel.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub conn_id: Uuid,
    pub join_ref: Option<String>,
    pub broadcast: BroadcastConfig,
    /// Empty string means the subscriber never appears in presence state.
    pub presence_key: String,
    pub pg_changes: Vec<PgChangeSub>,
}

#[derive(Default)]
struct ChannelState {
    subscribers: HashMap<Uuid, Subscription>,
    presence: PresenceState,
}

pub struct Channel {
    pub topic: String,
    pub private: bool,
    state: RwLock<ChannelState>,
}

impl Channel {
    pub fn new(topic: &str, private: bool) -> Self {
        Self {
            topic: topic.to_string(),
            private,
            state: RwLock::new(ChannelState::default()),
        }
    }

    /// Inserts or replaces the connection's subscription (a re-join updates
    /// the configuration in place).
    pub fn subscribe(&self, sub: Subscription) {
        self.state.write().subscribers.insert(sub.conn_id, sub);
    }

    /// Removes the subscription and synthesizes presence leaves for it.
    /// Returns the presence diff and whether the channel is now empty.
    pub fn unsubscribe(&self, conn_id: Uuid) -> (PresenceDiff, bool) {
        let mut state = self.state.write();
        state.subscribers.remove(&conn_id);
        let diff = state.presence.untrack_all(conn_id);
        let empty = state.subscribers.is_empty();
        (diff, empty)
    }

    pub fn is_member(&self, conn_id: Uuid) -> bool {
        self.state.read().subscribers.contains_key(&conn_id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.read().subscribers.len()
    }

    /// Snapshot of all subscriptions, taken under the read lock so fan-out
    /// can run without holding it.
    pub fn subscriber_snapshot(&self) -> Vec<Subscription> {
        self.state.read().subscribers.values().cloned().collect()
    }

    pub fn subscription(&self, conn_id: Uuid) -> Option<Subscription> {
        self.state.read().subscribers.get(&conn_id).cloned()
    }

    pub fn presence_snapshot(&self) -> Map<String, Value> {
        self.state.read().presence.snapshot()
    }

    pub fn presence_track(&self, key: &str, conn_id: Uuid, payload: Value) -> PresenceDiff {
        self.state.write().presence.track(key, conn_id, payload)
    }

    pub fn presence_untrack(&self, key: &str, conn_id: Uuid) -> PresenceDiff {
        self.state.write().presence.untrack(key, conn_id)
    }
}
