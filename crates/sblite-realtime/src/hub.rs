//! The realtime hub: connection registry, channel registry, and fan-out.
//!
//! Locks are never held across I/O: fan-out takes a snapshot of the
//! subscriber list under the read lock, releases it, then pushes into each
//! connection's bounded send queue. A full queue drops the message for that
//! connection only.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use sblite_db::rest::{ChangeEvent, ChangeOp};
use sblite_db::AuthContext;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::channel::{Channel, PgChangeSub, Subscription};
use crate::filter::ChangeFilter;
use crate::presence::PresenceDiff;
use crate::protocol::{
    postgres_changes_message, presence_diff_message, JoinPayload, PgChangeRequest, PhoenixMessage,
};

/// Bounded send-queue capacity per connection. Slow consumers lose messages
/// rather than blocking fan-out.
pub const SEND_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Error, PartialEq)]
pub enum HubError {
    #[error("private channel requires a valid JWT")]
    Unauthorized,
    #[error("not joined to topic '{0}'")]
    NotJoined(String),
    #[error("{0}")]
    BadPayload(String),
}

/// One live WebSocket connection as the hub sees it.
pub struct Conn {
    pub id: Uuid,
    sender: mpsc::Sender<String>,
    ctx: RwLock<AuthContext>,
    closed: AtomicBool,
}

impl Conn {
    /// Queues a message, dropping it (with a log line) when the consumer is
    /// too slow to drain its queue.
    pub fn send(&self, message: &PhoenixMessage) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        match self.sender.try_send(message.encode()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(conn = %self.id, event = %message.event, "send queue full; dropping message");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    pub fn auth_context(&self) -> AuthContext {
        self.ctx.read().clone()
    }

    /// Swaps in revalidated claims (`access_token` event). Channel state is
    /// untouched.
    pub fn update_auth(&self, ctx: AuthContext) {
        *self.ctx.write() = ctx;
    }

    /// Whether a user JWT has been presented on this connection.
    pub fn has_jwt(&self) -> bool {
        let ctx = self.ctx.read();
        ctx.user_id.is_some() || !ctx.claims.is_empty()
    }
}

/// Everything the socket driver needs to answer a successful join.
#[derive(Debug)]
pub struct JoinAck {
    pub subscriptions: Vec<(i64, PgChangeRequest)>,
    pub presence_state: serde_json::Map<String, Value>,
}

pub struct Hub {
    conns: RwLock<HashMap<Uuid, Arc<Conn>>>,
    channels: RwLock<HashMap<String, Arc<Channel>>>,
    next_sub_id: AtomicI64,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Self {
            conns: RwLock::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
            next_sub_id: AtomicI64::new(1),
        }
    }

    /// Registers a connection and hands back the receive side of its send
    /// queue for the write loop to drain.
    pub fn register(&self, ctx: AuthContext) -> (Arc<Conn>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let conn = Arc::new(Conn {
            id: Uuid::new_v4(),
            sender: tx,
            ctx: RwLock::new(ctx),
            closed: AtomicBool::new(false),
        });
        self.conns.write().insert(conn.id, conn.clone());
        debug!(conn = %conn.id, "connection registered");
        (conn, rx)
    }

    pub fn connection_count(&self) -> usize {
        self.conns.read().len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }

    pub fn has_channel(&self, topic: &str) -> bool {
        self.channels.read().contains_key(topic)
    }

    /// `phx_join`: records the subscription and returns what the driver must
    /// echo back (sub ids and the current presence state).
    pub fn join(
        &self,
        conn: &Arc<Conn>,
        topic: &str,
        join_ref: Option<String>,
        payload: &JoinPayload,
    ) -> Result<JoinAck, HubError> {
        if payload.config.private && !conn.has_jwt() {
            return Err(HubError::Unauthorized);
        }

        let channel = {
            let mut channels = self.channels.write();
            channels
                .entry(topic.to_string())
                .or_insert_with(|| Arc::new(Channel::new(topic, payload.config.private)))
                .clone()
        };

        let mut pg_changes = Vec::with_capacity(payload.config.postgres_changes.len());
        let mut subscriptions = Vec::with_capacity(payload.config.postgres_changes.len());
        for request in &payload.config.postgres_changes {
            let filter = match request.filter.as_deref().filter(|f| !f.is_empty()) {
                Some(raw) => Some(
                    ChangeFilter::parse(raw)
                        .map_err(|err| HubError::BadPayload(err.to_string()))?,
                ),
                None => None,
            };
            let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
            subscriptions.push((id, request.clone()));
            pg_changes.push(PgChangeSub {
                id,
                request: request.clone(),
                filter,
            });
        }

        channel.subscribe(Subscription {
            conn_id: conn.id,
            join_ref,
            broadcast: payload.config.broadcast.clone(),
            presence_key: payload.config.presence.key.clone(),
            pg_changes,
        });

        Ok(JoinAck {
            subscriptions,
            presence_state: channel.presence_snapshot(),
        })
    }

    /// `phx_leave`. Returns false when the connection was not a member.
    pub fn leave(&self, conn_id: Uuid, topic: &str) -> bool {
        let Some(channel) = self.channel(topic) else {
            return false;
        };
        if !channel.is_member(conn_id) {
            return false;
        }
        let (diff, empty) = channel.unsubscribe(conn_id);
        self.fanout_presence_diff(&channel, diff);
        if empty {
            self.remove_channel_if_empty(topic);
        }
        true
    }

    /// Client `broadcast`: fans out to the channel, excluding the sender
    /// unless its own subscription asked to echo. Returns whether the sender
    /// wants an ack reply.
    pub fn broadcast_from(
        &self,
        sender: &Conn,
        topic: &str,
        payload: Value,
    ) -> Result<bool, HubError> {
        let channel = self
            .channel(topic)
            .ok_or_else(|| HubError::NotJoined(topic.to_string()))?;
        let own = channel
            .subscription(sender.id)
            .ok_or_else(|| HubError::NotJoined(topic.to_string()))?;

        let message = crate::protocol::broadcast_message(topic, payload);
        for sub in channel.subscriber_snapshot() {
            if sub.conn_id == sender.id && !own.broadcast.echo_self {
                continue;
            }
            self.send_to(sub.conn_id, &message);
        }
        Ok(own.broadcast.ack)
    }

    /// Client `presence` event: `{event: "track"|"untrack", payload}`.
    pub fn handle_presence(
        &self,
        conn: &Conn,
        topic: &str,
        payload: &Value,
    ) -> Result<(), HubError> {
        let channel = self
            .channel(topic)
            .ok_or_else(|| HubError::NotJoined(topic.to_string()))?;
        let sub = channel
            .subscription(conn.id)
            .ok_or_else(|| HubError::NotJoined(topic.to_string()))?;
        // A subscriber without a presence key never appears in presence state.
        if sub.presence_key.is_empty() {
            return Ok(());
        }

        let event = payload
            .get("event")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_ascii_lowercase();
        let diff = match event.as_str() {
            "track" => {
                let meta = payload.get("payload").cloned().unwrap_or(json!({}));
                channel.presence_track(&sub.presence_key, conn.id, meta)
            }
            "untrack" => channel.presence_untrack(&sub.presence_key, conn.id),
            other => {
                return Err(HubError::BadPayload(format!(
                    "unknown presence event '{other}'"
                )))
            }
        };
        self.fanout_presence_diff(&channel, diff);
        Ok(())
    }

    /// Called by the REST write path after commit, in commit order. Walks
    /// every channel's subscribers and pushes one `postgres_changes` message
    /// per matching subscriber.
    pub fn notify_change(&self, change: &ChangeEvent) {
        let channels: Vec<Arc<Channel>> = self.channels.read().values().cloned().collect();
        let match_record = match change.op {
            ChangeOp::Delete => change.old.as_ref(),
            _ => change.new.as_ref(),
        };

        for channel in channels {
            for sub in channel.subscriber_snapshot() {
                let ids: Vec<i64> = sub
                    .pg_changes
                    .iter()
                    .filter(|pg| pg_change_matches(pg, change, match_record))
                    .map(|pg| pg.id)
                    .collect();
                if ids.is_empty() {
                    continue;
                }
                let data = json!({
                    "schema": change.schema,
                    "table": change.table,
                    "commit_timestamp": change.commit_timestamp.to_rfc3339(),
                    "eventType": change.op.as_str(),
                    "new": change.new.clone().unwrap_or(Value::Null),
                    "old": change.old.clone().unwrap_or(Value::Null),
                    "errors": Value::Null,
                });
                let message = postgres_changes_message(
                    &channel.topic,
                    sub.join_ref.clone(),
                    ids,
                    data,
                );
                self.send_to(sub.conn_id, &message);
            }
        }
    }

    /// Idempotent teardown: removes the connection from the registry, walks
    /// every channel removing membership, synthesizes presence leaves, and
    /// lets the send queue close with the last sender.
    pub fn disconnect(&self, conn_id: Uuid) {
        let Some(conn) = self.conns.write().remove(&conn_id) else {
            return;
        };
        if conn.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let channels: Vec<(String, Arc<Channel>)> = self
            .channels
            .read()
            .iter()
            .map(|(topic, channel)| (topic.clone(), channel.clone()))
            .collect();
        for (topic, channel) in channels {
            if !channel.is_member(conn_id) {
                continue;
            }
            let (diff, empty) = channel.unsubscribe(conn_id);
            self.fanout_presence_diff(&channel, diff);
            if empty {
                self.remove_channel_if_empty(&topic);
            }
        }
        debug!(conn = %conn_id, "connection torn down");
    }

    fn channel(&self, topic: &str) -> Option<Arc<Channel>> {
        self.channels.read().get(topic).cloned()
    }

    fn remove_channel_if_empty(&self, topic: &str) {
        let mut channels = self.channels.write();
        if let Some(channel) = channels.get(topic) {
            if channel.subscriber_count() == 0 {
                channels.remove(topic);
                debug!(topic = %topic, "channel removed");
            }
        }
    }

    fn fanout_presence_diff(&self, channel: &Channel, diff: PresenceDiff) {
        if diff.is_empty() {
            return;
        }
        let message = presence_diff_message(&channel.topic, diff.joins, diff.leaves);
        for sub in channel.subscriber_snapshot() {
            self.send_to(sub.conn_id, &message);
        }
    }

    fn send_to(&self, conn_id: Uuid, message: &PhoenixMessage) {
        if let Some(conn) = self.conns.read().get(&conn_id) {
            conn.send(message);
        }
    }
}

fn pg_change_matches(
    sub: &PgChangeSub,
    change: &ChangeEvent,
    record: Option<&Value>,
) -> bool {
    let req = &sub.request;
    if req.event != "*" && req.event != change.op.as_str() {
        return false;
    }
    if req.schema != "*" && req.schema != change.schema {
        return false;
    }
    if req.table != "*" && req.table != change.table {
        return false;
    }
    match &sub.filter {
        None => true,
        Some(filter) => record.is_some_and(|r| filter.matches(r)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sblite_db::rest::ChangeOp;

    fn join_payload(config: Value) -> JoinPayload {
        serde_json::from_value(json!({ "config": config })).unwrap()
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<PhoenixMessage> {
        let mut out = Vec::new();
        while let Ok(text) = rx.try_recv() {
            out.push(PhoenixMessage::decode(&text).unwrap());
        }
        out
    }

    fn insert_event(table: &str, new: Value) -> ChangeEvent {
        ChangeEvent {
            schema: "public".into(),
            table: table.into(),
            op: ChangeOp::Insert,
            old: None,
            new: Some(new),
            commit_timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn broadcast_excludes_sender_unless_echo_requested() {
        let hub = Hub::new();
        let (c1, mut rx1) = hub.register(AuthContext::anon());
        let (c2, mut rx2) = hub.register(AuthContext::anon());

        let payload = join_payload(json!({"broadcast": {"self": false}}));
        hub.join(&c1, "realtime:room:1", Some("1".into()), &payload)
            .unwrap();
        hub.join(&c2, "realtime:room:1", Some("1".into()), &payload)
            .unwrap();

        let body = json!({"type": "broadcast", "event": "msg", "payload": {"x": 1}});
        let ack = hub
            .broadcast_from(&c1, "realtime:room:1", body.clone())
            .unwrap();
        assert!(!ack);

        let got = drain(&mut rx2);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].event, "broadcast");
        assert_eq!(got[0].payload, body);
        assert!(drain(&mut rx1).is_empty());
    }

    #[tokio::test]
    async fn echo_self_delivers_back_to_the_sender() {
        let hub = Hub::new();
        let (c1, mut rx1) = hub.register(AuthContext::anon());
        let payload = join_payload(json!({"broadcast": {"self": true, "ack": true}}));
        hub.join(&c1, "realtime:room:1", None, &payload).unwrap();

        let ack = hub
            .broadcast_from(&c1, "realtime:room:1", json!({"event": "e"}))
            .unwrap();
        assert!(ack);
        assert_eq!(drain(&mut rx1).len(), 1);
    }

    #[tokio::test]
    async fn postgres_changes_respect_filters() {
        let hub = Hub::new();
        let (c1, mut rx1) = hub.register(AuthContext::anon());
        let payload = join_payload(json!({
            "postgres_changes": [
                {"event": "INSERT", "schema": "public", "table": "t", "filter": "name=eq.filtered"}
            ]
        }));
        hub.join(&c1, "realtime:t", Some("1".into()), &payload)
            .unwrap();

        hub.notify_change(&insert_event("t", json!({"name": "other"})));
        hub.notify_change(&insert_event("t", json!({"name": "filtered"})));

        let got = drain(&mut rx1);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].event, "postgres_changes");
        assert_eq!(got[0].payload["data"]["new"]["name"], "filtered");
        assert_eq!(got[0].payload["data"]["eventType"], "INSERT");
        assert_eq!(got[0].payload["ids"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn wildcard_subscriptions_match_everything() {
        let hub = Hub::new();
        let (c1, mut rx1) = hub.register(AuthContext::anon());
        let payload = join_payload(json!({
            "postgres_changes": [{"event": "*", "schema": "*", "table": "*"}]
        }));
        hub.join(&c1, "realtime:all", None, &payload).unwrap();

        hub.notify_change(&insert_event("anything", json!({"k": 1})));
        assert_eq!(drain(&mut rx1).len(), 1);
    }

    #[tokio::test]
    async fn empty_channels_are_removed_from_the_hub() {
        let hub = Hub::new();
        let (c1, _rx1) = hub.register(AuthContext::anon());
        let (c2, _rx2) = hub.register(AuthContext::anon());
        let payload = join_payload(json!({}));
        hub.join(&c1, "realtime:room", None, &payload).unwrap();
        hub.join(&c2, "realtime:room", None, &payload).unwrap();
        assert!(hub.has_channel("realtime:room"));

        hub.leave(c1.id, "realtime:room");
        assert!(hub.has_channel("realtime:room"));
        hub.leave(c2.id, "realtime:room");
        assert!(!hub.has_channel("realtime:room"));
        assert_eq!(hub.channel_count(), 0);
    }

    #[tokio::test]
    async fn disconnect_synthesizes_presence_leaves_for_survivors() {
        let hub = Hub::new();
        let (c1, mut rx1) = hub.register(AuthContext::anon());
        let (c2, _rx2) = hub.register(AuthContext::anon());
        let payload = join_payload(json!({"presence": {"key": "k2"}}));
        hub.join(&c1, "realtime:room", None, &join_payload(json!({})))
            .unwrap();
        hub.join(&c2, "realtime:room", None, &payload).unwrap();

        hub.handle_presence(
            &c2,
            "realtime:room",
            &json!({"event": "track", "payload": {"s": 1}}),
        )
        .unwrap();
        let _ = drain(&mut rx1);

        hub.disconnect(c2.id);
        let got = drain(&mut rx1);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].event, "presence_diff");
        assert!(got[0].payload["leaves"]["k2"].is_object());

        // Idempotent teardown.
        hub.disconnect(c2.id);
        assert!(drain(&mut rx1).is_empty());
    }

    #[tokio::test]
    async fn empty_presence_key_subscribers_never_track() {
        let hub = Hub::new();
        let (c1, _rx1) = hub.register(AuthContext::anon());
        hub.join(&c1, "realtime:room", None, &join_payload(json!({})))
            .unwrap();
        hub.handle_presence(
            &c1,
            "realtime:room",
            &json!({"event": "track", "payload": {}}),
        )
        .unwrap();
        let channel_state = hub.join(&c1, "realtime:room", None, &join_payload(json!({})));
        assert!(channel_state.unwrap().presence_state.is_empty());
    }

    #[tokio::test]
    async fn private_channels_require_a_jwt() {
        let hub = Hub::new();
        let (c1, _rx1) = hub.register(AuthContext::anon());
        let err = hub
            .join(
                &c1,
                "realtime:secret",
                None,
                &join_payload(json!({"private": true})),
            )
            .unwrap_err();
        assert_eq!(err, HubError::Unauthorized);

        let mut ctx = AuthContext::anon();
        ctx.user_id = Some("u".into());
        let (c2, _rx2) = hub.register(ctx);
        assert!(hub
            .join(
                &c2,
                "realtime:secret",
                None,
                &join_payload(json!({"private": true})),
            )
            .is_ok());
    }

    #[tokio::test]
    async fn join_assigns_sequential_subscription_ids() {
        let hub = Hub::new();
        let (c1, _rx1) = hub.register(AuthContext::anon());
        let payload = join_payload(json!({
            "postgres_changes": [
                {"event": "INSERT", "table": "a"},
                {"event": "UPDATE", "table": "b"}
            ]
        }));
        let ack = hub.join(&c1, "realtime:x", None, &payload).unwrap();
        assert_eq!(ack.subscriptions.len(), 2);
        assert!(ack.subscriptions[0].0 < ack.subscriptions[1].0);
    }

    #[tokio::test]
    async fn delete_events_match_against_the_old_record() {
        let hub = Hub::new();
        let (c1, mut rx1) = hub.register(AuthContext::anon());
        let payload = join_payload(json!({
            "postgres_changes": [
                {"event": "DELETE", "schema": "public", "table": "t", "filter": "id=eq.7"}
            ]
        }));
        hub.join(&c1, "realtime:t", None, &payload).unwrap();

        hub.notify_change(&ChangeEvent {
            schema: "public".into(),
            table: "t".into(),
            op: ChangeOp::Delete,
            old: Some(json!({"id": 7})),
            new: None,
            commit_timestamp: Utc::now(),
        });
        hub.notify_change(&ChangeEvent {
            schema: "public".into(),
            table: "t".into(),
            op: ChangeOp::Delete,
            old: Some(json!({"id": 8})),
            new: None,
            commit_timestamp: Utc::now(),
        });
        assert_eq!(drain(&mut rx1).len(), 1);
    }
}
