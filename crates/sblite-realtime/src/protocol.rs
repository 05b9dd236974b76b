//! Phoenix Channels v1.0.0 wire format.
//!
//! Every frame is `{event, topic, payload, ref, join_ref?}`. The `phx_*`
//! event names must match the client libraries byte-for-byte. Client events
//! are a closed enum; an unknown tag is a single explicit variant the hub
//! logs and drops.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Topic reserved for heartbeat frames.
pub const PHOENIX_TOPIC: &str = "phoenix";

/// One wire frame, both directions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhoenixMessage {
    pub event: String,
    pub topic: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

impl PhoenixMessage {
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn decode(text: &str) -> Result<PhoenixMessage, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Events a client may send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Join,
    Leave,
    Heartbeat,
    Broadcast,
    Presence,
    AccessToken,
    Unknown(String),
}

impl ClientEvent {
    pub fn parse(event: &str) -> ClientEvent {
        match event {
            "phx_join" => ClientEvent::Join,
            "phx_leave" => ClientEvent::Leave,
            "heartbeat" => ClientEvent::Heartbeat,
            "broadcast" => ClientEvent::Broadcast,
            "presence" => ClientEvent::Presence,
            "access_token" => ClientEvent::AccessToken,
            other => ClientEvent::Unknown(other.to_string()),
        }
    }
}

/// `phx_join` payload: channel configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JoinPayload {
    #[serde(default)]
    pub config: JoinConfig,
    #[serde(default)]
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JoinConfig {
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub postgres_changes: Vec<PgChangeRequest>,
    #[serde(default)]
    pub private: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BroadcastConfig {
    #[serde(default)]
    pub ack: bool,
    #[serde(rename = "self", default)]
    pub echo_self: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PresenceConfig {
    #[serde(default)]
    pub key: String,
}

/// One requested postgres-changes subscription. `*` wildcards are kept as
/// strings and matched by the hub.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PgChangeRequest {
    #[serde(default = "wildcard")]
    pub event: String,
    #[serde(default = "public_schema")]
    pub schema: String,
    #[serde(default = "wildcard")]
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

fn wildcard() -> String {
    "*".to_string()
}

fn public_schema() -> String {
    "public".to_string()
}

pub fn phx_reply(
    topic: &str,
    reference: Option<String>,
    join_ref: Option<String>,
    status: &str,
    response: Value,
) -> PhoenixMessage {
    PhoenixMessage {
        event: "phx_reply".to_string(),
        topic: topic.to_string(),
        payload: json!({ "status": status, "response": response }),
        reference,
        join_ref,
    }
}

pub fn phx_close(topic: &str, join_ref: Option<String>) -> PhoenixMessage {
    PhoenixMessage {
        event: "phx_close".to_string(),
        topic: topic.to_string(),
        payload: json!({}),
        reference: None,
        join_ref,
    }
}

/// Per-subscription confirmation sent after a successful join.
pub fn system_message(topic: &str, join_ref: Option<String>, status: &str, message: &str) -> PhoenixMessage {
    PhoenixMessage {
        event: "system".to_string(),
        topic: topic.to_string(),
        payload: json!({
            "status": status,
            "extension": "postgres_changes",
            "message": message,
            "channel": topic.trim_start_matches("realtime:"),
        }),
        reference: None,
        join_ref,
    }
}

pub fn broadcast_message(topic: &str, payload: Value) -> PhoenixMessage {
    PhoenixMessage {
        event: "broadcast".to_string(),
        topic: topic.to_string(),
        payload,
        reference: None,
        join_ref: None,
    }
}

pub fn presence_state_message(topic: &str, state: Map<String, Value>) -> PhoenixMessage {
    PhoenixMessage {
        event: "presence_state".to_string(),
        topic: topic.to_string(),
        payload: Value::Object(state),
        reference: None,
        join_ref: None,
    }
}

pub fn presence_diff_message(
    topic: &str,
    joins: Map<String, Value>,
    leaves: Map<String, Value>,
) -> PhoenixMessage {
    PhoenixMessage {
        event: "presence_diff".to_string(),
        topic: topic.to_string(),
        payload: json!({ "joins": joins, "leaves": leaves }),
        reference: None,
        join_ref: None,
    }
}

pub fn postgres_changes_message(
    topic: &str,
    join_ref: Option<String>,
    ids: Vec<i64>,
    data: Value,
) -> PhoenixMessage {
    PhoenixMessage {
        event: "postgres_changes".to_string(),
        topic: topic.to_string(),
        payload: json!({ "ids": ids, "data": data }),
        reference: None,
        join_ref,
    }
}
