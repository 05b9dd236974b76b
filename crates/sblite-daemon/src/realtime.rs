//! WebSocket driver for the realtime hub: upgrade, read/write task pair,
//! heartbeats, and per-frame dispatch into the hub.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use sblite_realtime::{
    protocol::{phx_close, phx_reply, system_message, presence_state_message},
    ClientEvent, Conn, JoinPayload, PhoenixMessage, PHOENIX_TOPIC,
};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::auth::extract_context;
use crate::server::{ApiError, AppState};

/// Write-loop ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(25);
/// Read-loop idle budget; a silent client is dropped after this.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
/// Close code sent when the idle budget is exhausted.
const CLOSE_IDLE: u16 = 4002;

pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let ctx = match extract_context(&state.keys, &headers, params.get("apikey").map(String::as_str))
    {
        Ok(ctx) => ctx,
        Err(err) => return ApiError::from(err).into_response(),
    };
    ws.on_upgrade(move |socket| drive_socket(socket, state, ctx))
}

/// Two cooperative tasks per connection: this function runs the read loop;
/// the spawned task drains the bounded send queue and emits pings.
async fn drive_socket(socket: WebSocket, state: Arc<AppState>, ctx: sblite_db::AuthContext) {
    let (mut sink, mut stream) = socket.split();
    let (conn, mut outbox) = state.hub.register(ctx);
    let conn_id = conn.id;

    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await; // the first tick fires immediately
        loop {
            tokio::select! {
                queued = outbox.recv() => match queued {
                    Some(text) => {
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = ping.tick() => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_IDLE,
                reason: "connection closed".into(),
            })))
            .await;
    });

    loop {
        match tokio::time::timeout(IDLE_TIMEOUT, stream.next()).await {
            Err(_) => {
                debug!(conn = %conn_id, "idle timeout; dropping connection");
                break;
            }
            Ok(None) | Ok(Some(Err(_))) => break,
            Ok(Some(Ok(Message::Close(_)))) => break,
            Ok(Some(Ok(Message::Text(text)))) => handle_frame(&state, &conn, &text),
            // Pings and pongs only count as liveness.
            Ok(Some(Ok(_))) => {}
        }
    }

    state.hub.disconnect(conn_id);
    writer.abort();
}

/// Dispatches one decoded frame. All hub calls are synchronous and replies go
/// through the connection's send queue, preserving per-connection ordering.
fn handle_frame(state: &Arc<AppState>, conn: &Arc<Conn>, text: &str) {
    let message = match PhoenixMessage::decode(text) {
        Ok(message) => message,
        Err(err) => {
            debug!(conn = %conn.id, error = %err, "undecodable frame dropped");
            return;
        }
    };
    let topic = message.topic.clone();
    let reference = message.reference.clone();
    let join_ref = message.join_ref.clone();

    match ClientEvent::parse(&message.event) {
        ClientEvent::Heartbeat => {
            conn.send(&phx_reply(
                PHOENIX_TOPIC,
                reference,
                None,
                "ok",
                json!({}),
            ));
        }
        ClientEvent::Join => {
            let payload: JoinPayload = match serde_json::from_value(message.payload) {
                Ok(payload) => payload,
                Err(err) => {
                    conn.send(&phx_reply(
                        &topic,
                        reference,
                        join_ref,
                        "error",
                        json!({"reason": format!("invalid join payload: {err}")}),
                    ));
                    return;
                }
            };
            match state.hub.join(conn, &topic, join_ref.clone(), &payload) {
                Ok(ack) => {
                    let descriptors: Vec<Value> = ack
                        .subscriptions
                        .iter()
                        .map(|(id, request)| {
                            let mut value = serde_json::to_value(request)
                                .unwrap_or_else(|_| json!({}));
                            value["id"] = json!(id);
                            value
                        })
                        .collect();
                    conn.send(&phx_reply(
                        &topic,
                        reference,
                        join_ref.clone(),
                        "ok",
                        json!({ "postgres_changes": descriptors }),
                    ));
                    for _ in &ack.subscriptions {
                        conn.send(&system_message(
                            &topic,
                            join_ref.clone(),
                            "ok",
                            "Subscribed to PostgreSQL",
                        ));
                    }
                    conn.send(&presence_state_message(&topic, ack.presence_state));
                }
                Err(err) => {
                    conn.send(&phx_reply(
                        &topic,
                        reference,
                        join_ref,
                        "error",
                        json!({"reason": err.to_string()}),
                    ));
                }
            }
        }
        ClientEvent::Leave => {
            state.hub.leave(conn.id, &topic);
            conn.send(&phx_reply(&topic, reference, join_ref.clone(), "ok", json!({})));
            conn.send(&phx_close(&topic, join_ref));
        }
        ClientEvent::Broadcast => match state.hub.broadcast_from(conn, &topic, message.payload) {
            Ok(true) => {
                conn.send(&phx_reply(&topic, reference, join_ref, "ok", json!({})));
            }
            Ok(false) => {}
            Err(err) => {
                conn.send(&phx_reply(
                    &topic,
                    reference,
                    join_ref,
                    "error",
                    json!({"reason": err.to_string()}),
                ));
            }
        },
        ClientEvent::Presence => {
            match state.hub.handle_presence(conn, &topic, &message.payload) {
                Ok(()) => {
                    conn.send(&phx_reply(&topic, reference, join_ref, "ok", json!({})));
                }
                Err(err) => {
                    conn.send(&phx_reply(
                        &topic,
                        reference,
                        join_ref,
                        "error",
                        json!({"reason": err.to_string()}),
                    ));
                }
            }
        }
        ClientEvent::AccessToken => {
            let token = message
                .payload
                .get("access_token")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let mut ctx = conn.auth_context();
            match state.keys.jwt.overlay_bearer(&mut ctx, token) {
                Ok(()) => {
                    conn.update_auth(ctx);
                    conn.send(&phx_reply(&topic, reference, join_ref, "ok", json!({})));
                }
                Err(err) => {
                    conn.send(&phx_reply(
                        &topic,
                        reference,
                        join_ref,
                        "error",
                        json!({"code": 4001, "message": err.to_string()}),
                    ));
                }
            }
        }
        ClientEvent::Unknown(event) => {
            warn!(conn = %conn.id, event = %event, "unknown client event dropped");
        }
    }
}
