//! Per-channel presence state with diff-based gossip.
//!
//! State maps a presence key to the metas advertised under it. A connection
//! holds at most one meta per key; re-tracking replaces it. Diffs are emitted
//! individually per track/untrack, never coalesced.

use serde_json::{json, Map, Value};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct PresenceMeta {
    pub conn_id: Uuid,
    pub phx_ref: String,
    pub payload: Value,
}

impl PresenceMeta {
    fn to_json(&self) -> Value {
        let mut obj = match &self.payload {
            Value::Object(map) => map.clone(),
            other => {
                let mut map = Map::new();
                if !other.is_null() {
                    map.insert("payload".to_string(), other.clone());
                }
                map
            }
        };
        obj.insert("phx_ref".to_string(), Value::String(self.phx_ref.clone()));
        Value::Object(obj)
    }
}

/// Presence entries for one channel.
#[derive(Debug, Default)]
pub struct PresenceState {
    entries: Vec<(String, Vec<PresenceMeta>)>,
}

/// A single join or leave delta, already shaped for `presence_diff`.
#[derive(Debug, Default, PartialEq)]
pub struct PresenceDiff {
    pub joins: Map<String, Value>,
    pub leaves: Map<String, Value>,
}

impl PresenceDiff {
    pub fn is_empty(&self) -> bool {
        self.joins.is_empty() && self.leaves.is_empty()
    }
}

impl PresenceState {
    /// Records (key, conn, payload) with a fresh ref. Re-tracking the same
    /// (key, conn) replaces the meta: the old one leaves, the new one joins.
    pub fn track(&mut self, key: &str, conn_id: Uuid, payload: Value) -> PresenceDiff {
        let mut diff = PresenceDiff::default();
        let meta = PresenceMeta {
            conn_id,
            phx_ref: Uuid::new_v4().to_string(),
            payload,
        };

        let slot = self.entries.iter_mut().find(|(k, _)| k == key);
        match slot {
            Some((_, metas)) => {
                if let Some(pos) = metas.iter().position(|m| m.conn_id == conn_id) {
                    let old = metas.remove(pos);
                    diff.leaves
                        .insert(key.to_string(), metas_json(std::slice::from_ref(&old)));
                }
                metas.push(meta.clone());
            }
            None => {
                self.entries.push((key.to_string(), vec![meta.clone()]));
            }
        }
        diff.joins
            .insert(key.to_string(), metas_json(std::slice::from_ref(&meta)));
        diff
    }

    /// Removes the connection's meta under `key`, if any.
    pub fn untrack(&mut self, key: &str, conn_id: Uuid) -> PresenceDiff {
        let mut diff = PresenceDiff::default();
        if let Some(pos) = self.entries.iter().position(|(k, _)| k == key) {
            let (_, metas) = &mut self.entries[pos];
            if let Some(meta_pos) = metas.iter().position(|m| m.conn_id == conn_id) {
                let old = metas.remove(meta_pos);
                diff.leaves
                    .insert(key.to_string(), metas_json(std::slice::from_ref(&old)));
                if metas.is_empty() {
                    self.entries.remove(pos);
                }
            }
        }
        diff
    }

    /// Synthesizes leaves for every presence the connection held. Called from
    /// connection teardown.
    pub fn untrack_all(&mut self, conn_id: Uuid) -> PresenceDiff {
        let mut diff = PresenceDiff::default();
        self.entries.retain_mut(|(key, metas)| {
            if let Some(pos) = metas.iter().position(|m| m.conn_id == conn_id) {
                let old = metas.remove(pos);
                diff.leaves
                    .insert(key.clone(), metas_json(std::slice::from_ref(&old)));
            }
            !metas.is_empty()
        });
        diff
    }

    /// Full state snapshot in the `presence_state` wire shape.
    pub fn snapshot(&self) -> Map<String, Value> {
        let mut out = Map::new();
        for (key, metas) in &self.entries {
            out.insert(key.clone(), metas_json(metas));
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn metas_json(metas: &[PresenceMeta]) -> Value {
    json!({ "metas": metas.iter().map(PresenceMeta::to_json).collect::<Vec<_>>() })
}
