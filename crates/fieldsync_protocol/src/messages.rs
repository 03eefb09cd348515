//! Push, pull and resolve message bodies.
//!
//! Bodies are plain JSON. Decoding is tolerant: unknown fields are ignored,
//! unknown strategy names are dropped, and conflict snapshots may arrive as
//! either an object or a JSON-encoded string.

use crate::error::{ProtocolError, ProtocolResult};
use fieldsync_core::{EntityType, ResolutionStrategy};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// Marker the server puts in every successful push message.
pub const SUCCESS_MARKER: &str = "successfully";

fn as_object<'a>(body: &'a Value) -> ProtocolResult<&'a Map<String, Value>> {
    body.as_object()
        .ok_or_else(|| ProtocolError::InvalidBody(format!("expected object, got {body}")))
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Acknowledgement of a successful push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushAck {
    /// Human-readable server message.
    pub message: String,
    /// Server-assigned id, when the server issued one.
    pub server_id: Option<String>,
}

impl PushAck {
    /// Creates an acknowledgement.
    pub fn new(message: impl Into<String>, server_id: Option<String>) -> Self {
        Self {
            message: message.into(),
            server_id,
        }
    }

    /// Decodes a push response body for `entity_type`.
    ///
    /// The server id is read from `server_<entity>_id`.
    pub fn from_body(entity_type: EntityType, body: &Value) -> ProtocolResult<Self> {
        let map = as_object(body)?;
        let message = match map.get("message") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        let server_id = map.get(&entity_type.server_id_key()).and_then(id_string);
        Ok(Self { message, server_id })
    }

    /// Encodes the acknowledgement as a response body.
    pub fn to_body(&self, entity_type: EntityType) -> Value {
        let mut map = Map::new();
        map.insert("message".into(), Value::String(self.message.clone()));
        if let Some(id) = &self.server_id {
            map.insert(entity_type.server_id_key(), Value::String(id.clone()));
        }
        Value::Object(map)
    }

    /// Returns true when the message carries the success marker.
    pub fn is_success(&self) -> bool {
        self.message.to_lowercase().contains(SUCCESS_MARKER)
    }

    /// Returns the server id when it differs from `local_id`.
    pub fn remap_for(&self, local_id: &str) -> Option<&str> {
        self.server_id.as_deref().filter(|id| *id != local_id)
    }
}

/// Body of a conflict (409) response.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictBody {
    /// Field the server flagged.
    pub conflict_field: String,
    /// Server's current version of the entity.
    pub latest_data: Value,
    /// Strategies the server accepts.
    pub allowed_strategies: Vec<ResolutionStrategy>,
    /// Optional server message.
    pub message: Option<String>,
}

impl ConflictBody {
    /// Decodes a conflict body.
    ///
    /// The conflict fields may sit at the top level or be wrapped in a
    /// `detail` or `error` object.
    pub fn from_body(body: &Value) -> ProtocolResult<Self> {
        let outer = as_object(body)?;
        let map = if outer.contains_key("conflict_field") {
            outer
        } else {
            ["detail", "error"]
                .iter()
                .find_map(|key| outer.get(*key).and_then(Value::as_object))
                .filter(|inner| inner.contains_key("conflict_field"))
                .ok_or(ProtocolError::MissingField("conflict_field"))?
        };

        let conflict_field = match map.get("conflict_field") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => {
                return Err(ProtocolError::InvalidField {
                    field: "conflict_field".into(),
                    reason: format!("expected string, got {other}"),
                })
            }
            None => return Err(ProtocolError::MissingField("conflict_field")),
        };

        let latest_data = match map.get("latest_data") {
            Some(Value::String(text)) => {
                serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.clone()))
            }
            Some(value) => value.clone(),
            None => Value::Null,
        };

        let allowed_strategies = match map.get("allowed_strategies") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .filter_map(|name| name.parse::<ResolutionStrategy>().ok())
                .collect(),
            _ => Vec::new(),
        };

        let message = map
            .get("message")
            .or_else(|| outer.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(Self {
            conflict_field,
            latest_data,
            allowed_strategies,
            message,
        })
    }

    /// Encodes the conflict as a response body.
    pub fn to_body(&self) -> Value {
        let strategies: Vec<&str> = self
            .allowed_strategies
            .iter()
            .map(ResolutionStrategy::as_str)
            .collect();
        let mut body = json!({
            "conflict_field": self.conflict_field,
            "latest_data": self.latest_data,
            "allowed_strategies": strategies,
        });
        if let (Some(message), Some(map)) = (&self.message, body.as_object_mut()) {
            map.insert("message".into(), Value::String(message.clone()));
        }
        body
    }

    /// Returns `latest_data` as JSON text for durable storage.
    pub fn latest_data_text(&self) -> String {
        match &self.latest_data {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }
}

/// Response of the bulk pull endpoint: one array per collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PullBatch {
    collections: BTreeMap<String, Vec<Value>>,
}

impl PullBatch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes a bulk pull body keyed by table name.
    ///
    /// Unknown collections are ignored; a known collection that is not an
    /// array is an error.
    pub fn from_body(body: &Value) -> ProtocolResult<Self> {
        let map = as_object(body)?;
        let mut batch = Self::new();
        for entity_type in EntityType::ALL {
            match map.get(entity_type.table()) {
                Some(Value::Array(rows)) => batch.insert(entity_type, rows.clone()),
                Some(Value::Null) | None => {}
                Some(other) => {
                    return Err(ProtocolError::InvalidField {
                        field: entity_type.table().to_string(),
                        reason: format!("expected array, got {other}"),
                    })
                }
            }
        }
        Ok(batch)
    }

    /// Decodes a single-collection pull body: either a bare array or an
    /// object holding the collection under its table name.
    pub fn collection_from_body(entity_type: EntityType, body: &Value) -> ProtocolResult<Vec<Value>> {
        match body {
            Value::Array(rows) => Ok(rows.clone()),
            Value::Object(_) => Ok(Self::from_body(body)?.take(entity_type)),
            other => Err(ProtocolError::InvalidBody(format!(
                "expected array or object, got {other}"
            ))),
        }
    }

    /// Sets the rows of one collection.
    pub fn insert(&mut self, entity_type: EntityType, rows: Vec<Value>) {
        self.collections.insert(entity_type.table().to_string(), rows);
    }

    /// Returns the rows of one collection.
    pub fn rows(&self, entity_type: EntityType) -> &[Value] {
        self.collections
            .get(entity_type.table())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Removes and returns the rows of one collection.
    pub fn take(&mut self, entity_type: EntityType) -> Vec<Value> {
        self.collections.remove(entity_type.table()).unwrap_or_default()
    }

    /// Total number of rows across collections.
    pub fn len(&self) -> usize {
        self.collections.values().map(Vec::len).sum()
    }

    /// Returns true when no collection holds rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Conflict resolution submitted to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolveRequest {
    /// Outbox entry being resolved.
    pub sync_id: String,
    /// Entity type of the conflicted row.
    pub entity_type: EntityType,
    /// Id of the conflicted row.
    pub entity_id: String,
    /// Chosen strategy.
    pub strategy: ResolutionStrategy,
    /// The data the client wants persisted: the local row for
    /// `client_wins`, the edited payload for `merge`/`update_data`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Server reply to a [`ResolveRequest`].
#[derive(Debug, Clone, PartialEq)]
pub enum ResolveReply {
    /// The resolution was applied. `data` is the server's final version
    /// of the row when it returns one.
    Resolved {
        /// Final row.
        data: Option<Value>,
    },
    /// Someone else resolved the conflict first.
    AlreadyResolved {
        /// Server message.
        message: String,
    },
}

impl ResolveReply {
    /// Decodes a resolve response body.
    pub fn from_body(status: u16, body: &Value) -> ProtocolResult<Self> {
        let map = as_object(body)?;
        let message = map
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let flagged = map.get("status").and_then(Value::as_str) == Some("already_resolved")
            || map.get("already_resolved").and_then(Value::as_bool) == Some(true);
        if flagged || status == crate::endpoint::GONE_STATUS {
            return Ok(ResolveReply::AlreadyResolved { message });
        }
        let data = map.get("data").filter(|d| d.is_object()).cloned();
        Ok(ResolveReply::Resolved { data })
    }

    /// Encodes the reply as a response body.
    pub fn to_body(&self) -> Value {
        match self {
            ResolveReply::Resolved { data } => {
                json!({"status": "resolved", "message": "Conflict resolved successfully", "data": data})
            }
            ResolveReply::AlreadyResolved { message } => {
                json!({"status": "already_resolved", "message": message})
            }
        }
    }
}
