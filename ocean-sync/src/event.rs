//! Live events: changes delivered between resyncs.
//!
//! Webhooks and queue messages share one JSON envelope:
//!
//! ```json
//! {"action": "changed", "kind": "issue", "id": 42}
//! {"action": "upsert",  "kind": "issue", "object": {...}}
//! {"action": "delete",  "kind": "issue", "object": {...}}
//! {"action": "remove",  "blueprint": "service", "identifier": "api"}
//! {"action": "resync"}
//! ```
//!
//! A payload may also be an array of envelopes.

use crate::error::{SyncError, SyncResult};
use ocean_types::{EntityKey, RunId};
use serde::Deserialize;
use serde_json::Value;

/// A change to apply outside a resync.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    /// Something about the object changed; refetch it. If it is gone, its
    /// entities are deleted.
    Changed { kind: String, id: String },
    /// The full current object, upserted without a refetch.
    Upserted { kind: String, object: Value },
    /// The object was deleted upstream; entities mapped from it are removed.
    Deleted { kind: String, object: Value },
    /// Remove one entity directly.
    Remove { key: EntityKey },
    /// Too much changed at once; resync everything.
    Resync,
}

impl LiveEvent {
    pub fn kind(&self) -> Option<&str> {
        match self {
            Self::Changed { kind, .. } | Self::Upserted { kind, .. } | Self::Deleted { kind, .. } => {
                Some(kind.as_str())
            }
            Self::Remove { .. } | Self::Resync => None,
        }
    }

    /// Parses a payload holding one envelope or an array of them.
    pub fn parse_payload(body: &[u8]) -> SyncResult<Vec<LiveEvent>> {
        let value: Value =
            serde_json::from_slice(body).map_err(|e| SyncError::InvalidEvent(e.to_string()))?;
        match value {
            Value::Array(items) => items.into_iter().map(Self::from_value).collect(),
            other => Ok(vec![Self::from_value(other)?]),
        }
    }

    pub fn from_value(value: Value) -> SyncResult<LiveEvent> {
        let envelope: Envelope =
            serde_json::from_value(value).map_err(|e| SyncError::InvalidEvent(e.to_string()))?;
        envelope.try_into()
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
enum Envelope {
    #[serde(alias = "change", alias = "updated")]
    Changed { kind: String, id: Value },
    #[serde(alias = "upserted", alias = "created")]
    Upsert { kind: String, object: Value },
    #[serde(alias = "deleted")]
    Delete { kind: String, object: Value },
    Remove { blueprint: String, identifier: Value },
    Resync,
}

impl TryFrom<Envelope> for LiveEvent {
    type Error = SyncError;

    fn try_from(envelope: Envelope) -> SyncResult<Self> {
        Ok(match envelope {
            Envelope::Changed { kind, id } => LiveEvent::Changed {
                kind: non_empty("kind", kind)?,
                id: identifier("id", id)?,
            },
            Envelope::Upsert { kind, object } => LiveEvent::Upserted {
                kind: non_empty("kind", kind)?,
                object: object_value(object)?,
            },
            Envelope::Delete { kind, object } => LiveEvent::Deleted {
                kind: non_empty("kind", kind)?,
                object: object_value(object)?,
            },
            Envelope::Remove {
                blueprint,
                identifier: id,
            } => LiveEvent::Remove {
                key: EntityKey::new(non_empty("blueprint", blueprint)?, identifier("identifier", id)?),
            },
            Envelope::Resync => LiveEvent::Resync,
        })
    }
}

fn non_empty(field: &str, value: String) -> SyncResult<String> {
    if value.trim().is_empty() {
        Err(SyncError::InvalidEvent(format!("'{field}' must not be empty")))
    } else {
        Ok(value)
    }
}

fn identifier(field: &str, value: Value) -> SyncResult<String> {
    match value {
        Value::String(s) => non_empty(field, s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(SyncError::InvalidEvent(format!(
            "'{field}' must be a string or a number, got {other}"
        ))),
    }
}

fn object_value(value: Value) -> SyncResult<Value> {
    if value.is_object() {
        Ok(value)
    } else {
        Err(SyncError::InvalidEvent(format!("'object' must be an object, got {value}")))
    }
}

/// What handling one live event did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventOutcome {
    pub upserted: usize,
    pub deleted: usize,
    /// Objects that failed to map, plus writes the catalog refused for good.
    pub failures: usize,
    /// Set when the event triggered a resync.
    pub resync: Option<RunId>,
}
