//! Progress and terminal events pushed to the real-time fan-out

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Started,
    StageCompleted,
    Completed,
    Failed,
    Cancelled,
}

/// Broadcast event: `{type, runId, ...payload, timestamp}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub run_id: Uuid,
    #[serde(flatten)]
    pub payload: serde_json::Map<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl PipelineEvent {
    /// Builds an event; a non-object payload is stored under `data`
    pub fn new(kind: EventKind, run_id: Uuid, payload: serde_json::Value) -> Self {
        let payload = match payload {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("data".to_string(), other);
                map
            }
        };

        Self {
            kind,
            run_id,
            payload,
            timestamp: Utc::now(),
        }
    }
}
