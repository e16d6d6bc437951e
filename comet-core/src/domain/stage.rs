//! Stage run domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::domain::pipeline::{StageDefinition, StageKind};

/// Recorded execution of one stage within one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRun {
    pub id: Uuid,
    pub run_id: Uuid,
    pub name: String,
    pub kind: StageKind,
    pub status: StageStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub logs: String,
    pub artifacts: Vec<String>,
    pub metadata: serde_json::Value,
}

impl StageRun {
    /// Creates a RUNNING stage run for the given stage
    pub fn started(run_id: Uuid, stage: &StageDefinition) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            name: stage.name.clone(),
            kind: stage.kind,
            status: StageStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            duration_seconds: None,
            logs: String::new(),
            artifacts: Vec::new(),
            metadata: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn finish(&mut self, status: StageStatus, at: DateTime<Utc>) {
        self.status = status;
        self.finished_at = Some(at);
        self.duration_seconds = Some((at - self.started_at).num_seconds());
    }
}

/// Stage run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Running,
    Success,
    Failed,
    Cancelled,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Running => "RUNNING",
            StageStatus::Success => "SUCCESS",
            StageStatus::Failed => "FAILED",
            StageStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(StageStatus::Running),
            "SUCCESS" => Ok(StageStatus::Success),
            "FAILED" => Ok(StageStatus::Failed),
            "CANCELLED" => Ok(StageStatus::Cancelled),
            other => Err(format!("unknown stage status '{}'", other)),
        }
    }
}
