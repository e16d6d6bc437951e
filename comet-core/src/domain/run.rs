//! Pipeline run domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// One execution attempt of a pipeline
///
/// Created PENDING by whoever enqueues the run; mutated only by the
/// orchestrator from RUNNING onward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub triggered_by: Option<String>,
    /// Error text recorded when the run fails outside a stage
    pub logs: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl PipelineRun {
    /// Creates a new PENDING run
    pub fn pending(id: Uuid, pipeline_id: Uuid, triggered_by: Option<String>) -> Self {
        Self {
            id,
            pipeline_id,
            status: RunStatus::Pending,
            started_at: None,
            finished_at: None,
            duration_seconds: None,
            triggered_by,
            logs: None,
            metadata: serde_json::Value::Object(Default::default()),
            created_at: Utc::now(),
        }
    }

    /// Moves the run to a terminal status and records its duration
    ///
    /// Duration is measured from the recorded start time; a run that never
    /// started gets no duration.
    pub fn finish(&mut self, status: RunStatus, at: DateTime<Utc>) {
        self.status = status;
        self.finished_at = Some(at);
        self.duration_seconds = self.started_at.map(|start| (at - start).num_seconds());
    }
}

/// Pipeline run status
///
/// PENDING -> RUNNING -> SUCCESS | FAILED | CANCELLED, with PENDING -> CANCELLED
/// for runs cancelled before dispatch. FAILED -> RUNNING is allowed only for a
/// queue retry of the same job; SUCCESS and CANCELLED are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Running => "RUNNING",
            RunStatus::Success => "SUCCESS",
            RunStatus::Failed => "FAILED",
            RunStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;

        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Running, Success)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Failed, Running)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(RunStatus::Pending),
            "RUNNING" => Ok(RunStatus::Running),
            "SUCCESS" => Ok(RunStatus::Success),
            "FAILED" => Ok(RunStatus::Failed),
            "CANCELLED" => Ok(RunStatus::Cancelled),
            other => Err(format!("unknown run status '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_are_absorbing() {
        for next in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert!(!RunStatus::Success.can_transition_to(next));
        }
        assert!(!RunStatus::Cancelled.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Success.can_transition_to(RunStatus::Running));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        for status in [RunStatus::Success, RunStatus::Failed, RunStatus::Cancelled] {
            assert!(status.is_terminal());
        }
    }

    #[test]
    fn test_retry_reenters_running_from_failed_only() {
        assert!(RunStatus::Failed.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Running.can_transition_to(RunStatus::Pending));
    }

    #[test]
    fn test_finish_records_duration() {
        let mut run = PipelineRun::pending(Uuid::new_v4(), Uuid::new_v4(), None);
        let start = Utc::now();
        run.started_at = Some(start);
        run.finish(RunStatus::Success, start + chrono::Duration::seconds(42));

        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.duration_seconds, Some(42));
    }

    #[test]
    fn test_finish_without_start_has_no_duration() {
        let mut run = PipelineRun::pending(Uuid::new_v4(), Uuid::new_v4(), None);
        run.finish(RunStatus::Cancelled, Utc::now());

        assert_eq!(run.duration_seconds, None);
        assert!(run.finished_at.is_some());
    }
}
