//! Queued job domain types
//!
//! A queued job is the durable unit of work of the execution queue. Its id is
//! always the id of the pipeline run it executes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::dto::execution::ExecutionRequest;
use crate::dto::queue::JobOptions;

/// Durable execution job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    /// Same as `payload.pipeline_run_id`
    pub id: Uuid,
    pub payload: ExecutionRequest,
    /// Lower values are dispatched first
    pub priority: i32,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub state: JobState,
    pub stalled_count: u32,
    pub failed_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// When a DELAYED job becomes eligible again
    pub run_at: Option<DateTime<Utc>>,
    /// Lock deadline of an ACTIVE job; an expired lock marks the job stalled
    pub locked_until: Option<DateTime<Utc>>,
}

impl QueuedJob {
    /// Creates a WAITING job for the given request
    pub fn new(payload: ExecutionRequest, options: &JobOptions) -> Self {
        Self {
            id: payload.pipeline_run_id,
            payload,
            priority: options.priority,
            attempts_made: 0,
            max_attempts: options.attempts.max(1),
            backoff: options.backoff.clone(),
            state: JobState::Waiting,
            stalled_count: 0,
            failed_reason: None,
            created_at: Utc::now(),
            processed_at: None,
            finished_at: None,
            run_at: None,
            locked_until: None,
        }
    }

    /// Whether the job can be picked up by a worker at `now`
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            JobState::Waiting => true,
            JobState::Delayed => self.run_at.is_none_or(|at| at <= now),
            _ => false,
        }
    }

    /// Timestamp used by clean: finish time for settled jobs, enqueue time otherwise
    pub fn age_reference(&self) -> DateTime<Utc> {
        self.finished_at.unwrap_or(self.created_at)
    }
}

/// Queue-level job state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
    Paused,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Waiting,
        JobState::Active,
        JobState::Completed,
        JobState::Failed,
        JobState::Delayed,
        JobState::Paused,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Delayed => "delayed",
            JobState::Paused => "paused",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown job state '{}'", s))
    }
}

/// Delay applied before a failed attempt is retried
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackoffPolicy {
    /// Same delay before every retry
    Fixed { delay_ms: u64 },
    /// `delay_ms * 2^(attempts_made - 1)`
    Exponential { delay_ms: u64 },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential { delay_ms: 2000 }
    }
}

impl BackoffPolicy {
    /// Delay before the next attempt, given the number of attempts already made
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        match self {
            BackoffPolicy::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            BackoffPolicy::Exponential { delay_ms } => {
                let exponent = attempts_made.saturating_sub(1).min(32);
                Duration::from_millis(delay_ms.saturating_mul(1u64 << exponent))
            }
        }
    }
}
