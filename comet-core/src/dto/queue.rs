//! Queue DTOs

use serde::{Deserialize, Serialize};

use crate::domain::job::{BackoffPolicy, JobState};

/// Options supplied with an enqueue request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    pub priority: i32,
    pub attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            attempts: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Job counts per state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    pub paused: u64,
    pub total: u64,
}

impl QueueStats {
    /// Adds `count` jobs in `state`, keeping `total` in sync
    pub fn record(&mut self, state: JobState, count: u64) {
        match state {
            JobState::Waiting => self.waiting += count,
            JobState::Active => self.active += count,
            JobState::Completed => self.completed += count,
            JobState::Failed => self.failed += count,
            JobState::Delayed => self.delayed += count,
            JobState::Paused => self.paused += count,
        }
        self.total += count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_total_tracks_states() {
        let mut stats = QueueStats::default();
        stats.record(JobState::Waiting, 2);
        stats.record(JobState::Failed, 1);

        assert_eq!(stats.waiting, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.total, 3);
    }

    #[test]
    fn test_job_options_partial_json() {
        let options: JobOptions = serde_json::from_value(serde_json::json!({ "priority": 5 })).unwrap();
        assert_eq!(options.priority, 5);
        assert_eq!(options.attempts, 3);
        assert_eq!(options.backoff, BackoffPolicy::Exponential { delay_ms: 2000 });
    }
}
