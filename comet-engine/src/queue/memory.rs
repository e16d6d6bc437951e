//! In-memory job store
//!
//! Same semantics as the Postgres store without durability. Used by tests and
//! by local setups without a database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use comet_core::domain::job::{JobState, QueuedJob};
use comet_core::dto::queue::QueueStats;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::StoreError;
use crate::queue::store::{JobStore, STALLED_EXHAUSTED_REASON, STALLED_REASON, StalledJob};

#[derive(Default)]
struct State {
    jobs: HashMap<Uuid, QueuedJob>,
    paused: bool,
}

impl State {
    fn queued_state(&self) -> JobState {
        if self.paused {
            JobState::Paused
        } else {
            JobState::Waiting
        }
    }

    /// The ACTIVE job claimed with `attempt`, if it still is
    fn claimed(&mut self, id: Uuid, attempt: u32) -> Option<&mut QueuedJob> {
        self.jobs
            .get_mut(&id)
            .filter(|job| job.state == JobState::Active && job.attempts_made == attempt)
    }
}

#[derive(Default)]
pub struct InMemoryJobStore {
    state: Mutex<State>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn add(&self, mut job: QueuedJob) -> Result<(QueuedJob, bool), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.jobs.get(&job.id) {
            return Ok((existing.clone(), false));
        }

        job.state = state.queued_state();
        state.jobs.insert(job.id, job.clone());
        Ok((job, true))
    }

    async fn find(&self, id: Uuid) -> Result<Option<QueuedJob>, StoreError> {
        Ok(self.state.lock().await.jobs.get(&id).cloned())
    }

    async fn fetch_next(
        &self,
        now: DateTime<Utc>,
        lock_until: DateTime<Utc>,
    ) -> Result<Option<QueuedJob>, StoreError> {
        let mut state = self.state.lock().await;
        if state.paused {
            return Ok(None);
        }

        let next = state
            .jobs
            .values_mut()
            .filter(|job| job.is_ready(now))
            .min_by_key(|job| (job.priority, job.created_at));

        Ok(next.map(|job| {
            job.state = JobState::Active;
            job.attempts_made += 1;
            job.processed_at = Some(now);
            job.locked_until = Some(lock_until);
            job.run_at = None;
            job.clone()
        }))
    }

    async fn extend_lock(&self, id: Uuid, lock_until: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(&id) {
            Some(job) if job.state == JobState::Active => {
                job.locked_until = Some(lock_until);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(&self, id: Uuid, attempt: u32, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state
            .claimed(id, attempt)
            .map(|job| {
                job.state = JobState::Completed;
                job.failed_reason = None;
                job.finished_at = Some(now);
                job.locked_until = None;
            })
            .is_some())
    }

    async fn retry_later(
        &self,
        id: Uuid,
        attempt: u32,
        reason: &str,
        run_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state
            .claimed(id, attempt)
            .map(|job| {
                job.state = JobState::Delayed;
                job.failed_reason = Some(reason.to_string());
                job.run_at = Some(run_at);
                job.locked_until = None;
            })
            .is_some())
    }

    async fn fail(
        &self,
        id: Uuid,
        attempt: u32,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state
            .claimed(id, attempt)
            .map(|job| {
                job.state = JobState::Failed;
                job.failed_reason = Some(reason.to_string());
                job.finished_at = Some(now);
                job.locked_until = None;
            })
            .is_some())
    }

    async fn recover_stalled(
        &self,
        now: DateTime<Utc>,
        max_stalled: u32,
    ) -> Result<Vec<StalledJob>, StoreError> {
        let mut state = self.state.lock().await;
        let requeue_state = state.queued_state();
        let mut stalled = Vec::new();

        for job in state.jobs.values_mut() {
            let expired = job.state == JobState::Active
                && job.locked_until.is_some_and(|until| until < now);
            if !expired {
                continue;
            }

            job.stalled_count += 1;
            job.locked_until = None;
            let reason = if job.stalled_count > max_stalled {
                Some(STALLED_REASON)
            } else if job.attempts_made >= job.max_attempts {
                Some(STALLED_EXHAUSTED_REASON)
            } else {
                None
            };
            let failed = reason.is_some();
            match reason {
                Some(reason) => {
                    job.state = JobState::Failed;
                    job.failed_reason = Some(reason.to_string());
                    job.finished_at = Some(now);
                }
                None => job.state = requeue_state,
            }
            stalled.push(StalledJob { id: job.id, failed });
        }

        Ok(stalled)
    }

    async fn remove(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.jobs.get(&id) {
            Some(job) if job.state != JobState::Active => Ok(state.jobs.remove(&id).is_some()),
            _ => Ok(false),
        }
    }

    async fn retry_failed(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let requeue_state = state.queued_state();
        match state.jobs.get_mut(&id) {
            Some(job) if job.state == JobState::Failed => {
                job.state = requeue_state;
                job.attempts_made = 0;
                job.stalled_count = 0;
                job.failed_reason = None;
                job.finished_at = None;
                job.run_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn counts(&self) -> Result<QueueStats, StoreError> {
        let state = self.state.lock().await;
        let mut stats = QueueStats::default();
        for job in state.jobs.values() {
            stats.record(job.state, 1);
        }
        Ok(stats)
    }

    async fn list(&self, state: JobState, limit: usize) -> Result<Vec<QueuedJob>, StoreError> {
        let guard = self.state.lock().await;
        let mut jobs: Vec<QueuedJob> = guard
            .jobs
            .values()
            .filter(|job| job.state == state)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| std::cmp::Reverse(job.age_reference()));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn set_paused(&self, paused: bool) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.paused = paused;

        let (from, to) = if paused {
            (JobState::Waiting, JobState::Paused)
        } else {
            (JobState::Paused, JobState::Waiting)
        };
        for job in state.jobs.values_mut().filter(|job| job.state == from) {
            job.state = to;
        }
        Ok(())
    }

    async fn is_paused(&self) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.paused)
    }

    async fn clean(
        &self,
        state: JobState,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut guard = self.state.lock().await;
        let removed: Vec<Uuid> = guard
            .jobs
            .values()
            .filter(|job| job.state == state && job.age_reference() < older_than)
            .map(|job| job.id)
            .collect();

        for id in &removed {
            guard.jobs.remove(id);
        }
        Ok(removed)
    }
}
