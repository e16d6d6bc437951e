//! Durable backend of the execution queue

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use comet_core::domain::job::{JobState, QueuedJob};
use comet_core::dto::queue::QueueStats;
use uuid::Uuid;

use crate::error::StoreError;

/// Reason recorded on a job failed by stall detection
pub const STALLED_REASON: &str = "job stalled more than allowable limit";

/// Reason recorded on a job that stalled during its last allowed attempt
pub const STALLED_EXHAUSTED_REASON: &str = "job stalled on its final attempt";

/// Outcome of stall recovery for one job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalledJob {
    pub id: Uuid,
    /// Stalled too often and moved to FAILED instead of back to the queue
    pub failed: bool,
}

/// Storage operations the queue runtime is built on
///
/// Every state change of an ACTIVE job is guarded by the attempt number the
/// worker claimed it with, so a worker whose job was recovered as stalled and
/// claimed again cannot settle the newer attempt.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts the job unless one with the same id exists
    ///
    /// Returns the stored job and whether it was created. New jobs enter
    /// PAUSED while the queue is paused.
    async fn add(&self, job: QueuedJob) -> Result<(QueuedJob, bool), StoreError>;

    async fn find(&self, id: Uuid) -> Result<Option<QueuedJob>, StoreError>;

    /// Atomically claims the best WAITING or due DELAYED job
    ///
    /// The claimed job is ACTIVE with its attempt counter incremented and its
    /// lock set to `lock_until`. Nothing is claimed while the queue is paused.
    async fn fetch_next(
        &self,
        now: DateTime<Utc>,
        lock_until: DateTime<Utc>,
    ) -> Result<Option<QueuedJob>, StoreError>;

    /// Renews the lock of an ACTIVE job; false when the job is no longer active
    async fn extend_lock(&self, id: Uuid, lock_until: DateTime<Utc>) -> Result<bool, StoreError>;

    async fn complete(&self, id: Uuid, attempt: u32, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Moves a failed attempt to DELAYED until `run_at`
    async fn retry_later(
        &self,
        id: Uuid,
        attempt: u32,
        reason: &str,
        run_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Terminally fails a job
    async fn fail(
        &self,
        id: Uuid,
        attempt: u32,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Returns ACTIVE jobs with an expired lock to the queue
    ///
    /// A job stalled more than `max_stalled` times is failed instead.
    async fn recover_stalled(
        &self,
        now: DateTime<Utc>,
        max_stalled: u32,
    ) -> Result<Vec<StalledJob>, StoreError>;

    /// Deletes a job that is not ACTIVE
    async fn remove(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Puts a FAILED job back in the queue with a fresh attempt budget
    async fn retry_failed(&self, id: Uuid) -> Result<bool, StoreError>;

    async fn counts(&self) -> Result<QueueStats, StoreError>;

    /// Jobs in `state`, most recent first
    async fn list(&self, state: JobState, limit: usize) -> Result<Vec<QueuedJob>, StoreError>;

    /// Persists the pause flag and moves WAITING jobs to PAUSED or back
    async fn set_paused(&self, paused: bool) -> Result<(), StoreError>;

    async fn is_paused(&self) -> Result<bool, StoreError>;

    /// Deletes jobs in `state` settled (or enqueued) before `older_than`
    async fn clean(
        &self,
        state: JobState,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError>;
}
