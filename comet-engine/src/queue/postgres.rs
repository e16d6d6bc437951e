//! Postgres job store
//!
//! Jobs live in `queued_jobs`; the pause flag lives in `queue_meta`. Workers
//! claim jobs with `FOR UPDATE SKIP LOCKED`, so several engine processes can
//! share one table without dispatching a job twice.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use comet_core::domain::job::{JobState, QueuedJob};
use comet_core::dto::queue::QueueStats;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::StoreError;
use crate::queue::store::{JobStore, STALLED_EXHAUSTED_REASON, STALLED_REASON, StalledJob};

/// Row name of this queue in `queue_meta`
const QUEUE_NAME: &str = "pipeline-execution";

const JOB_COLUMNS: &str = "id, payload, priority, attempts_made, max_attempts, backoff, state, \
     stalled_count, failed_reason, created_at, processed_at, finished_at, run_at, locked_until";

/// State a job enters when put back in the queue: paused or waiting
const REQUEUE_STATE: &str = "CASE WHEN EXISTS (SELECT 1 FROM queue_meta WHERE name = $1 AND paused) \
     THEN 'paused' ELSE 'waiting' END";

pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn settle(
        &self,
        id: Uuid,
        attempt: u32,
        assignments: &str,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let query = format!(
            "UPDATE queued_jobs SET {}, failed_reason = $4, locked_until = NULL \
             WHERE id = $1 AND state = 'active' AND attempts_made = $2",
            assignments
        );

        let result = sqlx::query(&query)
            .bind(id)
            .bind(to_db(attempt)?)
            .bind(at)
            .bind(reason)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn add(&self, job: QueuedJob) -> Result<(QueuedJob, bool), StoreError> {
        let query = format!(
            r#"
            INSERT INTO queued_jobs (
                id, payload, priority, attempts_made, max_attempts, backoff, state,
                stalled_count, created_at
            )
            VALUES ($2, $3, $4, $5, $6, $7, {}, 0, $8)
            ON CONFLICT (id) DO NOTHING
            RETURNING {}
            "#,
            REQUEUE_STATE, JOB_COLUMNS
        );

        let inserted = sqlx::query_as::<_, JobRow>(&query)
            .bind(QUEUE_NAME)
            .bind(job.id)
            .bind(serde_json::to_value(&job.payload)?)
            .bind(job.priority)
            .bind(to_db(job.attempts_made)?)
            .bind(to_db(job.max_attempts)?)
            .bind(serde_json::to_value(&job.backoff)?)
            .bind(job.created_at)
            .fetch_optional(&self.pool)
            .await?;

        match inserted {
            Some(row) => Ok((QueuedJob::try_from(row)?, true)),
            None => {
                let existing = self.find(job.id).await?.ok_or(StoreError::NotFound {
                    entity: "queued job",
                    id: job.id,
                })?;
                Ok((existing, false))
            }
        }
    }

    async fn find(&self, id: Uuid) -> Result<Option<QueuedJob>, StoreError> {
        let query = format!("SELECT {} FROM queued_jobs WHERE id = $1", JOB_COLUMNS);
        let row = sqlx::query_as::<_, JobRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(QueuedJob::try_from).transpose()
    }

    async fn fetch_next(
        &self,
        now: DateTime<Utc>,
        lock_until: DateTime<Utc>,
    ) -> Result<Option<QueuedJob>, StoreError> {
        let query = format!(
            r#"
            UPDATE queued_jobs
            SET state = 'active', attempts_made = attempts_made + 1, processed_at = $2,
                locked_until = $3, run_at = NULL
            WHERE id = (
                SELECT id FROM queued_jobs
                WHERE (state = 'waiting' OR (state = 'delayed' AND (run_at IS NULL OR run_at <= $2)))
                  AND NOT EXISTS (SELECT 1 FROM queue_meta WHERE name = $1 AND paused)
                ORDER BY priority ASC, created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {}
            "#,
            JOB_COLUMNS
        );

        let row = sqlx::query_as::<_, JobRow>(&query)
            .bind(QUEUE_NAME)
            .bind(now)
            .bind(lock_until)
            .fetch_optional(&self.pool)
            .await?;

        row.map(QueuedJob::try_from).transpose()
    }

    async fn extend_lock(&self, id: Uuid, lock_until: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE queued_jobs SET locked_until = $2 WHERE id = $1 AND state = 'active'",
        )
        .bind(id)
        .bind(lock_until)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn complete(&self, id: Uuid, attempt: u32, now: DateTime<Utc>) -> Result<bool, StoreError> {
        self.settle(id, attempt, "state = 'completed', finished_at = $3", None, now)
            .await
    }

    async fn retry_later(
        &self,
        id: Uuid,
        attempt: u32,
        reason: &str,
        run_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.settle(id, attempt, "state = 'delayed', run_at = $3", Some(reason), run_at)
            .await
    }

    async fn fail(
        &self,
        id: Uuid,
        attempt: u32,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.settle(id, attempt, "state = 'failed', finished_at = $3", Some(reason), now)
            .await
    }

    async fn recover_stalled(
        &self,
        now: DateTime<Utc>,
        max_stalled: u32,
    ) -> Result<Vec<StalledJob>, StoreError> {
        let query = format!(
            r#"
            UPDATE queued_jobs
            SET stalled_count = stalled_count + 1,
                locked_until = NULL,
                state = CASE
                    WHEN stalled_count + 1 > $3 OR attempts_made >= max_attempts THEN 'failed'
                    ELSE {}
                END,
                failed_reason = CASE
                    WHEN stalled_count + 1 > $3 THEN $4
                    WHEN attempts_made >= max_attempts THEN $5
                    ELSE failed_reason
                END,
                finished_at = CASE
                    WHEN stalled_count + 1 > $3 OR attempts_made >= max_attempts THEN $2
                    ELSE finished_at
                END
            WHERE state = 'active' AND locked_until < $2
            RETURNING id, state
            "#,
            REQUEUE_STATE
        );

        let rows: Vec<(Uuid, String)> = sqlx::query_as(&query)
            .bind(QUEUE_NAME)
            .bind(now)
            .bind(to_db(max_stalled)?)
            .bind(STALLED_REASON)
            .bind(STALLED_EXHAUSTED_REASON)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(id, state)| StalledJob {
                id,
                failed: state == JobState::Failed.as_str(),
            })
            .collect())
    }

    async fn remove(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM queued_jobs WHERE id = $1 AND state <> 'active'")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn retry_failed(&self, id: Uuid) -> Result<bool, StoreError> {
        let query = format!(
            r#"
            UPDATE queued_jobs
            SET state = {}, attempts_made = 0, stalled_count = 0, failed_reason = NULL,
                finished_at = NULL, run_at = NULL
            WHERE id = $2 AND state = 'failed'
            "#,
            REQUEUE_STATE
        );

        let result = sqlx::query(&query)
            .bind(QUEUE_NAME)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn counts(&self) -> Result<QueueStats, StoreError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM queued_jobs GROUP BY state")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = QueueStats::default();
        for (state, count) in rows {
            let state: JobState = state.parse().map_err(StoreError::Corrupt)?;
            stats.record(state, u64::try_from(count).unwrap_or_default());
        }
        Ok(stats)
    }

    async fn list(&self, state: JobState, limit: usize) -> Result<Vec<QueuedJob>, StoreError> {
        let query = format!(
            r#"
            SELECT {} FROM queued_jobs
            WHERE state = $1
            ORDER BY COALESCE(finished_at, created_at) DESC
            LIMIT $2
            "#,
            JOB_COLUMNS
        );

        let rows = sqlx::query_as::<_, JobRow>(&query)
            .bind(state.as_str())
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(QueuedJob::try_from).collect()
    }

    async fn set_paused(&self, paused: bool) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO queue_meta (name, paused) VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE SET paused = EXCLUDED.paused
            "#,
        )
        .bind(QUEUE_NAME)
        .bind(paused)
        .execute(&mut *tx)
        .await?;

        let (from, to) = if paused {
            (JobState::Waiting, JobState::Paused)
        } else {
            (JobState::Paused, JobState::Waiting)
        };
        sqlx::query("UPDATE queued_jobs SET state = $2 WHERE state = $1")
            .bind(from.as_str())
            .bind(to.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn is_paused(&self) -> Result<bool, StoreError> {
        let paused: Option<bool> = sqlx::query_scalar("SELECT paused FROM queue_meta WHERE name = $1")
            .bind(QUEUE_NAME)
            .fetch_optional(&self.pool)
            .await?;

        Ok(paused.unwrap_or(false))
    }

    async fn clean(
        &self,
        state: JobState,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            DELETE FROM queued_jobs
            WHERE state = $1 AND COALESCE(finished_at, created_at) < $2
            RETURNING id
            "#,
        )
        .bind(state.as_str())
        .bind(older_than)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }
}

fn to_db(value: u32) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| StoreError::Corrupt(format!("counter {} out of range", value)))
}

fn from_db(value: i32, column: &str) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative {}: {}", column, value)))
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    payload: serde_json::Value,
    priority: i32,
    attempts_made: i32,
    max_attempts: i32,
    backoff: serde_json::Value,
    state: String,
    stalled_count: i32,
    failed_reason: Option<String>,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    run_at: Option<DateTime<Utc>>,
    locked_until: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for QueuedJob {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(QueuedJob {
            id: row.id,
            payload: serde_json::from_value(row.payload)?,
            priority: row.priority,
            attempts_made: from_db(row.attempts_made, "attempts_made")?,
            max_attempts: from_db(row.max_attempts, "max_attempts")?,
            backoff: serde_json::from_value(row.backoff)?,
            state: row.state.parse().map_err(StoreError::Corrupt)?,
            stalled_count: from_db(row.stalled_count, "stalled_count")?,
            failed_reason: row.failed_reason,
            created_at: row.created_at,
            processed_at: row.processed_at,
            finished_at: row.finished_at,
            run_at: row.run_at,
            locked_until: row.locked_until,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use comet_core::domain::job::BackoffPolicy;

    fn row(state: &str, backoff: serde_json::Value) -> JobRow {
        let run_id = Uuid::new_v4();
        JobRow {
            id: run_id,
            payload: serde_json::json!({
                "pipelineId": Uuid::new_v4(),
                "pipelineRunId": run_id,
                "projectId": Uuid::new_v4(),
                "repositoryUrl": "https://example.com/repo.git",
                "branch": "main",
                "stages": [{ "name": "build", "type": "BUILD", "commands": ["make"] }]
            }),
            priority: 0,
            attempts_made: 2,
            max_attempts: 3,
            backoff,
            state: state.to_string(),
            stalled_count: 0,
            failed_reason: Some("boom".to_string()),
            created_at: Utc::now(),
            processed_at: None,
            finished_at: None,
            run_at: None,
            locked_until: None,
        }
    }

    #[test]
    fn test_job_row_conversion() {
        let job = QueuedJob::try_from(row(
            "delayed",
            serde_json::json!({ "type": "fixed", "delay_ms": 100 }),
        ))
        .unwrap();

        assert_eq!(job.state, JobState::Delayed);
        assert_eq!(job.attempts_made, 2);
        assert_eq!(job.backoff, BackoffPolicy::Fixed { delay_ms: 100 });
        assert_eq!(job.payload.stages.len(), 1);
        assert_eq!(job.id, job.payload.pipeline_run_id);
    }

    #[test]
    fn test_job_row_with_unknown_state_is_corrupt() {
        let result = QueuedJob::try_from(row(
            "exploded",
            serde_json::json!({ "type": "exponential", "delay_ms": 100 }),
        ));

        assert!(matches!(result, Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_negative_counter_is_corrupt() {
        let mut row = row("waiting", serde_json::json!({ "type": "fixed", "delay_ms": 1 }));
        row.attempts_made = -1;

        assert!(matches!(QueuedJob::try_from(row), Err(StoreError::Corrupt(_))));
    }
}
