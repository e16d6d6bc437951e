//! Postgres run repository

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use comet_core::domain::run::{PipelineRun, RunStatus};
use comet_core::domain::stage::StageRun;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::StoreError;
use crate::repository::RunRepository;

pub struct PgRunRepository {
    pool: PgPool,
}

impl PgRunRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunRepository for PgRunRepository {
    async fn create_run(&self, run: &PipelineRun) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO pipeline_runs (
                id, pipeline_id, status, started_at, finished_at, duration_seconds,
                triggered_by, logs, metadata, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(run.id)
        .bind(run.pipeline_id)
        .bind(run.status.as_str())
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.duration_seconds)
        .bind(&run.triggered_by)
        .bind(&run.logs)
        .bind(&run.metadata)
        .bind(run.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_run(&self, id: Uuid) -> Result<Option<PipelineRun>, StoreError> {
        let row = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, pipeline_id, status, started_at, finished_at, duration_seconds,
                   triggered_by, logs, metadata, created_at
            FROM pipeline_runs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PipelineRun::try_from).transpose()
    }

    async fn update_run(&self, run: &PipelineRun) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE pipeline_runs
            SET status = $1, started_at = $2, finished_at = $3, duration_seconds = $4,
                logs = $5, metadata = $6
            WHERE id = $7
            "#,
        )
        .bind(run.status.as_str())
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.duration_seconds)
        .bind(&run.logs)
        .bind(&run.metadata)
        .bind(run.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "pipeline run",
                id: run.id,
            });
        }
        Ok(())
    }

    async fn transition_run(&self, run: &PipelineRun, from: RunStatus) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE pipeline_runs
            SET status = $1, started_at = $2, finished_at = $3, duration_seconds = $4,
                logs = $5, metadata = $6
            WHERE id = $7 AND status = $8
            "#,
        )
        .bind(run.status.as_str())
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.duration_seconds)
        .bind(&run.logs)
        .bind(&run.metadata)
        .bind(run.id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn create_stage_run(&self, stage: &StageRun) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO stage_runs (
                id, run_id, name, kind, status, started_at, finished_at,
                duration_seconds, logs, artifacts, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(stage.id)
        .bind(stage.run_id)
        .bind(&stage.name)
        .bind(stage.kind.as_str())
        .bind(stage.status.as_str())
        .bind(stage.started_at)
        .bind(stage.finished_at)
        .bind(stage.duration_seconds)
        .bind(&stage.logs)
        .bind(&stage.artifacts)
        .bind(&stage.metadata)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_stage_run(&self, stage: &StageRun) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE stage_runs
            SET status = $1, finished_at = $2, duration_seconds = $3, logs = $4,
                artifacts = $5, metadata = $6
            WHERE id = $7
            "#,
        )
        .bind(stage.status.as_str())
        .bind(stage.finished_at)
        .bind(stage.duration_seconds)
        .bind(&stage.logs)
        .bind(&stage.artifacts)
        .bind(&stage.metadata)
        .bind(stage.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "stage run",
                id: stage.id,
            });
        }
        Ok(())
    }

    async fn list_stage_runs(&self, run_id: Uuid) -> Result<Vec<StageRun>, StoreError> {
        let rows = sqlx::query_as::<_, StageRunRow>(
            r#"
            SELECT id, run_id, name, kind, status, started_at, finished_at,
                   duration_seconds, logs, artifacts, metadata
            FROM stage_runs
            WHERE run_id = $1
            ORDER BY started_at ASC, seq ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StageRun::try_from).collect()
    }

    async fn delete_stage_runs(&self, run_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM stage_runs WHERE run_id = $1")
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_pipeline_status(
        &self,
        pipeline_id: Uuid,
        status: RunStatus,
        last_run_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE pipelines
            SET status = $1, last_run_at = $2, updated_at = $2
            WHERE id = $3
            "#,
        )
        .bind(status.as_str())
        .bind(last_run_at)
        .bind(pipeline_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::debug!("Pipeline {} has no row to update", pipeline_id);
        }
        Ok(())
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    pipeline_id: Uuid,
    status: String,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    duration_seconds: Option<i64>,
    triggered_by: Option<String>,
    logs: Option<String>,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<RunRow> for PipelineRun {
    type Error = StoreError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        Ok(PipelineRun {
            id: row.id,
            pipeline_id: row.pipeline_id,
            status: row.status.parse().map_err(StoreError::Corrupt)?,
            started_at: row.started_at,
            finished_at: row.finished_at,
            duration_seconds: row.duration_seconds,
            triggered_by: row.triggered_by,
            logs: row.logs,
            metadata: row.metadata,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StageRunRow {
    id: Uuid,
    run_id: Uuid,
    name: String,
    kind: String,
    status: String,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    duration_seconds: Option<i64>,
    logs: String,
    artifacts: Vec<String>,
    metadata: serde_json::Value,
}

impl TryFrom<StageRunRow> for StageRun {
    type Error = StoreError;

    fn try_from(row: StageRunRow) -> Result<Self, Self::Error> {
        Ok(StageRun {
            id: row.id,
            run_id: row.run_id,
            name: row.name,
            kind: row.kind.parse().map_err(StoreError::Corrupt)?,
            status: row.status.parse().map_err(StoreError::Corrupt)?,
            started_at: row.started_at,
            finished_at: row.finished_at,
            duration_seconds: row.duration_seconds,
            logs: row.logs,
            artifacts: row.artifacts,
            metadata: row.metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use comet_core::domain::pipeline::StageKind;
    use comet_core::domain::stage::StageStatus;

    #[test]
    fn test_stage_row_conversion() {
        let row = StageRunRow {
            id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            name: "scan".to_string(),
            kind: "SECURITY_SCAN".to_string(),
            status: "FAILED".to_string(),
            started_at: Utc::now(),
            finished_at: None,
            duration_seconds: None,
            logs: String::new(),
            artifacts: vec!["security-report.json".to_string()],
            metadata: serde_json::json!({}),
        };

        let stage = StageRun::try_from(row).unwrap();
        assert_eq!(stage.kind, StageKind::SecurityScan);
        assert_eq!(stage.status, StageStatus::Failed);
    }

    #[test]
    fn test_run_row_with_unknown_status_is_corrupt() {
        let row = RunRow {
            id: Uuid::new_v4(),
            pipeline_id: Uuid::new_v4(),
            status: "EXPLODED".to_string(),
            started_at: None,
            finished_at: None,
            duration_seconds: None,
            triggered_by: None,
            logs: None,
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
        };

        assert!(matches!(
            PipelineRun::try_from(row),
            Err(StoreError::Corrupt(_))
        ));
    }
}
