//! In-memory run repository
//!
//! Used by tests and by local setups without a database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use comet_core::domain::run::{PipelineRun, RunStatus};
use comet_core::domain::stage::StageRun;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::StoreError;
use crate::repository::RunRepository;

#[derive(Default)]
struct Tables {
    runs: HashMap<Uuid, PipelineRun>,
    /// Kept in insertion order per run
    stages: HashMap<Uuid, Vec<StageRun>>,
    pipelines: HashMap<Uuid, (RunStatus, DateTime<Utc>)>,
}

#[derive(Default)]
pub struct InMemoryRunRepository {
    tables: Mutex<Tables>,
}

impl InMemoryRunRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Display status and last-run timestamp recorded for a pipeline
    pub async fn pipeline_status(&self, pipeline_id: Uuid) -> Option<(RunStatus, DateTime<Utc>)> {
        self.tables.lock().await.pipelines.get(&pipeline_id).copied()
    }
}

#[async_trait]
impl RunRepository for InMemoryRunRepository {
    async fn create_run(&self, run: &PipelineRun) -> Result<(), StoreError> {
        self.tables.lock().await.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn find_run(&self, id: Uuid) -> Result<Option<PipelineRun>, StoreError> {
        Ok(self.tables.lock().await.runs.get(&id).cloned())
    }

    async fn update_run(&self, run: &PipelineRun) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        match tables.runs.get_mut(&run.id) {
            Some(stored) => {
                *stored = run.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound {
                entity: "pipeline run",
                id: run.id,
            }),
        }
    }

    async fn transition_run(&self, run: &PipelineRun, from: RunStatus) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        match tables.runs.get_mut(&run.id) {
            Some(stored) if stored.status == from => {
                *stored = run.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound {
                entity: "pipeline run",
                id: run.id,
            }),
        }
    }

    async fn create_stage_run(&self, stage: &StageRun) -> Result<(), StoreError> {
        self.tables
            .lock()
            .await
            .stages
            .entry(stage.run_id)
            .or_default()
            .push(stage.clone());
        Ok(())
    }

    async fn update_stage_run(&self, stage: &StageRun) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let stored = tables
            .stages
            .get_mut(&stage.run_id)
            .and_then(|stages| stages.iter_mut().find(|s| s.id == stage.id))
            .ok_or(StoreError::NotFound {
                entity: "stage run",
                id: stage.id,
            })?;
        *stored = stage.clone();
        Ok(())
    }

    async fn list_stage_runs(&self, run_id: Uuid) -> Result<Vec<StageRun>, StoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .stages
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_stage_runs(&self, run_id: Uuid) -> Result<(), StoreError> {
        self.tables.lock().await.stages.remove(&run_id);
        Ok(())
    }

    async fn update_pipeline_status(
        &self,
        pipeline_id: Uuid,
        status: RunStatus,
        last_run_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.tables
            .lock()
            .await
            .pipelines
            .insert(pipeline_id, (status, last_run_at));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use comet_core::domain::pipeline::{StageDefinition, StageKind};
    use comet_core::domain::stage::StageStatus;

    #[tokio::test]
    async fn test_update_missing_run_fails() {
        let repo = InMemoryRunRepository::new();
        let run = PipelineRun::pending(Uuid::new_v4(), Uuid::new_v4(), None);

        assert!(matches!(
            repo.update_run(&run).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_stage_runs_keep_start_order() {
        let repo = InMemoryRunRepository::new();
        let run_id = Uuid::new_v4();

        for name in ["build", "test", "deploy"] {
            let stage = StageDefinition::new(name, StageKind::Build, vec![]);
            repo.create_stage_run(&StageRun::started(run_id, &stage))
                .await
                .unwrap();
        }

        let mut stages = repo.list_stage_runs(run_id).await.unwrap();
        let names: Vec<_> = stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["build", "test", "deploy"]);

        stages[1].finish(StageStatus::Success, Utc::now());
        repo.update_stage_run(&stages[1]).await.unwrap();
        let stored = repo.list_stage_runs(run_id).await.unwrap();
        assert_eq!(stored[1].status, StageStatus::Success);

        repo.delete_stage_runs(run_id).await.unwrap();
        assert!(repo.list_stage_runs(run_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transition_run_requires_expected_status() {
        let repo = InMemoryRunRepository::new();
        let mut run = PipelineRun::pending(Uuid::new_v4(), Uuid::new_v4(), None);
        repo.create_run(&run).await.unwrap();

        run.status = RunStatus::Running;
        assert!(repo.transition_run(&run, RunStatus::Pending).await.unwrap());

        // Stored status is RUNNING now, a writer expecting PENDING loses
        let mut stale = run.clone();
        stale.status = RunStatus::Cancelled;
        assert!(!repo.transition_run(&stale, RunStatus::Pending).await.unwrap());
        assert_eq!(repo.find_run(run.id).await.unwrap().unwrap().status, RunStatus::Running);
    }
}
