//! Repository Module
//!
//! Persistence of the records the engine owns: pipeline runs, stage runs and
//! the owning pipeline's display status.

mod memory;
mod postgres;

pub use memory::InMemoryRunRepository;
pub use postgres::PgRunRepository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use comet_core::domain::run::{PipelineRun, RunStatus};
use comet_core::domain::stage::StageRun;
use uuid::Uuid;

use crate::error::StoreError;

/// Create/update-by-id access to run and stage records
#[async_trait]
pub trait RunRepository: Send + Sync {
    async fn create_run(&self, run: &PipelineRun) -> Result<(), StoreError>;

    async fn find_run(&self, id: Uuid) -> Result<Option<PipelineRun>, StoreError>;

    async fn update_run(&self, run: &PipelineRun) -> Result<(), StoreError>;

    /// Writes `run` only while the stored status is still `from`
    ///
    /// Returns false when another writer settled the run first.
    async fn transition_run(&self, run: &PipelineRun, from: RunStatus) -> Result<bool, StoreError>;

    async fn create_stage_run(&self, stage: &StageRun) -> Result<(), StoreError>;

    async fn update_stage_run(&self, stage: &StageRun) -> Result<(), StoreError>;

    /// Stage runs of a run in start order
    async fn list_stage_runs(&self, run_id: Uuid) -> Result<Vec<StageRun>, StoreError>;

    /// Drops the stage runs of a run, before a retry records new ones
    async fn delete_stage_runs(&self, run_id: Uuid) -> Result<(), StoreError>;

    /// Updates the pipeline's display status and last-run timestamp
    async fn update_pipeline_status(
        &self,
        pipeline_id: Uuid,
        status: RunStatus,
        last_run_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}
