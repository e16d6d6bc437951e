//! Pipeline orchestrator
//!
//! Runs the stages of one pipeline run in declared order through the stage
//! executor, persisting every run and stage transition as it goes.

use async_trait::async_trait;
use chrono::Utc;
use comet_core::domain::event::{EventKind, PipelineEvent};
use comet_core::domain::pipeline::StageDefinition;
use comet_core::domain::run::{PipelineRun, RunStatus};
use comet_core::domain::stage::{StageRun, StageStatus};
use comet_core::dto::execution::ExecutionRequest;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::container::{ExecutionOptions, ExecutionResult, StageExecutor};
use crate::error::OrchestratorError;
use crate::queue::JobHandler;
use crate::repository::RunRepository;
use crate::service::broadcast::EventBroadcaster;
use crate::service::profiles::StageProfiles;

pub struct PipelineOrchestrator {
    repository: Arc<dyn RunRepository>,
    executor: Arc<dyn StageExecutor>,
    broadcaster: Arc<dyn EventBroadcaster>,
    profiles: StageProfiles,
    /// Runs executing in this process, with their cancellation signal
    active: Mutex<HashMap<Uuid, CancellationToken>>,
}

/// Removes a run from the active set however its execution ends
struct ActiveGuard<'a> {
    orchestrator: &'a PipelineOrchestrator,
    run_id: Uuid,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.orchestrator.lock_active().remove(&self.run_id);
    }
}

impl PipelineOrchestrator {
    pub fn new(
        repository: Arc<dyn RunRepository>,
        executor: Arc<dyn StageExecutor>,
        broadcaster: Arc<dyn EventBroadcaster>,
        profiles: StageProfiles,
    ) -> Self {
        Self {
            repository,
            executor,
            broadcaster,
            profiles,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Ids of the runs currently executing in this process
    pub fn active_runs(&self) -> Vec<Uuid> {
        self.lock_active().keys().copied().collect()
    }

    pub fn is_active(&self, run_id: Uuid) -> bool {
        self.lock_active().contains_key(&run_id)
    }

    /// Executes a pipeline run to a terminal status
    ///
    /// Stage failures end in a FAILED run and `Ok`. Any other error marks the
    /// run, its running stages and its pipeline FAILED before being returned,
    /// so the queue counts the attempt as failed. A second execution of a run
    /// already active in this process fails with `AlreadyRunning` and leaves
    /// the run alone.
    pub async fn execute(&self, request: &ExecutionRequest) -> Result<RunStatus, OrchestratorError> {
        let run_id = request.pipeline_run_id;

        let token = CancellationToken::new();
        {
            let mut active = self.lock_active();
            if active.contains_key(&run_id) {
                warn!(run_id = %run_id, "Run is already executing in this process");
                return Err(OrchestratorError::AlreadyRunning(run_id));
            }
            active.insert(run_id, token.clone());
        }
        let _guard = ActiveGuard {
            orchestrator: self,
            run_id,
        };

        match self.run_stages(request, &token).await {
            Ok(status) => Ok(status),
            Err(e) => {
                error!(run_id = %run_id, "Pipeline run failed: {}", e);
                self.record_failure(request, &e).await;
                Err(e)
            }
        }
    }

    /// Cancels a run at the next stage boundary
    ///
    /// Marks the run and its running stages CANCELLED. A container that is
    /// already executing is left to finish; its result is discarded.
    pub async fn cancel(&self, run_id: Uuid) -> Result<bool, OrchestratorError> {
        let token = self.lock_active().remove(&run_id);
        if let Some(token) = token {
            token.cancel();
        }

        let run = self
            .repository
            .find_run(run_id)
            .await?
            .ok_or(OrchestratorError::RunNotFound(run_id))?;

        self.mark_cancelled(run).await
    }

    async fn run_stages(
        &self,
        request: &ExecutionRequest,
        token: &CancellationToken,
    ) -> Result<RunStatus, OrchestratorError> {
        let run_id = request.pipeline_run_id;
        let mut run = self
            .repository
            .find_run(run_id)
            .await?
            .ok_or(OrchestratorError::RunNotFound(run_id))?;

        match run.status {
            RunStatus::Success | RunStatus::Cancelled => {
                info!(run_id = %run_id, status = %run.status, "Run already settled, nothing to execute");
                return Ok(run.status);
            }
            RunStatus::Running => {
                warn!(run_id = %run_id, "Run was left RUNNING by a lost worker, executing it again");
            }
            RunStatus::Pending | RunStatus::Failed => {}
        }

        if token.is_cancelled() {
            return self.finish_cancelled(run).await;
        }

        if run.status != RunStatus::Pending {
            debug!(run_id = %run_id, "Discarding stage runs of the previous attempt");
            self.repository.delete_stage_runs(run_id).await?;
        }

        let started_at = Utc::now();
        run.status = RunStatus::Running;
        run.started_at = Some(started_at);
        run.finished_at = None;
        run.duration_seconds = None;
        run.logs = None;
        self.repository.update_run(&run).await?;

        info!(
            run_id = %run_id,
            pipeline_id = %request.pipeline_id,
            stages = request.stages.len(),
            "Pipeline run started"
        );
        self.publish(
            EventKind::Started,
            run_id,
            json!({
                "pipelineId": request.pipeline_id,
                "stageCount": request.stages.len(),
            }),
        );

        let mut failed = false;

        for (index, stage) in request.stages.iter().enumerate() {
            if token.is_cancelled() {
                info!(run_id = %run_id, stage = %stage.name, "Run cancelled, not starting stage");
                return self.finish_cancelled(run).await;
            }

            if stage.parallel {
                debug!(run_id = %run_id, stage = %stage.name, "Parallel hint ignored, stages run sequentially");
            }

            let mut stage_run = StageRun::started(run_id, stage);
            self.repository.create_stage_run(&stage_run).await?;

            let options = self.execution_options(request, stage);
            let image = options.image.clone();
            info!(run_id = %run_id, stage = %stage.name, kind = %stage.kind, image = %image, "Stage started");

            let result = self.executor.run_in_container(&stage.name, options).await;

            if token.is_cancelled() {
                info!(run_id = %run_id, stage = %stage.name, "Run cancelled while stage was running, discarding its result");
                return self.finish_cancelled(run).await;
            }

            let succeeded = result.success;
            stage_run.logs = result.combined_logs();
            stage_run.metadata = stage_metadata(&result, &image);
            if succeeded {
                stage_run.artifacts = self.profiles.artifacts_for(stage.kind);
                stage_run.finish(StageStatus::Success, Utc::now());
            } else {
                stage_run.finish(StageStatus::Failed, Utc::now());
            }
            self.repository.update_stage_run(&stage_run).await?;

            self.publish(
                EventKind::StageCompleted,
                run_id,
                json!({
                    "stage": stage.name,
                    "kind": stage.kind,
                    "index": index,
                    "status": stage_run.status,
                    "exitCode": result.exit_code,
                    "durationSeconds": stage_run.duration_seconds,
                }),
            );

            if succeeded {
                info!(run_id = %run_id, stage = %stage.name, "Stage succeeded");
            } else if stage.continue_on_error {
                warn!(
                    run_id = %run_id,
                    stage = %stage.name,
                    exit_code = result.exit_code,
                    "Stage failed, continuing because continueOnError is set"
                );
            } else {
                warn!(run_id = %run_id, stage = %stage.name, exit_code = result.exit_code, "Stage failed, stopping run");
                failed = true;
                break;
            }
        }

        if token.is_cancelled() {
            return self.finish_cancelled(run).await;
        }

        let status = if failed {
            RunStatus::Failed
        } else {
            RunStatus::Success
        };
        let finished_at = Utc::now();
        run.finish(status, finished_at);
        if !self.repository.transition_run(&run, RunStatus::Running).await? {
            let current = self
                .repository
                .find_run(run_id)
                .await?
                .map_or(RunStatus::Cancelled, |stored| stored.status);
            info!(run_id = %run_id, status = %current, "Run was settled while finishing, keeping its status");
            return Ok(current);
        }
        self.repository
            .update_pipeline_status(run.pipeline_id, status, finished_at)
            .await?;

        let stages = self.repository.list_stage_runs(run_id).await?;
        info!(
            run_id = %run_id,
            status = %status,
            duration_seconds = run.duration_seconds,
            "Pipeline run finished"
        );

        let kind = if failed {
            EventKind::Failed
        } else {
            EventKind::Completed
        };
        self.publish(
            kind,
            run_id,
            json!({
                "pipelineId": run.pipeline_id,
                "status": status,
                "durationSeconds": run.duration_seconds,
                "stages": stage_history(&stages),
            }),
        );

        Ok(status)
    }

    fn execution_options(&self, request: &ExecutionRequest, stage: &StageDefinition) -> ExecutionOptions {
        let mut env = HashMap::from([
            ("COMET_RUN_ID".to_string(), request.pipeline_run_id.to_string()),
            ("COMET_PIPELINE_ID".to_string(), request.pipeline_id.to_string()),
            ("COMET_PROJECT_ID".to_string(), request.project_id.to_string()),
            ("COMET_BRANCH".to_string(), request.branch.clone()),
            ("COMET_REPOSITORY_URL".to_string(), request.repository_url.clone()),
            ("COMET_STAGE".to_string(), stage.name.clone()),
        ]);
        env.extend(stage.environment.clone());

        ExecutionOptions {
            image: self.profiles.image_for(stage),
            commands: stage.command_list(),
            env,
            working_dir: stage.working_directory.clone(),
            timeout: (stage.timeout > 0).then(|| Duration::from_secs(stage.timeout)),
        }
    }

    /// Persists the cancellation of a run that stopped at a stage boundary
    ///
    /// `cancel` usually wrote it already; this covers a cancel that raced
    /// with the start of the run.
    async fn finish_cancelled(&self, run: PipelineRun) -> Result<RunStatus, OrchestratorError> {
        let current = self
            .repository
            .find_run(run.id)
            .await?
            .unwrap_or(run);
        self.mark_cancelled(current).await?;
        Ok(RunStatus::Cancelled)
    }

    async fn mark_cancelled(&self, mut run: PipelineRun) -> Result<bool, OrchestratorError> {
        if !run.status.can_transition_to(RunStatus::Cancelled) {
            debug!(run_id = %run.id, status = %run.status, "Run cannot be cancelled");
            return Ok(false);
        }

        let from = run.status;
        let now = Utc::now();
        run.finish(RunStatus::Cancelled, now);
        if !self.repository.transition_run(&run, from).await? {
            debug!(run_id = %run.id, "Run changed before it could be cancelled");
            return Ok(false);
        }

        for mut stage in self.repository.list_stage_runs(run.id).await? {
            if stage.status == StageStatus::Running {
                stage.finish(StageStatus::Cancelled, now);
                self.repository.update_stage_run(&stage).await?;
            }
        }

        self.repository
            .update_pipeline_status(run.pipeline_id, RunStatus::Cancelled, now)
            .await?;

        info!(run_id = %run.id, "Pipeline run cancelled");
        self.publish(
            EventKind::Cancelled,
            run.id,
            json!({ "pipelineId": run.pipeline_id }),
        );
        Ok(true)
    }

    /// Best-effort FAILED bookkeeping after an orchestration error
    async fn record_failure(&self, request: &ExecutionRequest, error: &OrchestratorError) {
        let run_id = request.pipeline_run_id;
        let now = Utc::now();

        let settled_elsewhere = match self.repository.find_run(run_id).await {
            Ok(Some(run)) if matches!(run.status, RunStatus::Cancelled | RunStatus::Success) => true,
            Ok(Some(mut run)) => {
                let from = run.status;
                run.finish(RunStatus::Failed, now);
                run.logs = Some(error.to_string());
                match self.repository.transition_run(&run, from).await {
                    Ok(recorded) => !recorded,
                    Err(e) => {
                        error!(run_id = %run_id, "Failed to record run failure: {}", e);
                        false
                    }
                }
            }
            Ok(None) => false,
            Err(e) => {
                error!(run_id = %run_id, "Failed to load run to record failure: {}", e);
                false
            }
        };
        if settled_elsewhere {
            debug!(run_id = %run_id, "Run already settled, not recording the failure");
            return;
        }

        match self.repository.list_stage_runs(run_id).await {
            Ok(stages) => {
                for mut stage in stages.into_iter().filter(|s| s.status == StageStatus::Running) {
                    stage.logs.push_str(&error.to_string());
                    stage.finish(StageStatus::Failed, now);
                    if let Err(e) = self.repository.update_stage_run(&stage).await {
                        error!(run_id = %run_id, stage = %stage.name, "Failed to record stage failure: {}", e);
                    }
                }
            }
            Err(e) => error!(run_id = %run_id, "Failed to load stage runs to record failure: {}", e),
        }

        if let Err(e) = self
            .repository
            .update_pipeline_status(request.pipeline_id, RunStatus::Failed, now)
            .await
        {
            error!(pipeline_id = %request.pipeline_id, "Failed to update pipeline status: {}", e);
        }

        self.publish(
            EventKind::Failed,
            run_id,
            json!({
                "pipelineId": request.pipeline_id,
                "status": RunStatus::Failed,
                "error": error.to_string(),
            }),
        );
    }

    fn publish(&self, kind: EventKind, run_id: Uuid, payload: serde_json::Value) {
        self.broadcaster
            .publish(PipelineEvent::new(kind, run_id, payload));
    }

    fn lock_active(&self) -> MutexGuard<'_, HashMap<Uuid, CancellationToken>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl JobHandler for PipelineOrchestrator {
    async fn handle(&self, request: &ExecutionRequest) -> anyhow::Result<()> {
        self.execute(request).await?;
        Ok(())
    }

    async fn cancel(&self, run_id: Uuid) -> anyhow::Result<bool> {
        Ok(PipelineOrchestrator::cancel(self, run_id).await?)
    }
}

fn stage_metadata(result: &ExecutionResult, image: &str) -> serde_json::Value {
    json!({
        "image": image,
        "exitCode": result.exit_code,
        "containerId": result.container_id,
        "durationMs": u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX),
        "simulated": result.simulated,
    })
}

fn stage_history(stages: &[StageRun]) -> serde_json::Value {
    stages
        .iter()
        .map(|stage| {
            json!({
                "name": stage.name,
                "kind": stage.kind,
                "status": stage.status,
                "durationSeconds": stage.duration_seconds,
                "artifacts": stage.artifacts,
            })
        })
        .collect()
}
