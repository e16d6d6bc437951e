//! Engine wiring
//!
//! Builds the container executor, the orchestrator and the execution queue
//! from configuration and owns their lifecycle.

use anyhow::Context;
use comet_core::domain::event::PipelineEvent;
use comet_core::domain::run::PipelineRun;
use comet_core::domain::stage::StageRun;
use comet_core::dto::execution::ExecutionRequest;
use comet_core::dto::queue::JobOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::container::ContainerExecutor;
use crate::error::{OrchestratorError, QueueError, StoreError};
use crate::queue::{Enqueued, ExecutionQueue, InMemoryJobStore, JobStore};
use crate::repository::{InMemoryRunRepository, RunRepository};
use crate::service::{ChannelBroadcaster, PipelineOrchestrator, StageProfiles};

pub struct Engine {
    repository: Arc<dyn RunRepository>,
    executor: Arc<ContainerExecutor>,
    orchestrator: Arc<PipelineOrchestrator>,
    queue: Arc<ExecutionQueue>,
    events: Arc<ChannelBroadcaster>,
}

impl Engine {
    pub fn new(
        config: &EngineConfig,
        repository: Arc<dyn RunRepository>,
        store: Arc<dyn JobStore>,
    ) -> anyhow::Result<Self> {
        let profiles = match &config.stage_profiles_path {
            Some(path) => StageProfiles::from_file(path)?,
            None => StageProfiles::default(),
        };

        let executor = Arc::new(ContainerExecutor::new(config.executor.clone()));
        let events = Arc::new(ChannelBroadcaster::default());
        let orchestrator = Arc::new(PipelineOrchestrator::new(
            repository.clone(),
            executor.clone(),
            events.clone(),
            profiles,
        ));
        let queue = Arc::new(ExecutionQueue::new(
            store,
            orchestrator.clone(),
            config.queue.clone(),
        ));

        Ok(Self {
            repository,
            executor,
            orchestrator,
            queue,
            events,
        })
    }

    /// Engine backed by in-memory stores
    pub fn in_memory(config: &EngineConfig) -> anyhow::Result<Self> {
        Self::new(
            config,
            Arc::new(InMemoryRunRepository::new()),
            Arc::new(InMemoryJobStore::new()),
        )
        .context("Failed to build in-memory engine")
    }

    /// Starts the queue workers and the orphan sweep
    pub fn start(&self) {
        self.executor.start_orphan_sweep();
        self.queue.start();
        info!("Engine started");
    }

    /// Records a PENDING run when none exists yet and enqueues it
    pub async fn submit(
        &self,
        request: ExecutionRequest,
        options: Option<JobOptions>,
    ) -> Result<Enqueued, QueueError> {
        request.validate().map_err(QueueError::InvalidJob)?;

        let run_id = request.pipeline_run_id;
        if self.repository.find_run(run_id).await?.is_none() {
            let run = PipelineRun::pending(run_id, request.pipeline_id, request.triggered_by.clone());
            self.repository.create_run(&run).await?;
            debug!(run_id = %run_id, "Created pending run");
        }

        self.queue.enqueue(request, options).await
    }

    /// A run with its stage runs in start order
    pub async fn run_details(
        &self,
        run_id: Uuid,
    ) -> Result<Option<(PipelineRun, Vec<StageRun>)>, StoreError> {
        let Some(run) = self.repository.find_run(run_id).await? else {
            return Ok(None);
        };
        let stages = self.repository.list_stage_runs(run_id).await?;
        Ok(Some((run, stages)))
    }

    /// Cancels a run whether it is queued, running, or no longer has a job
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<bool, QueueError> {
        if self.queue.status(run_id).await?.is_some() {
            return self.queue.cancel(run_id).await;
        }

        match self.orchestrator.cancel(run_id).await {
            Ok(cancelled) => Ok(cancelled),
            Err(OrchestratorError::RunNotFound(_)) => Ok(false),
            Err(OrchestratorError::Store(e)) => Err(e.into()),
            Err(e @ OrchestratorError::AlreadyRunning(_)) => Err(QueueError::Handler(e.into())),
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub fn queue(&self) -> &Arc<ExecutionQueue> {
        &self.queue
    }

    pub fn orchestrator(&self) -> &Arc<PipelineOrchestrator> {
        &self.orchestrator
    }

    pub fn executor(&self) -> &Arc<ContainerExecutor> {
        &self.executor
    }

    /// Stops dispatch, waits up to `grace` for active runs, then tears down containers
    pub async fn shutdown(&self, grace: Duration) {
        info!("Shutting down engine");
        self.queue.shutdown(grace).await;
        self.executor.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeMode;
    use crate::queue::QueueEvent;
    use comet_core::domain::event::EventKind;
    use comet_core::domain::job::JobState;
    use comet_core::domain::pipeline::{StageDefinition, StageKind};
    use comet_core::domain::run::RunStatus;
    use comet_core::domain::stage::StageStatus;

    fn config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.executor.mode = RuntimeMode::Simulated;
        config.queue.poll_interval = Duration::from_millis(10);
        config.queue.backoff_base = Duration::from_millis(10);
        config
    }

    fn request() -> ExecutionRequest {
        ExecutionRequest {
            pipeline_id: Uuid::new_v4(),
            pipeline_run_id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            repository_url: "https://example.com/repo.git".to_string(),
            branch: "main".to_string(),
            stages: vec![
                StageDefinition::new("build", StageKind::Build, vec!["npm ci".to_string()]),
                StageDefinition::new("test", StageKind::Test, vec!["npm test".to_string()]),
            ],
            triggered_by: Some("alice".to_string()),
        }
    }

    #[tokio::test]
    async fn test_submitted_run_executes_end_to_end() {
        let engine = Engine::in_memory(&config()).unwrap();
        let mut queue_events = engine.queue().subscribe();
        let mut run_events = engine.subscribe_events();
        engine.start();

        let request = request();
        let run_id = request.pipeline_run_id;
        let enqueued = engine.submit(request, None).await.unwrap();
        assert!(enqueued.created);
        assert_eq!(enqueued.job.id, run_id);

        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Ok(QueueEvent::Completed { job_id, .. }) = queue_events.recv().await {
                    if job_id == run_id {
                        break;
                    }
                }
            }
        })
        .await
        .unwrap();

        let (run, stages) = engine.run_details(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.triggered_by.as_deref(), Some("alice"));
        assert_eq!(stages.len(), 2);
        assert!(stages.iter().all(|s| s.status == StageStatus::Success));
        assert!(stages[0].logs.contains("[SIMULATED] $ npm ci"));
        assert_eq!(stages[0].metadata["simulated"], true);

        let job = engine.queue().status(run_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(run_events.recv().await.unwrap().kind, EventKind::Started);

        engine.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_resubmit_keeps_single_run_and_job() {
        let engine = Engine::in_memory(&config()).unwrap();
        let request = request();

        assert!(engine.submit(request.clone(), None).await.unwrap().created);
        assert!(!engine.submit(request, None).await.unwrap().created);
        assert_eq!(engine.queue().stats().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_cancel_queued_run() {
        let engine = Engine::in_memory(&config()).unwrap();
        let request = request();
        let run_id = request.pipeline_run_id;
        engine.submit(request, None).await.unwrap();

        assert!(engine.cancel_run(run_id).await.unwrap());
        let (run, stages) = engine.run_details(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert!(stages.is_empty());
        assert!(engine.queue().status(run_id).await.unwrap().is_none());

        assert!(!engine.cancel_run(run_id).await.unwrap());
        assert!(!engine.cancel_run(Uuid::new_v4()).await.unwrap());
    }
}
