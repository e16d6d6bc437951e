//! Execution queue
//!
//! Durable, retrying, concurrency-bounded dispatcher of pipeline runs:
//! - Idempotent enqueue keyed by the pipeline run id
//! - A fixed number of worker slots, each busy for one whole run
//! - Exponential backoff between failed attempts
//! - Stall detection through renewable job locks
//! - Pause/resume, manual retry, cleanup and introspection

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryJobStore;
pub use postgres::PgJobStore;
pub use store::{JobStore, STALLED_EXHAUSTED_REASON, STALLED_REASON, StalledJob};

use async_trait::async_trait;
use chrono::Utc;
use comet_core::domain::job::{BackoffPolicy, JobState, QueuedJob};
use comet_core::dto::execution::ExecutionRequest;
use comet_core::dto::queue::{JobOptions, QueueStats};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, broadcast};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{QueueError, StoreError};

/// Work performed for each dequeued job
///
/// An `Err` from `handle` counts as a failed attempt; its full context chain
/// becomes the job's failure reason.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, request: &ExecutionRequest) -> anyhow::Result<()>;

    /// Cancels the run behind a job; false when there was nothing to cancel
    async fn cancel(&self, run_id: Uuid) -> anyhow::Result<bool>;
}

/// Job lifecycle notifications
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    Waiting {
        job_id: Uuid,
    },
    Active {
        job_id: Uuid,
        attempt: u32,
    },
    Completed {
        job_id: Uuid,
        attempt: u32,
    },
    Failed {
        job_id: Uuid,
        attempt: u32,
        reason: String,
        will_retry: bool,
    },
    /// A worker lost the job mid-processing
    Stalled {
        job_id: Uuid,
    },
    /// Queue infrastructure problem, not tied to a job attempt
    Error {
        message: String,
    },
}

/// Result of an enqueue request
#[derive(Debug, Clone)]
pub struct Enqueued {
    pub job: QueuedJob,
    /// False when a job with the same run id already existed
    pub created: bool,
}

pub struct ExecutionQueue {
    store: Arc<dyn JobStore>,
    handler: Arc<dyn JobHandler>,
    config: QueueConfig,
    slots: Arc<Semaphore>,
    wake: Notify,
    events: broadcast::Sender<QueueEvent>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ExecutionQueue {
    pub fn new(store: Arc<dyn JobStore>, handler: Arc<dyn JobHandler>, config: QueueConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            store,
            handler,
            slots: Arc::new(Semaphore::new(config.concurrency.max(1))),
            config,
            wake: Notify::new(),
            events,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Options applied to jobs enqueued without explicit ones
    pub fn default_options(&self) -> JobOptions {
        JobOptions {
            priority: 0,
            attempts: self.config.max_attempts,
            backoff: BackoffPolicy::Exponential {
                delay_ms: u64::try_from(self.config.backoff_base.as_millis()).unwrap_or(u64::MAX),
            },
        }
    }

    /// Adds a run to the queue
    ///
    /// Enqueueing a run id that is already stored, in any state, returns the
    /// existing job unchanged.
    pub async fn enqueue(
        &self,
        request: ExecutionRequest,
        options: Option<JobOptions>,
    ) -> Result<Enqueued, QueueError> {
        if self.shutdown.is_cancelled() {
            return Err(QueueError::ShutDown);
        }
        request.validate().map_err(QueueError::InvalidJob)?;

        let options = options.unwrap_or_else(|| self.default_options());
        let (job, created) = self.store.add(QueuedJob::new(request, &options)).await?;

        if created {
            info!(
                job_id = %job.id,
                pipeline_id = %job.payload.pipeline_id,
                priority = job.priority,
                state = %job.state,
                "Job enqueued"
            );
            self.emit(QueueEvent::Waiting { job_id: job.id });
            self.wake.notify_one();
        } else {
            debug!(job_id = %job.id, state = %job.state, "Job already queued, ignoring enqueue");
        }

        Ok(Enqueued { job, created })
    }

    pub async fn status(&self, run_id: Uuid) -> Result<Option<QueuedJob>, QueueError> {
        Ok(self.store.find(run_id).await?)
    }

    /// Cancels a queued or running job
    ///
    /// A job that is not active is removed from the queue. An active job keeps
    /// its worker; the run is cancelled cooperatively through the handler.
    pub async fn cancel(&self, run_id: Uuid) -> Result<bool, QueueError> {
        let Some(job) = self.store.find(run_id).await? else {
            return Ok(false);
        };

        if job.state == JobState::Active {
            info!(job_id = %run_id, "Cancelling active job");
            return self.handler.cancel(run_id).await.map_err(QueueError::Handler);
        }

        if !self.store.remove(run_id).await? {
            // Claimed by a worker in the meantime
            return self.handler.cancel(run_id).await.map_err(QueueError::Handler);
        }

        info!(job_id = %run_id, state = %job.state, "Removed job from queue");
        if let Err(e) = self.handler.cancel(run_id).await {
            warn!(job_id = %run_id, "Failed to cancel run of removed job: {:#}", e);
        }
        Ok(true)
    }

    /// Puts a FAILED job back in the queue with a fresh attempt budget
    pub async fn retry_failed(&self, run_id: Uuid) -> Result<bool, QueueError> {
        let retried = self.store.retry_failed(run_id).await?;
        if retried {
            info!(job_id = %run_id, "Retrying failed job");
            self.emit(QueueEvent::Waiting { job_id: run_id });
            self.wake.notify_one();
        }
        Ok(retried)
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        Ok(self.store.counts().await?)
    }

    pub async fn jobs(&self, state: JobState, limit: usize) -> Result<Vec<QueuedJob>, QueueError> {
        Ok(self.store.list(state, limit).await?)
    }

    pub async fn failed_jobs(&self, limit: usize) -> Result<Vec<QueuedJob>, QueueError> {
        self.jobs(JobState::Failed, limit).await
    }

    /// Stops dispatching new jobs; active jobs run to completion
    pub async fn pause(&self) -> Result<(), QueueError> {
        self.store.set_paused(true).await?;
        info!("Execution queue paused");
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), QueueError> {
        self.store.set_paused(false).await?;
        info!("Execution queue resumed");
        self.wake.notify_one();
        Ok(())
    }

    pub async fn is_paused(&self) -> Result<bool, QueueError> {
        Ok(self.store.is_paused().await?)
    }

    /// Deletes jobs in `state` older than `grace`, returning their ids
    pub async fn clean(&self, grace: Duration, state: JobState) -> Result<Vec<Uuid>, QueueError> {
        if state == JobState::Active {
            return Err(QueueError::InvalidJob("active jobs cannot be cleaned".to_string()));
        }

        let removed = self.store.clean(state, Utc::now() - to_delta(grace)).await?;
        info!(state = %state, removed = removed.len(), "Cleaned queue");
        Ok(removed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Returns expired ACTIVE jobs to the queue
    ///
    /// Runs periodically once the queue is started.
    pub async fn check_stalled(&self) -> Result<Vec<StalledJob>, QueueError> {
        let stalled = self
            .store
            .recover_stalled(Utc::now(), self.config.max_stalled_count)
            .await?;

        for job in &stalled {
            warn!(kind = "stalled", job_id = %job.id, failed = job.failed, "Job stalled");
            self.emit(QueueEvent::Stalled { job_id: job.id });

            if job.failed {
                let (attempt, reason) = match self.store.find(job.id).await? {
                    Some(stored) => (
                        stored.attempts_made,
                        stored.failed_reason.unwrap_or_else(|| STALLED_REASON.to_string()),
                    ),
                    None => (0, STALLED_REASON.to_string()),
                };
                error!(kind = "failed", job_id = %job.id, attempt, "Job failed: {}", reason);
                self.emit(QueueEvent::Failed {
                    job_id: job.id,
                    attempt,
                    reason,
                    will_retry: false,
                });
            }
        }

        if !stalled.is_empty() {
            self.wake.notify_one();
        }
        Ok(stalled)
    }

    /// Launches the dispatcher and the stall check loop
    pub fn start(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() {
            warn!("Execution queue is shut down, not starting");
            return;
        }

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if !tasks.is_empty() {
            debug!("Execution queue already started");
            return;
        }

        info!(
            concurrency = self.config.concurrency,
            max_attempts = self.config.max_attempts,
            "Starting execution queue"
        );

        let queue = Arc::clone(self);
        tasks.push(tokio::spawn(queue.dispatch_loop()));

        let queue = Arc::clone(self);
        tasks.push(tokio::spawn(queue.maintenance_loop()));
    }

    /// Stops dispatch and waits up to `grace` for active jobs to finish
    ///
    /// Jobs still running afterwards keep their lock until it expires and are
    /// then recovered as stalled.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.cancel();

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }

        let all_slots = u32::try_from(self.config.concurrency.max(1)).unwrap_or(u32::MAX);
        match time::timeout(grace, self.slots.acquire_many(all_slots)).await {
            Ok(Ok(_)) => info!("Execution queue stopped"),
            _ => warn!("Execution queue stopped with jobs still running"),
        }
        self.slots.close();
    }

    async fn dispatch_loop(self: Arc<Self>) {
        loop {
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let now = Utc::now();
            match self.store.fetch_next(now, now + to_delta(self.config.lock_duration)).await {
                Ok(Some(job)) => {
                    tokio::spawn(Arc::clone(&self).process(job, permit));
                    continue;
                }
                Ok(None) => drop(permit),
                Err(e) => {
                    drop(permit);
                    self.report_error(format!("Failed to fetch next job: {}", e));
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = time::sleep(self.config.poll_interval) => {}
            }
        }

        debug!("Dispatcher stopped");
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let mut ticker = time::interval(self.config.stalled_interval.max(Duration::from_millis(1)));

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.check_stalled().await {
                self.report_error(format!("Stall check failed: {}", e));
            }
        }
    }

    async fn process(self: Arc<Self>, job: QueuedJob, _permit: OwnedSemaphorePermit) {
        let job_id = job.id;
        let attempt = job.attempts_made;
        info!(job_id = %job_id, attempt, max_attempts = job.max_attempts, "Processing job");
        self.emit(QueueEvent::Active { job_id, attempt });

        let renewal = self.spawn_lock_renewal(job_id);

        // A panicking handler is contained in its own task and counted as a failed attempt
        let handler = Arc::clone(&self.handler);
        let payload = job.payload.clone();
        let outcome = tokio::spawn(async move { handler.handle(&payload).await }).await;
        renewal.abort();

        let result = match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("{:#}", e)),
            Err(e) => Err(format!("job handler panicked: {}", e)),
        };

        if let Err(e) = self.settle(&job, result).await {
            self.report_error(format!("Failed to record outcome of job {}: {}", job_id, e));
        }

        self.wake.notify_one();
    }

    async fn settle(self: &Arc<Self>, job: &QueuedJob, result: Result<(), String>) -> Result<(), StoreError> {
        let now = Utc::now();
        let job_id = job.id;
        let attempt = job.attempts_made;

        let settled = match result {
            Ok(()) => {
                let settled = self.store.complete(job_id, attempt, now).await?;
                if settled {
                    info!(job_id = %job_id, attempt, "Job completed");
                    self.emit(QueueEvent::Completed { job_id, attempt });
                }
                settled
            }
            Err(reason) if attempt < job.max_attempts => {
                let delay = job.backoff.delay_for(attempt);
                let settled = self
                    .store
                    .retry_later(job_id, attempt, &reason, now + to_delta(delay))
                    .await?;
                if settled {
                    warn!(
                        kind = "failed",
                        job_id = %job_id,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        "Job attempt failed: {}",
                        reason
                    );
                    self.emit(QueueEvent::Failed {
                        job_id,
                        attempt,
                        reason,
                        will_retry: true,
                    });
                    self.wake_after(delay);
                }
                settled
            }
            Err(reason) => {
                let settled = self.store.fail(job_id, attempt, &reason, now).await?;
                if settled {
                    error!(kind = "failed", job_id = %job_id, attempt, "Job failed: {}", reason);
                    self.emit(QueueEvent::Failed {
                        job_id,
                        attempt,
                        reason,
                        will_retry: false,
                    });
                }
                settled
            }
        };

        if !settled {
            warn!(job_id = %job_id, attempt, "Job was reclaimed before this attempt settled, dropping its outcome");
        }
        Ok(())
    }

    fn spawn_lock_renewal(self: &Arc<Self>, job_id: Uuid) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let period = (queue.config.lock_duration / 2).max(Duration::from_millis(1));
            let mut ticker = time::interval_at(time::Instant::now() + period, period);

            loop {
                ticker.tick().await;
                let until = Utc::now() + to_delta(queue.config.lock_duration);
                match queue.store.extend_lock(job_id, until).await {
                    Ok(true) => trace!(job_id = %job_id, "Renewed job lock"),
                    Ok(false) => {
                        warn!(job_id = %job_id, "Job is no longer active, stopping lock renewal");
                        break;
                    }
                    Err(e) => queue.report_error(format!("Failed to renew lock of job {}: {}", job_id, e)),
                }
            }
        })
    }

    /// Wakes the dispatcher once a delayed job becomes due
    fn wake_after(self: &Arc<Self>, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = queue.shutdown.cancelled() => {}
                _ = time::sleep(delay) => queue.wake.notify_one(),
            }
        });
    }

    fn report_error(&self, message: String) {
        error!(kind = "error", "{}", message);
        self.emit(QueueEvent::Error { message });
    }

    fn emit(&self, event: QueueEvent) {
        // No receivers is not an error
        let _ = self.events.send(event);
    }
}

fn to_delta(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
