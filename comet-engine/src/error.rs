//! Error types for the engine

use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the persistence layer
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored value could not be mapped back to a domain type
    #[error("corrupt stored value: {0}")]
    Corrupt(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
}

/// Errors that abort a pipeline run outside of stage execution
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("pipeline run {0} not found")]
    RunNotFound(Uuid),

    /// Another attempt of the same run is executing in this process
    #[error("pipeline run {0} is already executing")]
    AlreadyRunning(Uuid),
}

/// Errors surfaced by the execution queue API
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("job handler error: {0:#}")]
    Handler(anyhow::Error),

    #[error("execution queue is shut down")]
    ShutDown,
}

/// Errors raised while talking to the container runtime outside a stage
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to invoke container runtime `{binary}`: {source}")]
    Runtime {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("container runtime `{binary}` failed: {message}")]
    Command { binary: String, message: String },
}
