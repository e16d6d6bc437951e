//! Execution request DTO

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::pipeline::StageDefinition;

/// Full execution context of one pipeline run
///
/// Produced by trigger routes (CRUD, webhook, schedule) and stored verbatim
/// as the payload of the queued job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub pipeline_id: Uuid,
    pub pipeline_run_id: Uuid,
    pub project_id: Uuid,
    pub repository_url: String,
    pub branch: String,
    pub stages: Vec<StageDefinition>,
    #[serde(default)]
    pub triggered_by: Option<String>,
}

impl ExecutionRequest {
    /// Checks the request before it is accepted into the queue
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for stage in &self.stages {
            if stage.name.trim().is_empty() {
                return Err("stage name cannot be empty".to_string());
            }
            if !seen.insert(stage.name.as_str()) {
                return Err(format!("duplicate stage name '{}'", stage.name));
            }
        }
        Ok(())
    }
}
