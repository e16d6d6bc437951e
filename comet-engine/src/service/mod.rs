//! Service Layer
//!
//! Pipeline execution logic on top of the repository and the container
//! executor.

pub mod broadcast;
pub mod orchestrator;
pub mod profiles;

pub use broadcast::{ChannelBroadcaster, EventBroadcaster};
pub use orchestrator::PipelineOrchestrator;
pub use profiles::{StageProfile, StageProfiles};
