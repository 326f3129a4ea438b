//! Generate → review → publish workflow.
//!
//! [`orchestrator::WorkflowOrchestrator`] is the only writer of
//! [`GenerationJob`](crate::models::job::GenerationJob) records. Every state
//! change goes through [`state_machine::transition`].

pub mod orchestrator;
pub mod publisher;
pub mod retry;
pub mod state_machine;

pub use orchestrator::{OrchestratorConfig, PublishParams, WorkflowOrchestrator};
pub use publisher::PullRequestPublisher;
pub use retry::RetryPolicy;

use std::time::Duration;

use thiserror::Error;

use crate::generation::GenerationError;
use crate::models::job::{FailureKind, JobState};
use crate::provider::ProviderError;
use crate::store::StoreError;

/// Workflow errors.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Cannot {action} a job in state '{state}'")]
    InvalidState { state: JobState, action: &'static str },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl WorkflowError {
    /// Classification recorded on a failed job.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            WorkflowError::NotFound(_) => FailureKind::NotFound,
            WorkflowError::Timeout(_) => FailureKind::Timeout,
            WorkflowError::Conflict(_) => FailureKind::Conflict,
            WorkflowError::Validation(_) => FailureKind::Validation,
            _ => FailureKind::Upstream,
        }
    }
}

impl From<ProviderError> for WorkflowError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::NotFound(msg) => WorkflowError::NotFound(msg),
            ProviderError::Timeout(after) => WorkflowError::Timeout(after),
            other => WorkflowError::Upstream(other.to_string()),
        }
    }
}

impl From<GenerationError> for WorkflowError {
    fn from(e: GenerationError) -> Self {
        match e {
            GenerationError::Timeout(after) => WorkflowError::Timeout(after),
            other => WorkflowError::Upstream(other.to_string()),
        }
    }
}
