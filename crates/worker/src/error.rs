//! Failure taxonomy of a single job.
//!
//! Every variant ends up as an error [`JobResult`](comfyrun_core::outcome::JobResult);
//! none of them escapes the job boundary.

use comfyrun_comfyui::api::ComfyUIApiError;
use comfyrun_comfyui::supervisor::BootError;
use comfyrun_core::error::CoreError;
use comfyrun_core::outcome::ExecutionFailure;
use serde_json::{json, Value};

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// ComfyUI never became ready.
    #[error("ComfyUI failed to start: {0}")]
    Boot(#[from] BootError),

    #[error("Workflow '{name}' not found. Available: {available:?}")]
    WorkflowNotFound { name: String, available: Vec<String> },

    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// ComfyUI rejected or never acknowledged the submission.
    #[error("Workflow submission failed: {0}")]
    Submission(#[from] ComfyUIApiError),

    #[error("Workflow execution error: {}", .0.summary)]
    Execution(ExecutionFailure),

    #[error("Workflow execution timeout after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },
}

impl From<CoreError> for JobError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidWorkflow(msg) => Self::InvalidWorkflow(msg),
            CoreError::Validation(msg) => Self::InvalidInput(msg),
        }
    }
}

impl JobError {
    /// Structured detail for the result's `details` field.
    pub fn details(&self) -> Option<Value> {
        match self {
            Self::WorkflowNotFound { name, available } => Some(json!({
                "workflow_name": name,
                "available": available,
            })),
            Self::Submission(ComfyUIApiError::ApiError { status, body }) => Some(json!({
                "http_status": status,
                "body": body,
            })),
            Self::Submission(ComfyUIApiError::Request(e)) => Some(json!({
                "transport_error": e.to_string(),
                "http_status": e.status().map(|status| status.as_u16()),
                "timed_out": e.is_timeout(),
                "connect_failed": e.is_connect(),
            })),
            Self::Submission(ComfyUIApiError::MissingPromptId { body }) => Some(json!({
                "body": body,
            })),
            Self::Execution(failure) => Some(json!({
                "summary": failure.summary,
                "messages": failure.messages,
            })),
            Self::Timeout { timeout_secs } => Some(json!({ "timeout_seconds": timeout_secs })),
            _ => None,
        }
    }
}
