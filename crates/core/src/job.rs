//! Inbound job envelope and its normalized form.
//!
//! Jobs arrive as `{ "id": "...", "input": { ... } }`. The `input` object
//! names a workflow in one of three ways and may carry parameter
//! overrides and a timeout:
//!
//! ```json
//! {
//!   "workflow_name": "wan-t2v",
//!   "prompt": "a lighthouse at dusk",
//!   "seed": 42,
//!   "lora": "action-lora/v1.safetensors",
//!   "timeout": 900
//! }
//! ```

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::error::CoreError;
use crate::workflow::{Graph, Overrides};

/// Default job timeout when the input does not specify one.
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Default named workflow when the input names none.
pub const DEFAULT_WORKFLOW_NAME: &str = "wan-t2v";

/// Maximum length of a workflow name.
pub const MAX_WORKFLOW_NAME_LENGTH: usize = 200;

/// Largest accepted job timeout (24 hours).
pub const MAX_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// A job as delivered by the dispatcher.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobEnvelope {
    /// Dispatcher-assigned job ID, echoed back in the response.
    #[serde(default)]
    pub id: Option<String>,
    /// Kept as raw JSON so that a malformed field becomes an error result
    /// of the job instead of a rejected envelope.
    #[serde(default)]
    pub input: Value,
}

/// Raw `input` object of a job, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobInput {
    /// Inline workflow graph.
    #[serde(default)]
    pub workflow: Option<Value>,
    /// Name of a workflow file (without `.json`) on the volume.
    #[serde(default)]
    pub workflow_name: Option<String>,
    /// Base64-encoded workflow JSON.
    #[serde(default)]
    pub workflow_base64: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub lora: Option<String>,
    /// Execution timeout in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl JobInput {
    /// Parse the raw `input` object. A missing or `null` input means all
    /// defaults.
    pub fn from_value(value: Value) -> Result<Self, CoreError> {
        match value {
            Value::Null => Ok(Self::default()),
            Value::Object(_) => serde_json::from_value(value)
                .map_err(|e| CoreError::Validation(format!("Malformed job input: {e}"))),
            _ => Err(CoreError::Validation(
                "Job input must be a JSON object".to_string(),
            )),
        }
    }
}

/// Where the workflow graph for a job comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowSource {
    /// Graph supplied directly in the job input.
    Inline(Graph),
    /// Base64 of the workflow JSON text; decoded during resolution.
    Base64(String),
    /// Workflow file looked up by name.
    Named(String),
}

/// Defaults applied to fields the job input leaves out.
#[derive(Debug, Clone)]
pub struct JobDefaults {
    pub workflow_name: String,
    pub timeout: Duration,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            workflow_name: DEFAULT_WORKFLOW_NAME.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

/// A validated job, ready for graph resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub source: WorkflowSource,
    pub overrides: Overrides,
    /// Upper bound on the wait for a terminal state, measured from submission.
    pub timeout: Duration,
}

impl JobRequest {
    /// Normalize a raw job input.
    ///
    /// Source priority: inline `workflow` object, then `workflow_base64`,
    /// then `workflow_name` (falling back to the configured default).
    pub fn from_input(input: JobInput, defaults: &JobDefaults) -> Result<Self, CoreError> {
        let source = match (input.workflow, input.workflow_base64) {
            (Some(Value::Object(obj)), _) => {
                WorkflowSource::Inline(Graph::from_value(Value::Object(obj))?)
            }
            (Some(Value::Null) | None, Some(encoded)) => WorkflowSource::Base64(encoded),
            (Some(Value::Null) | None, None) => {
                let name = input
                    .workflow_name
                    .unwrap_or_else(|| defaults.workflow_name.clone());
                validate_workflow_name(&name)?;
                WorkflowSource::Named(name.trim().to_string())
            }
            (Some(_), _) => {
                return Err(CoreError::InvalidWorkflow(
                    "'workflow' must be a JSON object".to_string(),
                ));
            }
        };

        let timeout = match input.timeout {
            Some(0) => {
                return Err(CoreError::Validation(
                    "'timeout' must be at least 1 second".to_string(),
                ));
            }
            Some(secs) if secs > MAX_TIMEOUT_SECS => {
                return Err(CoreError::Validation(format!(
                    "'timeout' must be at most {MAX_TIMEOUT_SECS} seconds, got {secs}"
                )));
            }
            Some(secs) => Duration::from_secs(secs),
            None => defaults.timeout,
        };

        Ok(Self {
            source,
            overrides: Overrides {
                prompt: input.prompt,
                seed: input.seed,
                lora: input.lora,
            },
            timeout,
        })
    }
}

/// Validate a workflow name: non-empty, bounded, and a plain file stem
/// (no path separators or parent references).
pub fn validate_workflow_name(name: &str) -> Result<(), CoreError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(CoreError::Validation(
            "Workflow name must not be empty".to_string(),
        ));
    }
    if trimmed.len() > MAX_WORKFLOW_NAME_LENGTH {
        return Err(CoreError::Validation(format!(
            "Workflow name must be at most {MAX_WORKFLOW_NAME_LENGTH} characters, got {}",
            trimmed.len()
        )));
    }
    if trimmed.contains(['/', '\\']) || trimmed.contains("..") {
        return Err(CoreError::Validation(format!(
            "Workflow name '{trimmed}' must not contain path components"
        )));
    }
    Ok(())
}
