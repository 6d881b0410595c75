//! Job runner: drives one job from raw input to a terminal result.
//!
//! ```text
//! input -> JobRequest -> graph (+ overrides) -> boot -> submit -> poll -> artifacts
//! ```
//!
//! Jobs run strictly one at a time. Every failure becomes an error
//! [`JobResult`]; [`JobRunner::run`] itself never fails.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use comfyrun_comfyui::history::EntryState;
use comfyrun_comfyui::server::GenerationServer;
use comfyrun_comfyui::supervisor::BootSupervisor;
use comfyrun_core::job::{JobDefaults, JobInput, JobRequest};
use comfyrun_core::outcome::{Artifact, JobMetrics, JobOutcome, JobResult, WorkerInfo};
use comfyrun_core::workflow::apply_overrides;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::artifacts::{collect_artifacts, materialize_artifacts, InlineLimits};
use crate::config::WorkerConfig;
use crate::error::JobError;
use crate::workflows::{resolve_graph, WorkflowDirs};

/// How often a progress line is logged while a job is running.
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Knobs of the job runner, usually derived from [`WorkerConfig`].
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub defaults: JobDefaults,
    pub workflow_dirs: WorkflowDirs,
    /// Directory ComfyUI writes outputs into.
    pub output_dir: PathBuf,
    pub inline_limits: InlineLimits,
    pub poll_interval: Duration,
    pub worker: WorkerInfo,
}

impl RunnerSettings {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            defaults: config.job_defaults(),
            workflow_dirs: config.workflow_dirs(),
            output_dir: config.output_dir(),
            inline_limits: config.inline_limits(),
            poll_interval: config.job_poll_interval,
            worker: config.worker_info(),
        }
    }
}

/// Timings and identifiers gathered while a job progresses, so that error
/// results can still report them.
#[derive(Debug, Default)]
struct JobTrace {
    boot: Duration,
    execution: Duration,
    prompt_id: Option<String>,
}

pub struct JobRunner {
    supervisor: Arc<BootSupervisor>,
    server: Arc<dyn GenerationServer>,
    settings: RunnerSettings,
    job_lock: Mutex<()>,
}

impl JobRunner {
    pub fn new(
        supervisor: Arc<BootSupervisor>,
        server: Arc<dyn GenerationServer>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            supervisor,
            server,
            settings,
            job_lock: Mutex::new(()),
        }
    }

    pub fn supervisor(&self) -> &BootSupervisor {
        &self.supervisor
    }

    /// Run one job to its terminal result. `input` is the raw `input`
    /// object of the job envelope.
    pub async fn run(&self, job_id: &str, input: Value) -> JobResult {
        let _guard = self.job_lock.lock().await;
        let received = Instant::now();
        let mut trace = JobTrace::default();

        tracing::info!(job_id, "Job started");
        let result = self.execute(input, &mut trace).await;
        let metrics = JobMetrics::new(trace.boot, trace.execution, received.elapsed());
        let worker = self.settings.worker.clone();

        match result {
            Ok(outputs) => {
                tracing::info!(
                    job_id,
                    prompt_id = trace.prompt_id.as_deref().unwrap_or_default(),
                    outputs = outputs.len(),
                    total_secs = metrics.total_seconds,
                    "Job completed",
                );
                JobResult::completed(
                    trace.prompt_id.unwrap_or_default(),
                    outputs,
                    metrics,
                    worker,
                )
            }
            Err(e) => {
                tracing::error!(
                    job_id,
                    prompt_id = ?trace.prompt_id,
                    error = %e,
                    "Job failed",
                );
                JobResult::failed(e.to_string(), trace.prompt_id, e.details(), metrics, worker)
            }
        }
    }

    async fn execute(&self, input: Value, trace: &mut JobTrace) -> Result<Vec<Artifact>, JobError> {
        let request = JobRequest::from_input(JobInput::from_value(input)?, &self.settings.defaults)?;

        let mut graph = resolve_graph(request.source, &self.settings.workflow_dirs).await?;
        let applied = apply_overrides(&mut graph, &request.overrides);
        tracing::info!(
            nodes = graph.len(),
            prompt_node = ?applied.prompt_node,
            seed_node = ?applied.seed_node,
            lora_node = ?applied.lora_node,
            "Workflow prepared",
        );

        trace.boot = self.supervisor.ensure_started().await?;

        let prompt_id = self.server.submit(&graph).await?;
        tracing::info!(prompt_id = %prompt_id, timeout_secs = request.timeout.as_secs(), "Workflow submitted");
        trace.prompt_id = Some(prompt_id.clone());

        let outcome = await_outcome(
            self.server.as_ref(),
            &prompt_id,
            request.timeout,
            self.settings.poll_interval,
        )
        .await;
        trace.execution = outcome.elapsed();

        match outcome {
            JobOutcome::Success { outputs, .. } => {
                let reads = materialize_artifacts(
                    &outputs,
                    &self.settings.output_dir,
                    self.settings.inline_limits,
                )
                .await;
                Ok(collect_artifacts(reads))
            }
            JobOutcome::ExecutionError { detail, .. } => Err(JobError::Execution(detail)),
            JobOutcome::Timeout { .. } => Err(JobError::Timeout {
                timeout_secs: request.timeout.as_secs(),
            }),
        }
    }
}

/// Poll the server's history for `prompt_id` until it is terminal or
/// `timeout` has passed since the call.
///
/// An error entry or an entry with outputs ends the wait on the poll that
/// sees it. Transport errors are logged and retried until the deadline.
/// A timeout beyond the clock's range never expires.
pub async fn await_outcome(
    server: &dyn GenerationServer,
    prompt_id: &str,
    timeout: Duration,
    poll_interval: Duration,
) -> JobOutcome {
    let start = Instant::now();
    let deadline = start.checked_add(timeout);
    let mut last_report = start;

    loop {
        match server.history(prompt_id).await {
            Ok(Some(entry)) => match entry.state() {
                EntryState::Failed(detail) => {
                    return JobOutcome::ExecutionError {
                        elapsed: start.elapsed(),
                        detail,
                    };
                }
                EntryState::Completed(outputs) => {
                    return JobOutcome::Success {
                        elapsed: start.elapsed(),
                        outputs,
                    };
                }
                EntryState::Pending => {}
            },
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(prompt_id, error = %e, "History poll failed, retrying");
            }
        }

        let now = Instant::now();
        if deadline.is_some_and(|deadline| now >= deadline) {
            tracing::warn!(prompt_id, timeout_secs = timeout.as_secs(), "Workflow timed out");
            return JobOutcome::Timeout {
                elapsed: now.duration_since(start),
            };
        }

        if now.duration_since(last_report) >= PROGRESS_LOG_INTERVAL {
            tracing::info!(
                prompt_id,
                elapsed_secs = now.duration_since(start).as_secs(),
                "Workflow still running",
            );
            last_report = now;
        }

        let remaining = deadline.map_or(poll_interval, |deadline| deadline - now);
        tokio::time::sleep(poll_interval.min(remaining)).await;
    }
}
