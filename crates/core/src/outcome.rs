//! Job outcomes, produced artifacts, and the outbound result payload.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// File extensions treated as video even when ComfyUI reports them
/// under an `images` output.
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm", "mov", "mkv", "avi", "gif"];

/// Kind of a produced file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Image,
    Video,
}

impl ArtifactKind {
    /// Classify by file extension (case-insensitive).
    pub fn from_filename(filename: &str) -> Self {
        let is_video = filename
            .rsplit_once('.')
            .map(|(_, ext)| {
                VIDEO_EXTENSIONS
                    .iter()
                    .any(|v| v.eq_ignore_ascii_case(ext))
            })
            .unwrap_or(false);

        if is_video {
            Self::Video
        } else {
            Self::Image
        }
    }
}

/// A file the generation server declared as output, not yet read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRef {
    /// Node that produced the file.
    pub node_id: String,
    pub kind: ArtifactKind,
    pub filename: String,
    /// Subdirectory under the output directory; empty when none.
    pub subfolder: String,
    /// ComfyUI folder type (`output`, `temp`, `input`).
    pub folder_type: Option<String>,
}

/// Why a job failed inside the generation server.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionFailure {
    /// One-line description, e.g. `node 5 (RuntimeError): out of memory`.
    pub summary: String,
    /// Raw status messages reported by the server.
    pub messages: Value,
}

/// Terminal classification of a submitted job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Success {
        elapsed: Duration,
        outputs: Vec<OutputRef>,
    },
    ExecutionError {
        elapsed: Duration,
        detail: ExecutionFailure,
    },
    /// No terminal state before the deadline; `elapsed` is at least the
    /// configured timeout.
    Timeout { elapsed: Duration },
}

impl JobOutcome {
    pub fn elapsed(&self) -> Duration {
        match self {
            Self::Success { elapsed, .. }
            | Self::ExecutionError { elapsed, .. }
            | Self::Timeout { elapsed } => *elapsed,
        }
    }
}

/// One produced file in the job result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    #[serde(rename = "type")]
    pub kind: ArtifactKind,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subfolder: Option<String>,
    pub node_id: String,
    /// Absolute path on the shared volume.
    pub path: String,
    pub size_bytes: u64,
    /// Base64 of the file contents, only for files under the inline limit.
    #[serde(rename = "base64", default, skip_serializing_if = "Option::is_none")]
    pub encoded_payload: Option<String>,
    /// Set when the payload was omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Terminal status of a job result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Completed,
    Error,
}

/// Wall-clock timings reported with every result, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JobMetrics {
    /// Time this job spent waiting for the generation server to boot.
    pub comfy_boot_seconds: f64,
    /// Time from submission to terminal state.
    pub execution_seconds: f64,
    /// Time from job receipt to result.
    pub total_seconds: f64,
}

impl JobMetrics {
    pub fn new(boot: Duration, execution: Duration, total: Duration) -> Self {
        Self {
            comfy_boot_seconds: round2(boot),
            execution_seconds: round2(execution),
            total_seconds: round2(total),
        }
    }
}

fn round2(d: Duration) -> f64 {
    (d.as_secs_f64() * 100.0).round() / 100.0
}

/// Identity of the machine that ran the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub gpu: String,
    pub pod_id: String,
}

/// The single terminal payload returned for every job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub outputs: Vec<Artifact>,
    pub metrics: JobMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Structured error detail (e.g. the server's execution messages).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub worker: WorkerInfo,
}

impl JobResult {
    pub fn completed(
        prompt_id: String,
        outputs: Vec<Artifact>,
        metrics: JobMetrics,
        worker: WorkerInfo,
    ) -> Self {
        Self {
            status: JobStatus::Completed,
            prompt_id: Some(prompt_id),
            outputs,
            metrics,
            error: None,
            details: None,
            worker,
        }
    }

    /// An error result. Never carries outputs.
    pub fn failed(
        error: String,
        prompt_id: Option<String>,
        details: Option<Value>,
        metrics: JobMetrics,
        worker: WorkerInfo,
    ) -> Self {
        Self {
            status: JobStatus::Error,
            prompt_id,
            outputs: Vec::new(),
            metrics,
            error: Some(error),
            details,
            worker,
        }
    }
}
