//! ComfyUI history entries and their classification.
//!
//! `GET /history/{prompt_id}` returns nothing for a prompt until it reaches
//! a terminal state. Once present, an entry looks like:
//!
//! ```json
//! {
//!   "status": { "status_str": "success", "completed": true, "messages": [...] },
//!   "outputs": { "9": { "images": [{ "filename": "a.png", "subfolder": "", "type": "output" }] } }
//! }
//! ```

use comfyrun_core::outcome::{ArtifactKind, ExecutionFailure, OutputRef};
use serde::Deserialize;
use serde_json::{Map, Value};

/// `status_str` value ComfyUI uses for a failed prompt.
const STATUS_ERROR: &str = "error";

/// Status message kind carrying the failing node and exception.
const MSG_EXECUTION_ERROR: &str = "execution_error";

/// One entry of the history endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub status: Option<ExecutionStatus>,
    /// Per-node outputs, keyed by node ID. Kept raw so that one odd node
    /// does not hide the others.
    #[serde(default)]
    pub outputs: Option<Map<String, Value>>,
}

/// `status` block of a history entry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutionStatus {
    #[serde(default)]
    pub status_str: Option<String>,
    #[serde(default)]
    pub completed: bool,
    /// `[kind, payload]` pairs, e.g. `["execution_error", {...}]`.
    #[serde(default)]
    pub messages: Vec<Value>,
}

/// File lists produced by a single node.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeOutput {
    #[serde(default)]
    pub images: Vec<FileRef>,
    #[serde(default)]
    pub gifs: Vec<FileRef>,
    #[serde(default)]
    pub videos: Vec<FileRef>,
}

/// A file reference inside a node output.
#[derive(Debug, Clone, Deserialize)]
pub struct FileRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default)]
    pub folder_type: Option<String>,
}

/// Payload of an `execution_error` status message.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub node_type: Option<String>,
    #[serde(default)]
    pub exception_message: String,
    #[serde(default)]
    pub exception_type: String,
}

/// What a poll of the history endpoint tells us about a prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryState {
    /// Not terminal yet.
    Pending,
    Failed(ExecutionFailure),
    Completed(Vec<OutputRef>),
}

impl HistoryEntry {
    /// Classify this entry. The error marker wins over any outputs.
    pub fn state(&self) -> EntryState {
        if let Some(status) = &self.status {
            if status.status_str.as_deref() == Some(STATUS_ERROR) {
                return EntryState::Failed(status.failure());
            }
        }

        match &self.outputs {
            Some(outputs) => EntryState::Completed(collect_outputs(outputs)),
            None => EntryState::Pending,
        }
    }
}

impl ExecutionStatus {
    fn failure(&self) -> ExecutionFailure {
        let summary = self
            .execution_error()
            .map(|err| {
                let node = err.node_id.as_deref().unwrap_or("?");
                match err.node_type.as_deref() {
                    Some(node_type) => format!(
                        "node {node} [{node_type}] ({}): {}",
                        err.exception_type, err.exception_message
                    ),
                    None => format!(
                        "node {node} ({}): {}",
                        err.exception_type, err.exception_message
                    ),
                }
            })
            .unwrap_or_else(|| "Workflow execution error".to_string());

        ExecutionFailure {
            summary,
            messages: Value::Array(self.messages.clone()),
        }
    }

    /// The first `execution_error` message payload, if any.
    fn execution_error(&self) -> Option<ErrorData> {
        self.messages.iter().find_map(|msg| {
            let pair = msg.as_array()?;
            if pair.first()?.as_str()? != MSG_EXECUTION_ERROR {
                return None;
            }
            serde_json::from_value(pair.get(1)?.clone()).ok()
        })
    }
}

/// Flatten per-node outputs into file references, in node order.
fn collect_outputs(outputs: &Map<String, Value>) -> Vec<OutputRef> {
    let mut refs = Vec::new();

    for (node_id, raw) in outputs {
        let node: NodeOutput = match serde_json::from_value(raw.clone()) {
            Ok(node) => node,
            Err(e) => {
                tracing::warn!(node_id = %node_id, error = %e, "Ignoring unparseable node output");
                continue;
            }
        };

        let images = node
            .images
            .into_iter()
            .map(|f| (ArtifactKind::from_filename(&f.filename), f));
        let videos = node
            .gifs
            .into_iter()
            .chain(node.videos)
            .map(|f| (ArtifactKind::Video, f));

        refs.extend(images.chain(videos).map(|(kind, f)| OutputRef {
            node_id: node_id.clone(),
            kind,
            filename: f.filename,
            subfolder: f.subfolder,
            folder_type: f.folder_type,
        }));
    }

    refs
}
