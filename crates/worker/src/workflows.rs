//! Resolution of a job's workflow source into a validated graph.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use comfyrun_core::job::WorkflowSource;
use comfyrun_core::workflow::Graph;
use serde_json::Value;

use crate::error::JobError;

/// File extension of named workflow files.
const WORKFLOW_EXTENSION: &str = "json";

/// Where named workflows are looked up, in order.
#[derive(Debug, Clone)]
pub struct WorkflowDirs {
    pub primary: PathBuf,
    pub fallback: PathBuf,
}

impl WorkflowDirs {
    fn iter(&self) -> impl Iterator<Item = &Path> {
        [self.primary.as_path(), self.fallback.as_path()].into_iter()
    }
}

/// Turn a workflow source into a graph.
///
/// Named workflows are read from `{primary}/{name}.json`, then
/// `{fallback}/{name}.json`. When neither exists the error lists every
/// workflow name available in either directory.
pub async fn resolve_graph(source: WorkflowSource, dirs: &WorkflowDirs) -> Result<Graph, JobError> {
    match source {
        WorkflowSource::Inline(graph) => Ok(graph),
        WorkflowSource::Base64(encoded) => decode_base64(&encoded),
        WorkflowSource::Named(name) => load_named(&name, dirs).await,
    }
}

fn decode_base64(encoded: &str) -> Result<Graph, JobError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| JobError::InvalidWorkflow(format!("workflow_base64 is not valid base64: {e}")))?;
    let value: Value = serde_json::from_slice(&bytes)
        .map_err(|e| JobError::InvalidWorkflow(format!("workflow_base64 is not valid JSON: {e}")))?;
    Ok(Graph::from_value(value)?)
}

async fn load_named(name: &str, dirs: &WorkflowDirs) -> Result<Graph, JobError> {
    let file_name = format!("{name}.{WORKFLOW_EXTENSION}");

    for dir in dirs.iter() {
        let path = dir.join(&file_name);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => {
                return Err(JobError::InvalidWorkflow(format!(
                    "Failed to read {}: {e}",
                    path.display()
                )));
            }
        };

        tracing::info!(workflow = %name, path = %path.display(), "Loaded workflow");
        let value: Value = serde_json::from_slice(&bytes).map_err(|e| {
            JobError::InvalidWorkflow(format!("{} is not valid JSON: {e}", path.display()))
        })?;
        return Ok(Graph::from_value(value)?);
    }

    let mut available = BTreeSet::new();
    for dir in dirs.iter() {
        available.extend(list_workflows(dir).await);
    }

    Err(JobError::WorkflowNotFound {
        name: name.to_string(),
        available: available.into_iter().collect(),
    })
}

/// Stems of the `*.json` files directly inside `dir`. Unreadable
/// directories yield nothing.
async fn list_workflows(dir: &Path) -> Vec<String> {
    let mut names = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return names;
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(WORKFLOW_EXTENSION) {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            names.push(stem.to_string());
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use base64::Engine as _;

    use super::*;

    const GRAPH: &str = r#"{"3":{"class_type":"KSampler","inputs":{"seed":1}}}"#;

    fn dirs(root: &Path) -> WorkflowDirs {
        let primary = root.join("workflow");
        let fallback = root.join("fallback");
        std::fs::create_dir_all(&primary).unwrap();
        std::fs::create_dir_all(&fallback).unwrap();
        WorkflowDirs { primary, fallback }
    }

    #[tokio::test]
    async fn named_workflow_prefers_primary() {
        let tmp = tempfile::tempdir().unwrap();
        let d = dirs(tmp.path());
        std::fs::write(d.primary.join("wan-t2v.json"), GRAPH).unwrap();
        std::fs::write(d.fallback.join("wan-t2v.json"), "not json").unwrap();

        let graph = resolve_graph(WorkflowSource::Named("wan-t2v".into()), &d)
            .await
            .unwrap();
        assert_eq!(graph.class_type("3"), Some("KSampler"));
    }

    #[tokio::test]
    async fn named_workflow_falls_back() {
        let tmp = tempfile::tempdir().unwrap();
        let d = dirs(tmp.path());
        std::fs::write(d.fallback.join("flux.json"), GRAPH).unwrap();

        let graph = resolve_graph(WorkflowSource::Named("flux".into()), &d)
            .await
            .unwrap();
        assert_eq!(graph.len(), 1);
    }

    #[tokio::test]
    async fn not_found_lists_sorted_unique_names() {
        let tmp = tempfile::tempdir().unwrap();
        let d = dirs(tmp.path());
        std::fs::write(d.primary.join("wan-t2v.json"), GRAPH).unwrap();
        std::fs::write(d.primary.join("README.md"), "docs").unwrap();
        std::fs::write(d.fallback.join("wan-t2v.json"), GRAPH).unwrap();
        std::fs::write(d.fallback.join("flux-dev.json"), GRAPH).unwrap();

        let err = resolve_graph(WorkflowSource::Named("missing".into()), &d)
            .await
            .unwrap_err();
        let available = assert_matches!(
            err,
            JobError::WorkflowNotFound { name, available } if name == "missing" => available
        );
        assert_eq!(available, vec!["flux-dev", "wan-t2v"]);
    }

    #[tokio::test]
    async fn missing_directories_list_nothing() {
        let d = WorkflowDirs {
            primary: PathBuf::from("/nonexistent/a"),
            fallback: PathBuf::from("/nonexistent/b"),
        };
        let err = resolve_graph(WorkflowSource::Named("x".into()), &d)
            .await
            .unwrap_err();
        assert_matches!(err, JobError::WorkflowNotFound { available, .. } if available.is_empty());
    }

    #[tokio::test]
    async fn invalid_file_is_invalid_workflow() {
        let tmp = tempfile::tempdir().unwrap();
        let d = dirs(tmp.path());
        std::fs::write(d.primary.join("broken.json"), "{").unwrap();
        std::fs::write(d.primary.join("empty.json"), "{}").unwrap();

        for name in ["broken", "empty"] {
            let err = resolve_graph(WorkflowSource::Named(name.into()), &d)
                .await
                .unwrap_err();
            assert_matches!(err, JobError::InvalidWorkflow(_));
        }
    }

    #[tokio::test]
    async fn base64_source_is_decoded() {
        let d = WorkflowDirs {
            primary: PathBuf::from("/nonexistent"),
            fallback: PathBuf::from("/nonexistent"),
        };
        let encoded = base64::engine::general_purpose::STANDARD.encode(GRAPH);

        let graph = resolve_graph(WorkflowSource::Base64(encoded), &d).await.unwrap();
        assert_eq!(graph.class_type("3"), Some("KSampler"));

        let err = resolve_graph(WorkflowSource::Base64("%%%".into()), &d)
            .await
            .unwrap_err();
        assert_matches!(err, JobError::InvalidWorkflow(_));
    }
}
