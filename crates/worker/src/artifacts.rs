//! Reading produced files off the shared output directory.

use std::io;
use std::path::{Component, Path, PathBuf};

use base64::Engine as _;
use comfyrun_core::outcome::{Artifact, ArtifactKind, OutputRef};

/// ComfyUI folder type for previews, which never land in the output dir.
const TEMP_FOLDER_TYPE: &str = "temp";

/// Largest file size, per kind, whose contents are inlined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InlineLimits {
    pub image: u64,
    pub video: u64,
}

impl InlineLimits {
    pub fn for_kind(&self, kind: ArtifactKind) -> u64 {
        match kind {
            ArtifactKind::Image => self.image,
            ArtifactKind::Video => self.video,
        }
    }
}

/// Why a declared output did not become an artifact.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactSkip {
    #[error("preview output")]
    Preview,

    #[error("path escapes the output directory")]
    PathEscape,

    #[error("file not found at {}", .0.display())]
    Missing(PathBuf),

    #[error("failed to read {}: {source}", .path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Result of materializing one declared output.
#[derive(Debug)]
pub enum ArtifactRead {
    Read(Artifact),
    Skipped {
        output: OutputRef,
        reason: ArtifactSkip,
    },
}

/// Read every declared output under `output_dir`.
///
/// Nothing here fails the job: each output either becomes an [`Artifact`]
/// or is reported as skipped with its reason.
pub async fn materialize_artifacts(
    outputs: &[OutputRef],
    output_dir: &Path,
    limits: InlineLimits,
) -> Vec<ArtifactRead> {
    let mut reads = Vec::with_capacity(outputs.len());
    for output in outputs {
        let read = match materialize_one(output, output_dir, limits).await {
            Ok(artifact) => ArtifactRead::Read(artifact),
            Err(reason) => ArtifactRead::Skipped {
                output: output.clone(),
                reason,
            },
        };
        reads.push(read);
    }
    reads
}

/// Keep the artifacts, logging each skipped output.
pub fn collect_artifacts(reads: Vec<ArtifactRead>) -> Vec<Artifact> {
    reads
        .into_iter()
        .filter_map(|read| match read {
            ArtifactRead::Read(artifact) => Some(artifact),
            ArtifactRead::Skipped {
                reason: ArtifactSkip::Preview,
                ..
            } => None,
            ArtifactRead::Skipped { output, reason } => {
                tracing::warn!(
                    node_id = %output.node_id,
                    filename = %output.filename,
                    reason = %reason,
                    "Skipping output",
                );
                None
            }
        })
        .collect()
}

async fn materialize_one(
    output: &OutputRef,
    output_dir: &Path,
    limits: InlineLimits,
) -> Result<Artifact, ArtifactSkip> {
    if output.folder_type.as_deref() == Some(TEMP_FOLDER_TYPE) {
        return Err(ArtifactSkip::Preview);
    }

    let path = resolve_path(output_dir, &output.subfolder, &output.filename)
        .ok_or(ArtifactSkip::PathEscape)?;

    let metadata = match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => meta,
        Ok(_) => return Err(ArtifactSkip::Missing(path)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(ArtifactSkip::Missing(path)),
        Err(source) => return Err(ArtifactSkip::Unreadable { path, source }),
    };

    let size_bytes = metadata.len();
    let limit = limits.for_kind(output.kind);

    let (encoded_payload, note) = if size_bytes < limit {
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(source) => return Err(ArtifactSkip::Unreadable { path, source }),
        };
        (
            Some(base64::engine::general_purpose::STANDARD.encode(&bytes)),
            None,
        )
    } else {
        (
            None,
            Some(format!(
                "File too large to inline ({size_bytes} bytes, limit {limit}); fetch it from path"
            )),
        )
    };

    Ok(Artifact {
        kind: output.kind,
        filename: output.filename.clone(),
        subfolder: (!output.subfolder.is_empty()).then(|| output.subfolder.clone()),
        node_id: output.node_id.clone(),
        path: path.to_string_lossy().into_owned(),
        size_bytes,
        encoded_payload,
        note,
    })
}

/// `{output_dir}/{subfolder}/{filename}`, or `None` if either part is not
/// a plain relative path.
fn resolve_path(output_dir: &Path, subfolder: &str, filename: &str) -> Option<PathBuf> {
    let subfolder = Path::new(subfolder);
    let filename = Path::new(filename);

    let plain = |p: &Path| p.components().all(|c| matches!(c, Component::Normal(_)));
    if !plain(subfolder) || !plain(filename) || filename.components().count() != 1 {
        return None;
    }

    Some(output_dir.join(subfolder).join(filename))
}
