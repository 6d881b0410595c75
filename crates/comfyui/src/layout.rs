//! Filesystem prerequisites for the ComfyUI install.
//!
//! Model weights, custom nodes, and outputs live on the shared network
//! volume; the install directory only holds symlinks to them. The scratch
//! directory must stay local.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;

/// Install subdirectories that are redirected to the network volume.
pub const VOLUME_LINKED_DIRS: &[&str] = &["models", "custom_nodes", "output"];

/// Errors from preparing the directory layout.
#[derive(Debug, thiserror::Error)]
pub enum LayoutError {
    #[error("Filesystem operation on {path} failed: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A symlink `link -> target` the layout must contain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeLink {
    pub link: PathBuf,
    pub target: PathBuf,
}

/// Directory layout the generation server expects before launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub links: Vec<VolumeLink>,
    /// Real directory the server writes previews into.
    pub scratch_dir: PathBuf,
}

impl Layout {
    /// Standard layout: `{comfy_dir}/{name}` links to
    /// `{volume_dir}/ComfyUI/{name}` for each of [`VOLUME_LINKED_DIRS`],
    /// with `{comfy_dir}/temp` as scratch.
    pub fn comfy_default(comfy_dir: &Path, volume_dir: &Path) -> Self {
        let links = VOLUME_LINKED_DIRS
            .iter()
            .map(|name| VolumeLink {
                link: comfy_dir.join(name),
                target: volume_dir.join("ComfyUI").join(name),
            })
            .collect();

        Self {
            links,
            scratch_dir: comfy_dir.join("temp"),
        }
    }

    /// Create every link and the scratch directory.
    ///
    /// Idempotent: correct links are left alone, wrong links and real
    /// directories or files in a link's place are replaced.
    pub async fn prepare(&self) -> Result<(), LayoutError> {
        for link in &self.links {
            ensure_link(link).await?;
        }
        ensure_scratch_dir(&self.scratch_dir).await
    }
}

async fn ensure_link(link: &VolumeLink) -> Result<(), LayoutError> {
    let VolumeLink { link, target } = link;

    fs::create_dir_all(target).await.map_err(io_at(target))?;

    match fs::symlink_metadata(link).await {
        Ok(meta) if meta.file_type().is_symlink() => {
            let current = fs::read_link(link).await.map_err(io_at(link))?;
            if current == *target {
                tracing::debug!(link = %link.display(), "Volume link already in place");
                return Ok(());
            }
            fs::remove_file(link).await.map_err(io_at(link))?;
        }
        Ok(meta) if meta.is_dir() => {
            tracing::warn!(link = %link.display(), "Replacing local directory with volume link");
            fs::remove_dir_all(link).await.map_err(io_at(link))?;
        }
        Ok(_) => {
            fs::remove_file(link).await.map_err(io_at(link))?;
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(io_at(link)(e)),
    }

    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent).await.map_err(io_at(parent))?;
    }
    symlink_dir(target, link).await.map_err(io_at(link))?;

    tracing::info!(
        link = %link.display(),
        target = %target.display(),
        "Created volume link",
    );
    Ok(())
}

async fn ensure_scratch_dir(dir: &Path) -> Result<(), LayoutError> {
    if let Ok(meta) = fs::symlink_metadata(dir).await {
        if meta.file_type().is_symlink() {
            fs::remove_file(dir).await.map_err(io_at(dir))?;
        }
    }
    fs::create_dir_all(dir).await.map_err(io_at(dir))
}

#[cfg(unix)]
async fn symlink_dir(target: &Path, link: &Path) -> io::Result<()> {
    fs::symlink(target, link).await
}

#[cfg(windows)]
async fn symlink_dir(target: &Path, link: &Path) -> io::Result<()> {
    fs::symlink_dir(target, link).await
}

fn io_at(path: &Path) -> impl FnOnce(io::Error) -> LayoutError + '_ {
    move |source| LayoutError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn layout(root: &Path) -> Layout {
        Layout::comfy_default(&root.join("ComfyUI"), &root.join("volume"))
    }

    #[test]
    fn default_layout_paths() {
        let l = Layout::comfy_default(Path::new("/ComfyUI"), Path::new("/runpod-volume"));
        assert_eq!(l.links.len(), 3);
        assert_eq!(l.links[0].link, PathBuf::from("/ComfyUI/models"));
        assert_eq!(
            l.links[0].target,
            PathBuf::from("/runpod-volume/ComfyUI/models")
        );
        assert_eq!(l.scratch_dir, PathBuf::from("/ComfyUI/temp"));
    }

    #[tokio::test]
    async fn prepare_creates_links_and_scratch() {
        let tmp = tempfile::tempdir().unwrap();
        let l = layout(tmp.path());

        l.prepare().await.unwrap();

        for link in &l.links {
            assert_eq!(std::fs::read_link(&link.link).unwrap(), link.target);
            assert!(link.target.is_dir());
        }
        let scratch = std::fs::symlink_metadata(&l.scratch_dir).unwrap();
        assert!(scratch.is_dir());
        assert!(!scratch.file_type().is_symlink());
    }

    #[tokio::test]
    async fn prepare_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let l = layout(tmp.path());

        l.prepare().await.unwrap();
        std::fs::write(l.links[2].target.join("keep.png"), b"x").unwrap();
        l.prepare().await.unwrap();

        assert!(l.links[2].link.join("keep.png").exists());
    }

    #[tokio::test]
    async fn wrong_link_and_local_dir_are_replaced() {
        let tmp = tempfile::tempdir().unwrap();
        let l = layout(tmp.path());
        let elsewhere = tmp.path().join("elsewhere");
        std::fs::create_dir_all(&elsewhere).unwrap();
        std::fs::create_dir_all(tmp.path().join("ComfyUI")).unwrap();

        std::os::unix::fs::symlink(&elsewhere, &l.links[0].link).unwrap();
        std::fs::create_dir_all(l.links[1].link.join("stale")).unwrap();

        l.prepare().await.unwrap();

        assert_eq!(std::fs::read_link(&l.links[0].link).unwrap(), l.links[0].target);
        assert_eq!(std::fs::read_link(&l.links[1].link).unwrap(), l.links[1].target);
        assert!(elsewhere.is_dir());
    }

    #[tokio::test]
    async fn symlinked_scratch_becomes_real_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let l = layout(tmp.path());
        let shared = tmp.path().join("shared-temp");
        std::fs::create_dir_all(&shared).unwrap();
        std::fs::create_dir_all(tmp.path().join("ComfyUI")).unwrap();
        std::os::unix::fs::symlink(&shared, &l.scratch_dir).unwrap();

        l.prepare().await.unwrap();

        let meta = std::fs::symlink_metadata(&l.scratch_dir).unwrap();
        assert!(!meta.file_type().is_symlink());
        assert!(meta.is_dir());
    }
}
