use std::path::PathBuf;
use std::time::Duration;

use comfyrun_comfyui::layout::Layout;
use comfyrun_comfyui::supervisor::{BootConfig, LaunchCommand};
use comfyrun_core::job::{JobDefaults, DEFAULT_TIMEOUT_SECS, DEFAULT_WORKFLOW_NAME};
use comfyrun_core::outcome::WorkerInfo;

use crate::artifacts::InlineLimits;
use crate::workflows::WorkflowDirs;

/// Errors from reading worker configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be {expected}, got '{value}'")]
    Invalid {
        var: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// ComfyUI install directory.
    pub comfy_dir: PathBuf,
    /// Shared network volume root.
    pub network_volume: PathBuf,
    /// Primary directory of named workflow files.
    pub workflow_dir: PathBuf,
    /// Secondary directory searched when the primary lacks a workflow.
    pub workflow_fallback_dir: PathBuf,
    pub default_workflow: String,
    pub comfy_host: String,
    pub comfy_port: u16,
    /// Interpreter used to launch ComfyUI.
    pub comfy_python: String,
    pub boot_timeout: Duration,
    pub boot_poll_interval: Duration,
    pub job_poll_interval: Duration,
    pub job_timeout: Duration,
    /// Largest image, in bytes, whose contents are inlined in the result.
    pub image_inline_limit: u64,
    /// Largest video, in bytes, whose contents are inlined in the result.
    pub video_inline_limit: u64,
    /// Intake bind address.
    pub host: String,
    pub port: u16,
    /// When set, process this one job file and exit.
    pub job_input_file: Option<PathBuf>,
    pub gpu_type: String,
    pub pod_id: String,
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                    | Default                     |
    /// |----------------------------|-----------------------------|
    /// | `COMFY_DIR`                | `/ComfyUI`                  |
    /// | `NETWORK_VOLUME`           | `/runpod-volume`            |
    /// | `WORKFLOW_DIR`             | `{NETWORK_VOLUME}/workflow` |
    /// | `WORKFLOW_FALLBACK_DIR`    | `/`                         |
    /// | `DEFAULT_WORKFLOW`         | `wan-t2v`                   |
    /// | `COMFY_HOST`               | `127.0.0.1`                 |
    /// | `COMFY_PORT`               | `8188`                      |
    /// | `COMFY_PYTHON`             | `python`                    |
    /// | `BOOT_TIMEOUT_SECS`        | `600`                       |
    /// | `BOOT_POLL_INTERVAL_MS`    | `2000`                      |
    /// | `JOB_POLL_INTERVAL_MS`     | `3000`                      |
    /// | `JOB_TIMEOUT_SECS`         | `600`                       |
    /// | `IMAGE_INLINE_LIMIT_BYTES` | `10485760`                  |
    /// | `VIDEO_INLINE_LIMIT_BYTES` | `52428800`                  |
    /// | `HOST`                     | `0.0.0.0`                   |
    /// | `PORT`                     | `8000`                      |
    /// | `JOB_INPUT_FILE`           | unset                       |
    /// | `RUNPOD_GPU_TYPE`          | `unknown`                   |
    /// | `RUNPOD_POD_ID`            | `local`                     |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let string = |var: &str, default: &str| {
            lookup(var)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let network_volume = PathBuf::from(string("NETWORK_VOLUME", "/runpod-volume"));
        let workflow_dir = lookup("WORKFLOW_DIR")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| network_volume.join("workflow"));

        Ok(Self {
            comfy_dir: PathBuf::from(string("COMFY_DIR", "/ComfyUI")),
            workflow_dir,
            workflow_fallback_dir: PathBuf::from(string("WORKFLOW_FALLBACK_DIR", "/")),
            network_volume,
            default_workflow: string("DEFAULT_WORKFLOW", DEFAULT_WORKFLOW_NAME),
            comfy_host: string("COMFY_HOST", "127.0.0.1"),
            comfy_port: parse(&lookup, "COMFY_PORT", 8188, "a valid port")?,
            comfy_python: string("COMFY_PYTHON", "python"),
            boot_timeout: Duration::from_secs(parse(
                &lookup,
                "BOOT_TIMEOUT_SECS",
                600,
                "a whole number of seconds",
            )?),
            boot_poll_interval: positive_millis(&lookup, "BOOT_POLL_INTERVAL_MS", 2000)?,
            job_poll_interval: positive_millis(&lookup, "JOB_POLL_INTERVAL_MS", 3000)?,
            job_timeout: Duration::from_secs(parse(
                &lookup,
                "JOB_TIMEOUT_SECS",
                DEFAULT_TIMEOUT_SECS,
                "a whole number of seconds",
            )?),
            image_inline_limit: parse(
                &lookup,
                "IMAGE_INLINE_LIMIT_BYTES",
                10 * 1024 * 1024,
                "a byte count",
            )?,
            video_inline_limit: parse(
                &lookup,
                "VIDEO_INLINE_LIMIT_BYTES",
                50 * 1024 * 1024,
                "a byte count",
            )?,
            host: string("HOST", "0.0.0.0"),
            port: parse(&lookup, "PORT", 8000, "a valid port")?,
            job_input_file: lookup("JOB_INPUT_FILE")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            gpu_type: string("RUNPOD_GPU_TYPE", "unknown"),
            pod_id: string("RUNPOD_POD_ID", "local"),
        })
    }

    /// Base URL of the local ComfyUI HTTP API.
    pub fn comfy_url(&self) -> String {
        format!("http://{}:{}", self.comfy_host, self.comfy_port)
    }

    /// Directory ComfyUI writes outputs into.
    pub fn output_dir(&self) -> PathBuf {
        self.comfy_dir.join("output")
    }

    pub fn boot_config(&self) -> BootConfig {
        BootConfig {
            launch: LaunchCommand::comfyui(
                &self.comfy_python,
                &self.comfy_dir,
                &self.comfy_host,
                self.comfy_port,
            ),
            layout: Some(Layout::comfy_default(&self.comfy_dir, &self.network_volume)),
            timeout: self.boot_timeout,
            poll_interval: self.boot_poll_interval,
        }
    }

    pub fn job_defaults(&self) -> JobDefaults {
        JobDefaults {
            workflow_name: self.default_workflow.clone(),
            timeout: self.job_timeout,
        }
    }

    pub fn worker_info(&self) -> WorkerInfo {
        WorkerInfo {
            gpu: self.gpu_type.clone(),
            pod_id: self.pod_id.clone(),
        }
    }

    pub fn inline_limits(&self) -> InlineLimits {
        InlineLimits {
            image: self.image_inline_limit,
            video: self.video_inline_limit,
        }
    }

    pub fn workflow_dirs(&self) -> WorkflowDirs {
        WorkflowDirs {
            primary: self.workflow_dir.clone(),
            fallback: self.workflow_fallback_dir.clone(),
        }
    }
}

fn parse<F, T>(
    lookup: &F,
    var: &'static str,
    default: T,
    expected: &'static str,
) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(var) {
        Some(value) if !value.trim().is_empty() => {
            value.trim().parse().map_err(|_| ConfigError::Invalid {
                var,
                value,
                expected,
            })
        }
        _ => Ok(default),
    }
}

fn positive_millis<F>(lookup: &F, var: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let ms: u64 = parse(lookup, var, default, "a positive number of milliseconds")?;
    if ms == 0 {
        return Err(ConfigError::Invalid {
            var,
            value: ms.to_string(),
            expected: "a positive number of milliseconds",
        });
    }
    Ok(Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::Path;

    use assert_matches::assert_matches;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<WorkerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.comfy_dir, Path::new("/ComfyUI"));
        assert_eq!(config.workflow_dir, Path::new("/runpod-volume/workflow"));
        assert_eq!(config.workflow_fallback_dir, Path::new("/"));
        assert_eq!(config.default_workflow, "wan-t2v");
        assert_eq!(config.comfy_url(), "http://127.0.0.1:8188");
        assert_eq!(config.boot_timeout, Duration::from_secs(600));
        assert_eq!(config.boot_poll_interval, Duration::from_secs(2));
        assert_eq!(config.job_poll_interval, Duration::from_secs(3));
        assert_eq!(config.inline_limits().image, 10_485_760);
        assert_eq!(config.inline_limits().video, 52_428_800);
        assert_eq!(config.port, 8000);
        assert!(config.job_input_file.is_none());
        assert_eq!(config.worker_info().gpu, "unknown");
        assert_eq!(config.worker_info().pod_id, "local");
        assert_eq!(config.output_dir(), Path::new("/ComfyUI/output"));
    }

    #[test]
    fn workflow_dir_follows_volume() {
        let config = load(&[("NETWORK_VOLUME", "/mnt/vol")]).unwrap();
        assert_eq!(config.workflow_dir, Path::new("/mnt/vol/workflow"));

        let boot = config.boot_config();
        let layout = boot.layout.unwrap();
        assert_eq!(layout.links[0].target, Path::new("/mnt/vol/ComfyUI/models"));
    }

    #[test]
    fn overrides_are_read() {
        let config = load(&[
            ("COMFY_PORT", "9000"),
            ("JOB_TIMEOUT_SECS", "120"),
            ("JOB_INPUT_FILE", "/tmp/job.json"),
            ("RUNPOD_GPU_TYPE", "NVIDIA H100"),
        ])
        .unwrap();
        assert_eq!(config.comfy_port, 9000);
        assert_eq!(config.job_defaults().timeout, Duration::from_secs(120));
        assert_eq!(config.job_input_file, Some(PathBuf::from("/tmp/job.json")));
        assert_eq!(config.gpu_type, "NVIDIA H100");
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        assert_matches!(
            load(&[("COMFY_PORT", "http")]),
            Err(ConfigError::Invalid { var: "COMFY_PORT", .. })
        );
        assert_matches!(
            load(&[("JOB_POLL_INTERVAL_MS", "0")]),
            Err(ConfigError::Invalid { var: "JOB_POLL_INTERVAL_MS", .. })
        );
    }
}
