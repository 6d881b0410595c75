//! Boot supervisor for the local ComfyUI process.
//!
//! Brings the server from nothing to accepting work exactly once per worker
//! process:
//!
//! ```text
//! NotStarted -> Starting -> Ready    (terminal, reused by every job)
//!                        -> Failed   (terminal, every later call fails)
//! ```
//!
//! Readiness is a 2xx answer from the server's root endpoint. The child is
//! also checked with `try_wait` on every tick so an early crash is reported
//! at once instead of after the deadline.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::layout::{Layout, LayoutError};
use crate::server::GenerationServer;

/// How often a progress line is logged while waiting for the server.
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// tracing target for forwarded server output.
const SERVER_LOG_TARGET: &str = "comfyui";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Command line used to launch the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl LaunchCommand {
    /// `{python} {comfy_dir}/main.py --listen {host} --port {port}`.
    pub fn comfyui(python: &str, comfy_dir: &Path, host: &str, port: u16) -> Self {
        Self {
            program: python.to_string(),
            args: vec![
                comfy_dir.join("main.py").to_string_lossy().into_owned(),
                "--listen".to_string(),
                host.to_string(),
                "--port".to_string(),
                port.to_string(),
            ],
            working_dir: Some(comfy_dir.to_path_buf()),
        }
    }
}

/// Everything the supervisor needs to boot the server.
#[derive(Debug, Clone)]
pub struct BootConfig {
    pub launch: LaunchCommand,
    /// Directory layout to prepare before launch, if any.
    pub layout: Option<Layout>,
    /// Deadline for the server to become ready, from launch.
    pub timeout: Duration,
    /// Interval between readiness probes.
    pub poll_interval: Duration,
}

// ---------------------------------------------------------------------------
// State and errors
// ---------------------------------------------------------------------------

/// Lifecycle state of the supervised server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BootState {
    NotStarted,
    Starting,
    Ready,
    Failed,
}

impl BootState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Ready,
            3 => Self::Failed,
            _ => Self::NotStarted,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::NotStarted => 0,
            Self::Starting => 1,
            Self::Ready => 2,
            Self::Failed => 3,
        }
    }
}

/// Why the server could not be brought up.
#[derive(Debug, thiserror::Error)]
pub enum BootError {
    #[error("Failed to prepare directory layout: {0}")]
    Layout(#[from] LayoutError),

    #[error("Failed to launch ComfyUI: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Failed to monitor ComfyUI process: {0}")]
    Monitor(#[source] std::io::Error),

    #[error("ComfyUI exited before becoming ready ({status})")]
    ProcessExited { status: String },

    #[error("ComfyUI not ready after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// An earlier boot attempt failed; the worker needs a restart.
    #[error("ComfyUI failed to start earlier: {0}")]
    PreviouslyFailed(String),
}

#[derive(Default)]
struct Lifecycle {
    child: Option<Child>,
    failure: Option<String>,
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Owns the server process and its readiness state.
///
/// The state is readable without locking; transitions happen under the
/// lifecycle lock, so concurrent [`ensure_started`](Self::ensure_started)
/// callers share one launch.
pub struct BootSupervisor {
    config: BootConfig,
    server: Arc<dyn GenerationServer>,
    state: AtomicU8,
    lifecycle: Mutex<Lifecycle>,
}

impl BootSupervisor {
    pub fn new(config: BootConfig, server: Arc<dyn GenerationServer>) -> Self {
        Self {
            config,
            server,
            state: AtomicU8::new(BootState::NotStarted.as_u8()),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    pub fn state(&self) -> BootState {
        BootState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_ready(&self) -> bool {
        self.state() == BootState::Ready
    }

    /// PID of the running server, if one was launched and is still owned.
    pub async fn server_pid(&self) -> Option<u32> {
        self.lifecycle.lock().await.child.as_ref().and_then(Child::id)
    }

    /// Make sure the server is up.
    ///
    /// Returns how long this call waited for readiness: zero when the server
    /// was already ready, the full boot time for the caller that launched it,
    /// or the lock wait for a caller that joined an in-flight boot.
    pub async fn ensure_started(&self) -> Result<Duration, BootError> {
        if self.is_ready() {
            return Ok(Duration::ZERO);
        }

        let started = Instant::now();
        let mut lifecycle = self.lifecycle.lock().await;

        match self.state() {
            BootState::Ready => return Ok(started.elapsed()),
            BootState::Failed => {
                let reason = lifecycle
                    .failure
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string());
                return Err(BootError::PreviouslyFailed(reason));
            }
            BootState::NotStarted | BootState::Starting => {}
        }

        self.set_state(BootState::Starting);
        tracing::info!(
            program = %self.config.launch.program,
            timeout_secs = self.config.timeout.as_secs(),
            "Starting ComfyUI",
        );

        match self.boot(&mut lifecycle).await {
            Ok(()) => {
                self.set_state(BootState::Ready);
                let elapsed = started.elapsed();
                tracing::info!(
                    elapsed_secs = elapsed.as_secs_f64(),
                    pid = ?lifecycle.child.as_ref().and_then(Child::id),
                    "ComfyUI ready",
                );
                Ok(elapsed)
            }
            Err(e) => {
                // Dropping the child kills it.
                lifecycle.child = None;
                lifecycle.failure = Some(e.to_string());
                self.set_state(BootState::Failed);
                tracing::error!(error = %e, "ComfyUI failed to start");
                Err(e)
            }
        }
    }

    /// Kill the server process, if running. The state is left unchanged.
    pub async fn shutdown(&self) {
        let child = self.lifecycle.lock().await.child.take();
        if let Some(mut child) = child {
            tracing::info!(pid = ?child.id(), "Stopping ComfyUI");
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "Failed to kill ComfyUI process");
            }
        }
    }

    fn set_state(&self, state: BootState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    async fn boot(&self, lifecycle: &mut Lifecycle) -> Result<(), BootError> {
        if let Some(layout) = &self.config.layout {
            layout.prepare().await?;
        }

        let child = lifecycle.child.insert(self.spawn()?);
        self.wait_until_ready(child).await
    }

    fn spawn(&self) -> Result<Child, BootError> {
        let launch = &self.config.launch;
        let mut cmd = Command::new(&launch.program);
        cmd.args(&launch.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &launch.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(BootError::Spawn)?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr));
        }

        tracing::debug!(pid = ?child.id(), "ComfyUI process spawned");
        Ok(child)
    }

    async fn wait_until_ready(&self, child: &mut Child) -> Result<(), BootError> {
        let start = Instant::now();
        let deadline = start.checked_add(self.config.timeout);
        let mut last_report = start;

        loop {
            if let Some(status) = child.try_wait().map_err(BootError::Monitor)? {
                return Err(BootError::ProcessExited {
                    status: status.to_string(),
                });
            }

            if self.server.is_alive().await {
                return Ok(());
            }

            let now = Instant::now();
            if deadline.is_some_and(|deadline| now >= deadline) {
                return Err(BootError::Timeout {
                    timeout_secs: self.config.timeout.as_secs(),
                });
            }

            if now.duration_since(last_report) >= PROGRESS_LOG_INTERVAL {
                tracing::info!(
                    waited_secs = now.duration_since(start).as_secs(),
                    "Waiting for ComfyUI",
                );
                last_report = now;
            }

            let remaining = deadline.map_or(self.config.poll_interval, |deadline| deadline - now);
            tokio::time::sleep(self.config.poll_interval.min(remaining)).await;
        }
    }
}

/// Forward each output line of the server into tracing.
async fn forward_lines<R: AsyncRead + Unpin>(stream: R) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.trim().is_empty() {
            tracing::info!(target: SERVER_LOG_TARGET, "{line}");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
