//! `comfyrun-worker` -- serverless ComfyUI worker.
//!
//! Starts ComfyUI in the background, then either serves jobs over HTTP or,
//! when `JOB_INPUT_FILE` is set, runs that single job and prints its result.
//! See [`WorkerConfig::from_env`] for every environment variable.
//!
//! | Variable     | Default | Description                                  |
//! |--------------|---------|----------------------------------------------|
//! | `RUST_LOG`   | --      | tracing filter, e.g. `comfyrun_worker=debug` |
//! | `LOG_FORMAT` | --      | `json` for JSON log lines                    |

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use comfyrun_comfyui::api::ComfyUIApi;
use comfyrun_comfyui::server::GenerationServer;
use comfyrun_comfyui::supervisor::BootSupervisor;
use comfyrun_core::job::JobEnvelope;
use comfyrun_core::outcome::JobStatus;
use comfyrun_worker::config::WorkerConfig;
use comfyrun_worker::routes::{build_router, AppState, RunResponse};
use comfyrun_worker::runner::{JobRunner, RunnerSettings};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = match WorkerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(
        comfy_url = %config.comfy_url(),
        comfy_dir = %config.comfy_dir.display(),
        workflow_dir = %config.workflow_dir.display(),
        gpu = %config.gpu_type,
        pod_id = %config.pod_id,
        "Starting comfyrun-worker",
    );

    let server: Arc<dyn GenerationServer> = match ComfyUIApi::new(config.comfy_url()) {
        Ok(api) => Arc::new(api),
        Err(e) => {
            tracing::error!(error = %e, "Failed to build ComfyUI client");
            return ExitCode::FAILURE;
        }
    };
    let supervisor = Arc::new(BootSupervisor::new(config.boot_config(), Arc::clone(&server)));
    let runner = Arc::new(JobRunner::new(
        Arc::clone(&supervisor),
        server,
        RunnerSettings::from_config(&config),
    ));

    // Pre-warm: jobs that arrive during boot wait on the same launch.
    let prewarm = Arc::clone(&supervisor);
    tokio::spawn(async move {
        if let Err(e) = prewarm.ensure_started().await {
            tracing::error!(error = %e, "Pre-warm failed; worker cannot serve jobs");
        }
    });

    let code = match &config.job_input_file {
        Some(path) => run_once(&runner, path).await,
        None => serve(&config, runner).await,
    };

    supervisor.shutdown().await;
    tracing::info!("Shutdown complete");
    code
}

fn init_tracing() {
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "comfyrun_worker=info,comfyrun_comfyui=info,comfyrun_core=info,comfyui=info".into()
            }),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();
}

/// Process the job in `path` and print `{ id, output }` to stdout.
async fn run_once(runner: &JobRunner, path: &Path) -> ExitCode {
    let envelope = match load_envelope(path).await {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "Failed to load job file");
            return ExitCode::FAILURE;
        }
    };

    let id = envelope.id.unwrap_or_else(|| "local".to_string());
    let output = runner.run(&id, envelope.input).await;
    let failed = output.status == JobStatus::Error;

    match serde_json::to_string_pretty(&RunResponse { id, output }) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize job result");
            return ExitCode::FAILURE;
        }
    }

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

async fn load_envelope(path: &Path) -> Result<JobEnvelope, String> {
    let bytes = tokio::fs::read(path).await.map_err(|e| e.to_string())?;
    serde_json::from_slice(&bytes).map_err(|e| e.to_string())
}

/// Serve the intake router until SIGINT/SIGTERM.
async fn serve(config: &WorkerConfig, runner: Arc<JobRunner>) -> ExitCode {
    let app = build_router(AppState { runner });
    let addr = format!("{}:{}", config.host, config.port);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(addr = %addr, "Accepting jobs");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %e, "Server error");
        return ExitCode::FAILURE;
    }

    tracing::info!("Server stopped accepting jobs");
    ExitCode::SUCCESS
}

/// Wait for a shutdown signal (Ctrl-C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl-C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
