//! Shared harness: an in-process fake ComfyUI and a runner wired to it.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use comfyrun_comfyui::api::ComfyUIApi;
use comfyrun_comfyui::server::GenerationServer;
use comfyrun_comfyui::supervisor::{BootConfig, BootSupervisor, LaunchCommand};
use comfyrun_core::job::JobDefaults;
use comfyrun_core::outcome::WorkerInfo;
use comfyrun_worker::artifacts::InlineLimits;
use comfyrun_worker::runner::{JobRunner, RunnerSettings};
use comfyrun_worker::workflows::WorkflowDirs;
use serde_json::{json, Value};
use tempfile::TempDir;

pub const PROMPT_ID: &str = "fake-prompt-1";

/// Client-side timeout of submission and history calls in the harness.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// Behaviour of the fake ComfyUI.
#[derive(Default)]
pub struct FakeComfy {
    /// When set, `POST /prompt` answers with this status and body.
    pub submit_failure: Option<(StatusCode, String)>,
    /// History entry reported for [`PROMPT_ID`]; `None` keeps it pending.
    pub history: Option<Value>,
    /// Number of history polls answered "pending" before `history` shows.
    pub pending_polls: usize,
    /// When set, `POST /prompt` never answers within the client timeout.
    pub submit_hangs: bool,
    pub submitted: Mutex<Vec<Value>>,
    pub polls: AtomicUsize,
}

impl FakeComfy {
    /// Graphs received on `POST /prompt`.
    pub fn submitted(&self) -> Vec<Value> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

async fn root() -> &'static str {
    "ComfyUI"
}

async fn prompt(State(fake): State<Arc<FakeComfy>>, Json(body): Json<Value>) -> Response {
    if fake.submit_hangs {
        tokio::time::sleep(Duration::from_secs(30)).await;
    }
    if let Some((status, body)) = &fake.submit_failure {
        return (*status, body.clone()).into_response();
    }
    fake.submitted.lock().unwrap().push(body["prompt"].clone());
    Json(json!({ "prompt_id": PROMPT_ID, "number": 0, "node_errors": {} })).into_response()
}

async fn history(State(fake): State<Arc<FakeComfy>>, Path(id): Path<String>) -> Json<Value> {
    let n = fake.polls.fetch_add(1, Ordering::SeqCst);
    match &fake.history {
        Some(entry) if id == PROMPT_ID && n >= fake.pending_polls => {
            let mut found = serde_json::Map::new();
            found.insert(id, entry.clone());
            Json(Value::Object(found))
        }
        _ => Json(json!({})),
    }
}

/// Serve `fake` on an ephemeral port and return its base URL.
pub async fn spawn_fake_comfy(fake: Arc<FakeComfy>) -> String {
    let app = Router::new()
        .route("/", get(root))
        .route("/prompt", post(prompt))
        .route("/history/{id}", get(history))
        .with_state(fake);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// A runner wired to a fake ComfyUI, with workflow and output directories
/// in a temp dir.
pub struct Harness {
    pub runner: Arc<JobRunner>,
    pub fake: Arc<FakeComfy>,
    pub workflow_dir: PathBuf,
    pub output_dir: PathBuf,
    _tmp: TempDir,
}

pub async fn harness(fake: FakeComfy) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let workflow_dir = tmp.path().join("workflow");
    let fallback_dir = tmp.path().join("fallback");
    let output_dir = tmp.path().join("output");
    for dir in [&workflow_dir, &fallback_dir, &output_dir] {
        std::fs::create_dir_all(dir).unwrap();
    }

    let fake = Arc::new(fake);
    let url = spawn_fake_comfy(Arc::clone(&fake)).await;
    let server: Arc<dyn GenerationServer> =
        Arc::new(ComfyUIApi::with_timeout(url, REQUEST_TIMEOUT).unwrap());

    // A long-lived stand-in process; readiness comes from the fake's root.
    let boot = BootConfig {
        launch: LaunchCommand {
            program: "sleep".into(),
            args: vec!["30".into()],
            working_dir: None,
        },
        layout: None,
        timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(20),
    };
    let supervisor = Arc::new(BootSupervisor::new(boot, Arc::clone(&server)));

    let settings = RunnerSettings {
        defaults: JobDefaults::default(),
        workflow_dirs: WorkflowDirs {
            primary: workflow_dir.clone(),
            fallback: fallback_dir,
        },
        output_dir: output_dir.clone(),
        inline_limits: InlineLimits {
            image: 1024 * 1024,
            video: 4 * 1024 * 1024,
        },
        poll_interval: Duration::from_millis(50),
        worker: WorkerInfo {
            gpu: "test-gpu".into(),
            pod_id: "test-pod".into(),
        },
    };

    Harness {
        runner: Arc::new(JobRunner::new(supervisor, server, settings)),
        fake,
        workflow_dir,
        output_dir,
        _tmp: tmp,
    }
}

/// A minimal txt2img graph in ComfyUI API format.
pub fn txt2img_graph() -> Value {
    json!({
        "4": { "class_type": "CheckpointLoaderSimple", "inputs": { "ckpt_name": "sd15.safetensors" } },
        "6": { "class_type": "CLIPTextEncode", "inputs": { "text": "a cat", "clip": ["4", 1] } },
        "7": { "class_type": "CLIPTextEncode", "inputs": { "text": "blurry", "clip": ["4", 1] } },
        "3": { "class_type": "KSampler", "inputs": { "seed": 1, "model": ["4", 0], "positive": ["6", 0], "negative": ["7", 0] } },
        "9": { "class_type": "SaveImage", "inputs": { "images": ["8", 0], "filename_prefix": "ComfyUI" } }
    })
}

/// History entry of a successful run that saved `filename` from node 9.
pub fn completed_entry(filename: &str) -> Value {
    json!({
        "status": { "status_str": "success", "completed": true, "messages": [] },
        "outputs": {
            "9": { "images": [{ "filename": filename, "subfolder": "", "type": "output" }] }
        }
    })
}
