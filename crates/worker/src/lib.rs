//! Serverless worker that runs ComfyUI workflows one job at a time.
//!
//! - [`config`] - environment-driven [`WorkerConfig`](config::WorkerConfig).
//! - [`workflows`] - resolves inline, base64, or named workflows to a graph.
//! - [`runner`] - the [`JobRunner`](runner::JobRunner): submit, poll, classify.
//! - [`artifacts`] - reads produced files and inlines the small ones.
//! - [`error`] - the per-job failure taxonomy.
//! - [`routes`] - HTTP intake (`POST /run`, `GET /health`).

pub mod artifacts;
pub mod config;
pub mod error;
pub mod routes;
pub mod runner;
pub mod workflows;
