//! ComfyUI integration: HTTP client, history parsing, and process supervision.
//!
//! - [`api`] - REST client (`/prompt`, `/history/{id}`, `/`).
//! - [`server`] - the [`GenerationServer`](server::GenerationServer) trait the job runner drives.
//! - [`history`] - typed history entries and their terminal classification.
//! - [`layout`] - volume symlinks and scratch directory for the install.
//! - [`supervisor`] - launches the server once and tracks readiness.

pub mod api;
pub mod history;
pub mod layout;
pub mod server;
pub mod supervisor;
