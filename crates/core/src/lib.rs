//! Domain types for the comfyrun serverless worker.
//!
//! Pure logic only: workflow graphs and parameter overrides, the inbound
//! job envelope, and the outcome/result shapes returned to the caller.
//! Nothing in this crate performs I/O.

pub mod error;
pub mod job;
pub mod outcome;
pub mod workflow;
