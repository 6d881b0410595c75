//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps the ComfyUI HTTP API (liveness probe, workflow submission,
//! history retrieval) using [`reqwest`].

use std::collections::HashMap;
use std::time::Duration;

use comfyrun_core::workflow::Graph;
use serde::Deserialize;

use crate::history::HistoryEntry;

/// Per-request timeout for submission and history calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for the root liveness probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// HTTP client for a single ComfyUI instance.
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

/// Response returned by the ComfyUI `/prompt` endpoint after
/// successfully queuing a workflow.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    pub prompt_id: String,
    /// Position in the execution queue.
    #[serde(default)]
    pub number: Option<i64>,
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (network, DNS, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// `/prompt` answered 2xx but without a `prompt_id`.
    #[error("ComfyUI response missing prompt_id: {body}")]
    MissingPromptId {
        /// Raw response body for debugging.
        body: String,
    },

    /// A history entry did not have the expected shape.
    #[error("Malformed history entry: {0}")]
    MalformedHistory(#[source] serde_json::Error),
}

impl ComfyUIApi {
    /// Create a new API client for a ComfyUI instance.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://127.0.0.1:8188`.
    pub fn new(api_url: String) -> Result<Self, ComfyUIApiError> {
        Self::with_timeout(api_url, REQUEST_TIMEOUT)
    }

    /// Create an API client whose submission and history calls give up
    /// after `timeout`.
    pub fn with_timeout(api_url: String, timeout: Duration) -> Result<Self, ComfyUIApiError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, api_url))
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: String) -> Self {
        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }

    /// HTTP API base URL.
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Probe the root endpoint. `true` only for a 2xx answer.
    pub async fn probe(&self) -> bool {
        match self
            .client
            .get(format!("{}/", self.api_url))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// Submit a workflow for execution.
    ///
    /// Sends a `POST /prompt` request with the given workflow and client
    /// ID. Returns the server-assigned `prompt_id` and queue position.
    pub async fn submit_workflow(
        &self,
        workflow: &Graph,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&body)
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|_| ComfyUIApiError::MissingPromptId { body: text })
    }

    /// Retrieve the history entry for a specific prompt.
    ///
    /// Sends a `GET /history/{prompt_id}` request. ComfyUI answers with an
    /// object keyed by prompt ID, which is empty until the prompt reaches a
    /// terminal state; that case maps to `Ok(None)`.
    pub async fn get_history(
        &self,
        prompt_id: &str,
    ) -> Result<Option<HistoryEntry>, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.api_url, prompt_id))
            .send()
            .await?;

        let mut history: HashMap<String, serde_json::Value> =
            Self::parse_response(response).await?;

        history
            .remove(prompt_id)
            .map(serde_json::from_value)
            .transpose()
            .map_err(ComfyUIApiError::MalformedHistory)
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`ComfyUIApiError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}
