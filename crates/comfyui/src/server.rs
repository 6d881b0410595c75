//! The seam between job orchestration and a running generation server.

use async_trait::async_trait;
use comfyrun_core::workflow::Graph;

use crate::api::{ComfyUIApi, ComfyUIApiError};
use crate::history::HistoryEntry;

/// Operations the worker needs from a generation server.
///
/// Implemented by [`ComfyUIApi`] for the real server and by in-memory
/// fakes in tests.
#[async_trait]
pub trait GenerationServer: Send + Sync {
    /// `true` once the server answers its liveness probe.
    async fn is_alive(&self) -> bool;

    /// Queue a graph for execution and return its prompt ID.
    async fn submit(&self, graph: &Graph) -> Result<String, ComfyUIApiError>;

    /// Fetch the history entry for a prompt; `None` while it is not terminal.
    async fn history(&self, prompt_id: &str) -> Result<Option<HistoryEntry>, ComfyUIApiError>;
}

#[async_trait]
impl GenerationServer for ComfyUIApi {
    async fn is_alive(&self) -> bool {
        self.probe().await
    }

    async fn submit(&self, graph: &Graph) -> Result<String, ComfyUIApiError> {
        let client_id = uuid::Uuid::new_v4().to_string();
        let response = self.submit_workflow(graph, &client_id).await?;
        tracing::debug!(
            prompt_id = %response.prompt_id,
            queue_number = ?response.number,
            "Workflow queued",
        );
        Ok(response.prompt_id)
    }

    async fn history(&self, prompt_id: &str) -> Result<Option<HistoryEntry>, ComfyUIApiError> {
        self.get_history(prompt_id).await
    }
}
