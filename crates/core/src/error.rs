#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("Validation failed: {0}")]
    Validation(String),
}
