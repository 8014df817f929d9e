//! The error taxonomy raised by the front door, the workflow registry and
//! the generation pipeline, convertible into [`graph_core::GraphError`] at
//! the point it crosses into the engine and back out again in
//! [`From<graph_core::GraphError>`].

use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("graph '{graph_id}' compilation failed: {message}")]
    CompilationFailed { graph_id: String, message: String },

    #[error("validation failed for '{graph_id}': {messages:?}")]
    Validation { graph_id: String, messages: Vec<String> },

    #[error("tool error: {0}")]
    Tool(#[from] tool_pool::ToolPoolError),

    #[error("provider error: {0}")]
    ProviderError(String),

    #[error("generation already in progress for conversation '{0}'")]
    AlreadyInProgress(String),

    #[error("stream timed out after {0:?}")]
    StreamTimeout(std::time::Duration),

    #[error("generation '{0}' was cancelled")]
    Cancelled(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid {field}: '{value}' is not a valid identifier")]
    InvalidIdentifier { field: &'static str, value: String },

    #[error("checkpoint store error: {0}")]
    Checkpoint(#[from] graph_checkpoint::CheckpointError),

    #[error(transparent)]
    Graph(#[from] graph_core::GraphError),
}

impl From<OrchestratorError> for graph_core::GraphError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::Graph(e) => e,
            OrchestratorError::NotFound(msg) => graph_core::GraphError::NotFound(msg),
            OrchestratorError::AccessDenied(msg) => graph_core::GraphError::AccessDenied(msg),
            OrchestratorError::CompilationFailed { graph_id, message } => {
                graph_core::GraphError::compilation_failed(graph_id, message)
            }
            OrchestratorError::Validation { graph_id, messages } => {
                graph_core::GraphError::validation(graph_id, messages)
            }
            other => graph_core::GraphError::StepExecution(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_round_trips_into_graph_error() {
        let err: graph_core::GraphError = OrchestratorError::NotFound("graph 'g1'".into()).into();
        assert!(matches!(err, graph_core::GraphError::NotFound(_)));
    }

    #[test]
    fn tool_pool_error_is_wrapped_and_displays() {
        let err = OrchestratorError::from(tool_pool::ToolPoolError::ToolRouting("web_search".into()));
        assert!(err.to_string().contains("web_search"));
    }
}
