//! Errors specific to provider HTTP adapters, convertible into
//! [`graph_core::GraphError`] at the trait boundary.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, LlmError>;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("neuron not found: {0}")]
    NeuronNotFound(String),

    #[error("access denied: user '{user_id}' cannot use neuron '{neuron_id}'")]
    AccessDenied { user_id: String, neuron_id: String },

    #[error("provider '{0}' returned an invalid response: {1}")]
    InvalidResponse(String, String),

    #[error("unsupported provider kind: {0:?}")]
    UnsupportedProvider(graph_core::model::ProviderKind),
}

impl From<LlmError> for graph_core::GraphError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::NeuronNotFound(id) => graph_core::GraphError::NotFound(id),
            LlmError::AccessDenied { .. } => graph_core::GraphError::AccessDenied(err.to_string()),
            other => graph_core::GraphError::StepExecution(other.to_string()),
        }
    }
}
