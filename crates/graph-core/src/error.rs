//! Error types for graph construction, compilation and execution.
//!
//! Every error raised by this crate carries a kind and a message; the
//! kinds map onto distinct recovery paths (fallback to the system
//! default graph, per-step retry policy, fatal compile-time failure, and
//! so on).

use thiserror::Error;

/// Convenience result type using [`GraphError`].
pub type Result<T> = std::result::Result<T, GraphError>;

/// Errors raised while loading, compiling, or executing a workflow graph.
#[derive(Error, Debug)]
pub enum GraphError {
    /// Graph structure validation failed.
    #[error("graph '{graph_id}' failed validation: {0:?}", graph_id = .graph_id)]
    Validation {
        graph_id: String,
        messages: Vec<String>,
    },

    /// Compilation of an otherwise-valid config failed to assemble a
    /// state machine.
    #[error("graph '{graph_id}' compilation failed: {message}")]
    CompilationFailed { graph_id: String, message: String },

    /// A node or edge referenced an id that does not exist.
    #[error("unknown node id '{0}'")]
    UnknownNode(String),

    /// A step executor failed and the step's error policy was `throw`.
    #[error("step execution failed: {0}")]
    StepExecution(String),

    /// A template contained malformed placeholder syntax.
    #[error("malformed template: {0}")]
    TemplateSyntax(String),

    /// An expression could not be parsed under the restricted grammar.
    ///
    /// This is distinct from an expression that merely uses a forbidden
    /// identifier, which evaluates to the fallback key rather than
    /// raising an error.
    #[error("malformed expression: {0}")]
    ExpressionSyntax(String),

    /// A graph or neuron lookup found nothing with that id.
    #[error("not found: {0}")]
    NotFound(String),

    /// A tier check rejected the caller.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Serialization/deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing failure (graph configs may be authored as YAML).
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl GraphError {
    pub fn validation(graph_id: impl Into<String>, messages: Vec<String>) -> Self {
        Self::Validation {
            graph_id: graph_id.into(),
            messages,
        }
    }

    pub fn compilation_failed(graph_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CompilationFailed {
            graph_id: graph_id.into(),
            message: message.into(),
        }
    }
}
