//! Errors raised while supervising tool subprocesses and routing calls to
//! them, convertible into [`graph_core::GraphError`] at the trait
//! boundary.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ToolPoolError>;

#[derive(Debug, Error)]
pub enum ToolPoolError {
    #[error("no server exposes tool '{0}'")]
    ToolRouting(String),

    #[error("tool call timed out after {0:?}")]
    ToolTimeout(std::time::Duration),

    #[error("server '{server}' exited while a call was pending")]
    ToolChildExit { server: String },

    #[error("server '{server}' failed to spawn: {message}")]
    SpawnFailed { server: String, message: String },

    #[error("server '{server}' did not complete the initialize handshake within {timeout:?}")]
    HandshakeTimeout { server: String, timeout: std::time::Duration },

    #[error("server '{server}' returned a JSON-RPC error {code}: {message}")]
    Rpc { server: String, code: i64, message: String },

    #[error("io error talking to server '{server}': {source}")]
    Io {
        server: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed JSON-RPC message from '{server}': {message}")]
    Protocol { server: String, message: String },
}

impl From<ToolPoolError> for graph_core::GraphError {
    fn from(err: ToolPoolError) -> Self {
        match &err {
            ToolPoolError::ToolRouting(name) => {
                graph_core::GraphError::NotFound(format!("tool '{name}'"))
            }
            _ => graph_core::GraphError::StepExecution(err.to_string()),
        }
    }
}
