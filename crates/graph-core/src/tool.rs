//! Tool-call trait seam consumed by the tool step executor and
//! implemented by `tool-pool::ToolPool`.

use async_trait::async_trait;
use serde_json::Value;

use crate::llm::CallMetadata;

/// The unwrapped result of a tool call: JSON value plus whether the call
/// succeeded.
#[derive(Debug, Clone)]
pub struct ToolCallResult {
    pub value: Value,
}

/// Routes tool calls by name to the process that owns them. Implemented by
/// `tool-pool::ToolPool`.
#[async_trait]
pub trait ToolClient: Send + Sync {
    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        meta: CallMetadata,
    ) -> crate::error::Result<ToolCallResult>;
}

#[cfg(test)]
pub mod tests {
    use super::*;

    pub struct NoopToolClient;

    #[async_trait]
    impl ToolClient for NoopToolClient {
        async fn call_tool(
            &self,
            name: &str,
            _arguments: Value,
            _meta: CallMetadata,
        ) -> crate::error::Result<ToolCallResult> {
            Err(crate::error::GraphError::NotFound(format!("tool '{name}' not found")))
        }
    }
}
