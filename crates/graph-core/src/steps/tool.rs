//! Tool step: calls a tool through the [`ToolClient`] seam and unwraps
//! its result into a state field.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{GraphError, Result};
use crate::render::render_params;
use crate::state::StateDelta;

use super::{ErrorPolicy, StepContext};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolStepConfig {
    pub tool_name: String,
    #[serde(default)]
    pub parameters: Value,
    pub output_field: String,
    #[serde(default)]
    pub error_handling: ErrorPolicy,
    /// Legacy fields: when present and `error_handling` was not supplied,
    /// they populate an equivalent retry policy.
    #[serde(default)]
    pub retry_on_error: bool,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

pub async fn execute(config: &Value, ctx: &StepContext<'_>) -> Result<StateDelta> {
    let mut cfg: ToolStepConfig = serde_json::from_value(config.clone())
        .map_err(|e| GraphError::StepExecution(format!("invalid tool step config: {e}")))?;

    if cfg.retry_on_error && cfg.error_handling.retry == 0 {
        cfg.error_handling.retry = cfg.max_retries.unwrap_or(1);
        if cfg.error_handling.retry_delay == 0 {
            cfg.error_handling.retry_delay = 500;
        }
    }

    let policy = cfg.error_handling.clone();
    let output_field = cfg.output_field.clone();

    super::with_error_policy(&policy, &output_field, || run_once(&cfg, ctx)).await
}

async fn run_once(cfg: &ToolStepConfig, ctx: &StepContext<'_>) -> Result<StateDelta> {
    let state = ctx.state;
    let rendered_params = render_params(&cfg.parameters, state)?;
    let tool_id = uuid::Uuid::new_v4().to_string();

    let mut meta = std::collections::HashMap::new();
    meta.insert("conversationId".to_string(), state.conversation_id.clone());
    meta.insert("generationId".to_string(), state.generation_id.clone());
    meta.insert("messageId".to_string(), state.message_id.clone());

    ctx.sink
        .tool_event(
            &tool_id,
            super::ToolEventPhase::Start,
            serde_json::json!({"toolName": cfg.tool_name, "parameters": rendered_params}),
        )
        .await;

    let result = state
        .handles
        .tool_client
        .call_tool(&cfg.tool_name, rendered_params, meta)
        .await;

    let result = match result {
        Ok(result) => result,
        Err(err) => {
            ctx.sink
                .tool_event(&tool_id, super::ToolEventPhase::Error, serde_json::json!({"error": err.to_string()}))
                .await;
            return Err(err);
        }
    };

    let unwrapped = unwrap_result(result.value);
    let serialized = round_trip_serializable(&unwrapped);

    ctx.sink
        .tool_event(&tool_id, super::ToolEventPhase::Complete, serde_json::json!({"result": serialized}))
        .await;

    let mut fields = serde_json::Map::new();
    fields.insert(cfg.output_field.clone(), serialized);
    Ok(StateDelta::data_only(Value::Object(fields)))
}

/// Unwrap a tool's structured result: a single text content item that
/// parses as JSON becomes that parsed value; otherwise the text string;
/// otherwise the raw value.
fn unwrap_result(value: Value) -> Value {
    if let Some(items) = value.get("content").and_then(|c| c.as_array()) {
        if items.len() == 1 {
            if let Some(text) = items[0].get("text").and_then(|t| t.as_str()) {
                if let Ok(parsed) = serde_json::from_str::<Value>(text) {
                    return parsed;
                }
                return Value::String(text.to_string());
            }
        }
    }
    value
}

/// Serialize through a JSON round trip to strip non-serializable
/// references; on failure, keep primitive-only fields.
fn round_trip_serializable(value: &Value) -> Value {
    match serde_json::to_string(value).and_then(|s| serde_json::from_str(&s)) {
        Ok(v) => v,
        Err(_) => primitives_only(value),
    }
}

fn primitives_only(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                if matches!(v, Value::String(_) | Value::Number(_) | Value::Bool(_) | Value::Null) {
                    out.insert(k.clone(), v.clone());
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .filter(|v| matches!(v, Value::String(_) | Value::Number(_) | Value::Bool(_)))
                .cloned()
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::tests::NoopLmRegistry;
    use crate::llm::CallMetadata;
    use crate::state::{Handles, RuntimeState};
    use crate::steps::NullSink;
    use crate::tool::{ToolCallResult, ToolClient};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::{atomic::{AtomicU32, Ordering}, Arc};

    struct FlakyClient {
        calls: AtomicU32,
        fail_times: u32,
    }

    #[async_trait]
    impl ToolClient for FlakyClient {
        async fn call_tool(
            &self,
            _name: &str,
            _arguments: Value,
            _meta: CallMetadata,
        ) -> Result<ToolCallResult> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                return Err(GraphError::StepExecution("boom".into()));
            }
            Ok(ToolCallResult { value: json!({"content": [{"text": "{\"hits\": 3}"}]}) })
        }
    }

    fn state_with(client: Arc<dyn ToolClient>) -> RuntimeState {
        let handles = Handles {
            lm_registry: Arc::new(NoopLmRegistry),
            tool_client: client,
        };
        RuntimeState::new(json!({"message": "q"}), json!({}), "u1", 4, handles, "m", "g", "c")
    }

    #[tokio::test]
    async fn unwraps_json_text_content() {
        let client = Arc::new(FlakyClient { calls: AtomicU32::new(0), fail_times: 0 });
        let state = state_with(client);
        let sink = NullSink;
        let ctx = StepContext { state: &state, sink: &sink, stream_visible: false };
        let cfg = json!({"toolName": "web_search", "parameters": {"query": "x"}, "outputField": "results"});
        let delta = execute(&cfg, &ctx).await.unwrap();
        assert_eq!(delta.data.unwrap()["results"], json!({"hits": 3}));
    }

    #[tokio::test]
    async fn retry_then_fallback_does_not_throw() {
        let client = Arc::new(FlakyClient { calls: AtomicU32::new(0), fail_times: 100 });
        let state = state_with(client);
        let sink = NullSink;
        let ctx = StepContext { state: &state, sink: &sink, stream_visible: false };
        let cfg = json!({
            "toolName": "web_search",
            "parameters": {"query": "{{state.query.message}}"},
            "outputField": "results",
            "errorHandling": {"retry": 1, "retryDelay": 1, "onError": "fallback", "fallbackValue": []}
        });
        let delta = execute(&cfg, &ctx).await.unwrap();
        assert_eq!(delta.data.unwrap()["results"], json!([]));
    }

    #[tokio::test]
    async fn retry_then_succeeds() {
        let client = Arc::new(FlakyClient { calls: AtomicU32::new(0), fail_times: 1 });
        let state = state_with(client);
        let sink = NullSink;
        let ctx = StepContext { state: &state, sink: &sink, stream_visible: false };
        let cfg = json!({
            "toolName": "web_search",
            "parameters": {"query": "x"},
            "outputField": "results",
            "errorHandling": {"retry": 2, "retryDelay": 1}
        });
        let delta = execute(&cfg, &ctx).await.unwrap();
        assert_eq!(delta.data.unwrap()["results"], json!({"hits": 3}));
    }
}
