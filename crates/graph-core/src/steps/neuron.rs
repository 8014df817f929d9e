//! Neuron step: calls an LM and writes its output to a state field.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{GraphError, Result};
use crate::llm::{ChatMessage, ChatRequest, StructuredOutputSpec};
use crate::render::render;
use crate::state::StateDelta;

use super::{with_error_policy, ErrorPolicy, StepContext};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NeuronStepConfig {
    #[serde(default)]
    pub neuron_id: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    pub user_prompt: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    pub output_field: String,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub structured_output: Option<StructuredOutputConfig>,
    #[serde(default)]
    pub error_handling: ErrorPolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StructuredOutputConfig {
    pub schema: Value,
    #[serde(default = "default_method")]
    pub method: String,
}

fn default_method() -> String {
    "json_schema".to_string()
}

pub async fn execute(config: &Value, ctx: &StepContext<'_>) -> Result<StateDelta> {
    let cfg: NeuronStepConfig = serde_json::from_value(config.clone())
        .map_err(|e| GraphError::StepExecution(format!("invalid neuron step config: {e}")))?;

    with_error_policy(&cfg.error_handling, &cfg.output_field, || {
        run_once(&cfg, ctx)
    })
    .await
}

async fn run_once(cfg: &NeuronStepConfig, ctx: &StepContext<'_>) -> Result<StateDelta> {
    let state = ctx.state;
    let messages = build_messages(cfg, ctx)?;

    let neuron_id = match &cfg.neuron_id {
        Some(id) => id.clone(),
        None => state.handles.lm_registry.default_neuron_id(&state.user_id).await?,
    };
    let model = state
        .handles
        .lm_registry
        .get_model(&neuron_id, &state.user_id, state.account_tier)
        .await?;

    let request = ChatRequest {
        messages,
        temperature: cfg.temperature,
        max_tokens: cfg.max_tokens,
        top_p: None,
        structured_output: cfg.structured_output.as_ref().map(|s| StructuredOutputSpec {
            schema: s.schema.clone(),
            method: s.method.clone(),
        }),
    };

    let output_text = if cfg.structured_output.is_some() {
        let response = model.chat(request).await?;
        response.content
    } else {
        use futures::StreamExt;
        let mut stream = model.stream(request).await?;
        let mut accumulated = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            accumulated.push_str(&chunk.delta);
            if cfg.stream && ctx.stream_visible {
                ctx.sink.content_chunk(&chunk.delta).await;
            }
        }
        accumulated
    };

    let mut fields = serde_json::Map::new();
    fields.insert(cfg.output_field.clone(), Value::String(output_text));
    Ok(StateDelta::data_only(Value::Object(fields)))
}

/// Build the outgoing message list: when `userPrompt` is exactly a single
/// placeholder resolving to an array, that array is taken as the
/// pre-built message list; `systemPrompt`, if present, replaces the
/// leading system message or is prepended.
fn build_messages(cfg: &NeuronStepConfig, ctx: &StepContext<'_>) -> Result<Vec<ChatMessage>> {
    let trimmed = cfg.user_prompt.trim();
    if trimmed.starts_with("{{state.") && trimmed.ends_with("}}") {
        let path = &trimmed[8..trimmed.len() - 2];
        if let Some(Value::Array(items)) = ctx.state.get_path(path) {
            let mut messages: Vec<ChatMessage> = items
                .iter()
                .filter_map(|item| {
                    Some(ChatMessage {
                        role: item.get("role")?.as_str()?.to_string(),
                        content: item.get("content")?.as_str().unwrap_or_default().to_string(),
                    })
                })
                .collect();
            if let Some(system) = &cfg.system_prompt {
                let rendered = render(system, ctx.state)?;
                if messages.first().map(|m| m.role == "system").unwrap_or(false) {
                    messages[0].content = rendered;
                } else {
                    messages.insert(0, ChatMessage { role: "system".into(), content: rendered });
                }
            }
            return Ok(messages);
        }
    }

    let mut messages = Vec::new();
    if let Some(system) = &cfg.system_prompt {
        messages.push(ChatMessage {
            role: "system".into(),
            content: render(system, ctx.state)?,
        });
    }
    messages.push(ChatMessage {
        role: "user".into(),
        content: render(&cfg.user_prompt, ctx.state)?,
    });
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatModel, ChatResponse, LmRegistry};
    use crate::state::{Handles, RuntimeState};
    use crate::steps::NullSink;
    use crate::tool::tests::NoopToolClient;
    use async_trait::async_trait;
    use futures::stream;
    use serde_json::json;
    use std::sync::Arc;

    struct FixedModel(String);

    #[async_trait]
    impl ChatModel for FixedModel {
        async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse> {
            Ok(ChatResponse {
                content: self.0.clone(),
                usage: None,
            })
        }

        async fn stream(&self, _request: ChatRequest) -> Result<crate::llm::ChatStream> {
            let word = self.0.clone();
            let s = stream::iter(vec![Ok(crate::llm::ChatChunk {
                delta: word,
                done: true,
                usage: None,
            })]);
            Ok(Box::pin(s))
        }
    }

    struct FixedRegistry(String);

    #[async_trait]
    impl LmRegistry for FixedRegistry {
        async fn get_model(
            &self,
            _neuron_id: &str,
            _user_id: &str,
            _user_tier: u8,
        ) -> Result<Arc<dyn ChatModel>> {
            Ok(Arc::new(FixedModel(self.0.clone())))
        }
        async fn default_neuron_id(&self, _user_id: &str) -> Result<String> {
            Ok("default".into())
        }
    }

    fn state() -> RuntimeState {
        let handles = Handles {
            lm_registry: Arc::new(FixedRegistry("hello there".into())),
            tool_client: Arc::new(NoopToolClient),
        };
        RuntimeState::new(json!({}), json!({}), "u1", 4, handles, "m", "g", "c")
    }

    #[tokio::test]
    async fn writes_accumulated_output_to_field() {
        let state = state();
        let sink = NullSink;
        let ctx = StepContext { state: &state, sink: &sink, stream_visible: false };
        let cfg = json!({
            "userPrompt": "say hi",
            "outputField": "greeting",
        });
        let delta = execute(&cfg, &ctx).await.unwrap();
        assert_eq!(delta.data.unwrap()["greeting"], json!("hello there"));
    }
}
