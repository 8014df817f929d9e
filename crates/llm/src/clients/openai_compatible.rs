//! Chat model adapter for OpenAI-wire-compatible endpoints (OpenAI
//! itself, and any `Custom`/`GoogleCompatible` endpoint that speaks the
//! same `/chat/completions` shape).

use async_trait::async_trait;
use futures::StreamExt;
use graph_core::error::{GraphError, Result as GraphResult};
use graph_core::llm::{ChatChunk, ChatMessage, ChatModel, ChatRequest, ChatResponse, ChatStream, UsageMetadata};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

pub struct OpenAiCompatibleModel {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl OpenAiCompatibleModel {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            model: model.into(),
            api_key,
        }
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.endpoint.trim_end_matches('/'))
    }

    fn build_request(&self, request: &ChatRequest, stream: bool) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| serde_json::json!({"role": m.role, "content": m.content}))
            .collect();
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": stream,
        });
        if let Some(t) = request.temperature {
            body["temperature"] = t.into();
        }
        if let Some(t) = request.max_tokens {
            body["max_tokens"] = t.into();
        }
        if let Some(p) = request.top_p {
            body["top_p"] = p.into();
        }
        if let Some(structured) = &request.structured_output {
            body["response_format"] = serde_json::json!({
                "type": "json_schema",
                "json_schema": { "name": "response", "schema": structured.schema },
            });
        }
        body
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    content: Option<String>,
}

#[async_trait]
impl ChatModel for OpenAiCompatibleModel {
    async fn chat(&self, request: ChatRequest) -> GraphResult<ChatResponse> {
        let body = self.build_request(&request, false);
        let resp = self
            .authed(self.client.post(self.url()).json(&body))
            .send()
            .await
            .map_err(|e| GraphError::StepExecution(format!("openai-compatible request failed: {e}")))?
            .error_for_status()
            .map_err(|e| GraphError::StepExecution(format!("openai-compatible returned an error: {e}")))?;

        let parsed: CompletionResponse = resp
            .json()
            .await
            .map_err(|e| GraphError::StepExecution(format!("invalid openai-compatible response: {e}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        Ok(ChatResponse {
            content,
            usage: parsed.usage.map(|u| UsageMetadata {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
                reasoning_tokens: None,
                total_tokens: u.total_tokens,
            }),
        })
    }

    async fn stream(&self, request: ChatRequest) -> GraphResult<ChatStream> {
        let body = self.build_request(&request, true);
        let resp = self
            .authed(self.client.post(self.url()).json(&body))
            .send()
            .await
            .map_err(|e| GraphError::StepExecution(format!("openai-compatible stream failed: {e}")))?
            .error_for_status()
            .map_err(|e| GraphError::StepExecution(format!("openai-compatible returned an error: {e}")))?;

        let byte_stream = resp.bytes_stream();
        let stream = async_stream::stream! {
            let mut buffer = String::new();
            futures::pin_mut!(byte_stream);
            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(GraphError::StepExecution(format!("stream read failed: {e}")));
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);
                    let Some(data) = line.strip_prefix("data:") else { continue };
                    let data = data.trim();
                    if data == "[DONE]" {
                        yield Ok(ChatChunk { delta: String::new(), done: true, usage: None });
                        return;
                    }
                    if data.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<StreamChunk>(data) {
                        Ok(parsed) => {
                            let delta = parsed
                                .choices
                                .into_iter()
                                .next()
                                .and_then(|c| c.delta.content)
                                .unwrap_or_default();
                            if !delta.is_empty() {
                                yield Ok(ChatChunk { delta, done: false, usage: None });
                            }
                        }
                        Err(_) => continue,
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}
