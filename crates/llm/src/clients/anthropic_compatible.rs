//! Chat model adapter for the Anthropic Messages API shape.
//!
//! Anthropic separates a leading `system` message from the turn list,
//! unlike the OpenAI-wire adapters, so requests are translated before
//! being sent.

use async_trait::async_trait;
use futures::StreamExt;
use graph_core::error::{GraphError, Result as GraphResult};
use graph_core::llm::{ChatChunk, ChatModel, ChatRequest, ChatResponse, ChatStream, UsageMetadata};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicCompatibleModel {
    client: Client,
    endpoint: String,
    model: String,
    api_key: String,
    max_tokens_default: u32,
}

impl AnthropicCompatibleModel {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            model: model.into(),
            api_key: api_key.into(),
            max_tokens_default: 4096,
        }
    }

    fn url(&self) -> String {
        format!("{}/messages", self.endpoint.trim_end_matches('/'))
    }

    fn build_request(&self, request: &ChatRequest, stream: bool) -> Value {
        let mut system = None;
        let mut turns = Vec::new();
        for message in &request.messages {
            if message.role == "system" {
                system = Some(message.content.clone());
            } else {
                turns.push(serde_json::json!({"role": message.role, "content": message.content}));
            }
        }

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": turns,
            "max_tokens": request.max_tokens.unwrap_or(self.max_tokens_default),
            "stream": stream,
        });
        if let Some(system) = system {
            body["system"] = system.into();
        }
        if let Some(t) = request.temperature {
            body["temperature"] = t.into();
        }
        if let Some(p) = request.top_p {
            body["top_p"] = p.into();
        }
        body
    }
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    ContentBlockDelta { delta: DeltaPayload },
    MessageDelta { usage: Option<AnthropicDeltaUsage> },
    MessageStop,
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct DeltaPayload {
    text: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicDeltaUsage {
    output_tokens: u32,
}

#[async_trait]
impl ChatModel for AnthropicCompatibleModel {
    async fn chat(&self, request: ChatRequest) -> GraphResult<ChatResponse> {
        let body = self.build_request(&request, false);
        let resp = self
            .client
            .post(self.url())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| GraphError::StepExecution(format!("anthropic-compatible request failed: {e}")))?
            .error_for_status()
            .map_err(|e| GraphError::StepExecution(format!("anthropic-compatible returned an error: {e}")))?;

        let parsed: MessagesResponse = resp
            .json()
            .await
            .map_err(|e| GraphError::StepExecution(format!("invalid anthropic-compatible response: {e}")))?;

        let content = parsed
            .content
            .into_iter()
            .filter(|b| b.kind == "text")
            .filter_map(|b| b.text)
            .collect::<Vec<_>>()
            .join("");

        Ok(ChatResponse {
            content,
            usage: parsed.usage.map(|u| UsageMetadata {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
                reasoning_tokens: None,
                total_tokens: u.input_tokens + u.output_tokens,
            }),
        })
    }

    async fn stream(&self, request: ChatRequest) -> GraphResult<ChatStream> {
        let body = self.build_request(&request, true);
        let resp = self
            .client
            .post(self.url())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| GraphError::StepExecution(format!("anthropic-compatible stream failed: {e}")))?
            .error_for_status()
            .map_err(|e| GraphError::StepExecution(format!("anthropic-compatible returned an error: {e}")))?;

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
                    if data.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<StreamEvent>(data) {
                        Ok(StreamEvent::ContentBlockDelta { delta }) => {
                            if let Some(text) = delta.text {
                                if !text.is_empty() {
                                    yield Ok(ChatChunk { delta: text, done: false, usage: None });
                                }
                            }
                        }
                        Ok(StreamEvent::MessageDelta { usage }) => {
                            if let Some(usage) = usage {
                                yield Ok(ChatChunk {
                                    delta: String::new(),
                                    done: false,
                                    usage: Some(UsageMetadata {
                                        input_tokens: 0,
                                        output_tokens: usage.output_tokens,
                                        reasoning_tokens: None,
                                        total_tokens: usage.output_tokens,
                                    }),
                                });
                            }
                        }
                        Ok(StreamEvent::MessageStop) => {
                            yield Ok(ChatChunk { delta: String::new(), done: true, usage: None });
                            return;
                        }
                        Ok(StreamEvent::Other) => continue,
                        Err(_) => continue,
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graph_core::llm::ChatMessage;

    #[test]
    fn build_request_splits_out_system_message() {
        let model = AnthropicCompatibleModel::new("http://localhost:8000", "claude-test", "key");
        let req = ChatRequest {
            messages: vec![
                ChatMessage { role: "system".into(), content: "be terse".into() },
                ChatMessage { role: "user".into(), content: "hi".into() },
            ],
            temperature: None,
            max_tokens: None,
            top_p: None,
            structured_output: None,
        };
        let body = model.build_request(&req, false);
        assert_eq!(body["system"], "be terse");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["max_tokens"], 4096);
    }
}
