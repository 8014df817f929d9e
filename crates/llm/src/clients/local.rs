//! Chat model adapter for locally-hosted, Ollama-shaped endpoints: one
//! JSON object per newline rather than an SSE `data:` framing.

use async_trait::async_trait;
use futures::StreamExt;
use graph_core::error::{GraphError, Result as GraphResult};
use graph_core::llm::{ChatChunk, ChatModel, ChatRequest, ChatResponse, ChatStream, UsageMetadata};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

pub struct LocalModel {
    client: Client,
    endpoint: String,
    model: String,
}

impl LocalModel {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            model: model.into(),
        }
    }

    fn url(&self) -> String {
        format!("{}/api/chat", self.endpoint.trim_end_matches('/'))
    }

    fn build_request(&self, request: &ChatRequest, stream: bool) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| serde_json::json!({"role": m.role, "content": m.content}))
            .collect();
        let mut options = serde_json::Map::new();
        if let Some(t) = request.temperature {
            options.insert("temperature".into(), t.into());
        }
        if let Some(p) = request.top_p {
            options.insert("top_p".into(), p.into());
        }
        serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": stream,
            "options": options,
        })
    }
}

#[derive(Deserialize)]
struct OllamaChatLine {
    message: Option<OllamaMessage>,
    done: bool,
    #[serde(default)]
    prompt_eval_count: u32,
    #[serde(default)]
    eval_count: u32,
}

#[derive(Deserialize)]
struct OllamaMessage {
    content: String,
}

#[async_trait]
impl ChatModel for LocalModel {
    async fn chat(&self, request: ChatRequest) -> GraphResult<ChatResponse> {
        let body = self.build_request(&request, false);
        let resp = self
            .client
            .post(self.url())
            .json(&body)
            .send()
            .await
            .map_err(|e| GraphError::StepExecution(format!("local model request failed: {e}")))?
            .error_for_status()
            .map_err(|e| GraphError::StepExecution(format!("local model returned an error: {e}")))?;

        let parsed: OllamaChatLine = resp
            .json()
            .await
            .map_err(|e| GraphError::StepExecution(format!("invalid local model response: {e}")))?;

        Ok(ChatResponse {
            content: parsed.message.map(|m| m.content).unwrap_or_default(),
            usage: Some(UsageMetadata {
                input_tokens: parsed.prompt_eval_count,
                output_tokens: parsed.eval_count,
                reasoning_tokens: None,
                total_tokens: parsed.prompt_eval_count + parsed.eval_count,
            }),
        })
    }

    async fn stream(&self, request: ChatRequest) -> GraphResult<ChatStream> {
        let body = self.build_request(&request, true);
        let resp = self
            .client
            .post(self.url())
            .json(&body)
            .send()
            .await
            .map_err(|e| GraphError::StepExecution(format!("local model stream failed: {e}")))?
            .error_for_status()
            .map_err(|e| GraphError::StepExecution(format!("local model returned an error: {e}")))?;

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
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<OllamaChatLine>(&line) {
                        Ok(parsed) => {
                            let delta = parsed.message.map(|m| m.content).unwrap_or_default();
                            let usage = if parsed.done {
                                Some(UsageMetadata {
                                    input_tokens: parsed.prompt_eval_count,
                                    output_tokens: parsed.eval_count,
                                    reasoning_tokens: None,
                                    total_tokens: parsed.prompt_eval_count + parsed.eval_count,
                                })
                            } else {
                                None
                            };
                            if !delta.is_empty() || parsed.done {
                                yield Ok(ChatChunk { delta, done: parsed.done, usage });
                            }
                            if parsed.done {
                                return;
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

#[cfg(test)]
mod tests {
    use super::*;
    use graph_core::llm::ChatMessage;

    #[test]
    fn build_request_nests_sampling_params_under_options() {
        let model = LocalModel::new("http://localhost:11434", "llama3");
        let req = ChatRequest {
            messages: vec![ChatMessage { role: "user".into(), content: "hi".into() }],
            temperature: Some(0.5),
            max_tokens: None,
            top_p: None,
            structured_output: None,
        };
        let body = model.build_request(&req, false);
        assert_eq!(body["options"]["temperature"], 0.5);
        assert_eq!(body["model"], "llama3");
    }
}
