//! LM trait seams consumed by the neuron step executor and implemented by
//! the `llm` crate's provider registry.
//!
//! `graph-core` depends only on these traits, never on a concrete
//! provider, so the engine stays provider-agnostic — per-user
//! instantiation without pooling is a concern of [`LmRegistry`]
//! implementers, not of this crate.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single chat message exchanged with an LM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// A request to a [`ChatModel`].
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    /// When set, the model must return content conforming to this JSON
    /// schema.
    pub structured_output: Option<StructuredOutputSpec>,
}

#[derive(Debug, Clone)]
pub struct StructuredOutputSpec {
    pub schema: serde_json::Value,
    pub method: String,
}

/// A non-streaming chat response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub usage: Option<UsageMetadata>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UsageMetadata {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub reasoning_tokens: Option<u32>,
    pub total_tokens: u32,
}

/// One chunk of a streamed chat response.
#[derive(Debug, Clone)]
pub struct ChatChunk {
    pub delta: String,
    pub done: bool,
    pub usage: Option<UsageMetadata>,
}

pub type ChatStream = BoxStream<'static, crate::error::Result<ChatChunk>>;

/// Provider-agnostic chat model handle (one fresh instance per
/// `(neuron_id, user_id)`, never shared).
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> crate::error::Result<ChatResponse>;
    async fn stream(&self, request: ChatRequest) -> crate::error::Result<ChatStream>;
}

/// Resolves an LM handle for a `(neuron_id, user_id)` pair, applying tier
/// gating: `user_tier` is the caller's account tier (lower number = higher
/// privilege; callers with an unknown tier pass the lowest privilege, 4).
/// Implemented by `llm::ProviderRegistry`.
#[async_trait]
pub trait LmRegistry: Send + Sync {
    async fn get_model(
        &self,
        neuron_id: &str,
        user_id: &str,
        user_tier: u8,
    ) -> crate::error::Result<std::sync::Arc<dyn ChatModel>>;

    /// The user's default neuron id, used when a neuron step omits
    /// `neuronId`.
    async fn default_neuron_id(&self, user_id: &str) -> crate::error::Result<String>;
}

/// A no-op metadata bag carried alongside tool/neuron calls for tracing.
pub type CallMetadata = HashMap<String, String>;
