//! Concrete [`graph_core::llm::ChatModel`] implementations, one per wire
//! format in [`graph_core::model::ProviderKind`].

pub mod anthropic_compatible;
pub mod local;
pub mod openai_compatible;

pub use anthropic_compatible::AnthropicCompatibleModel;
pub use local::LocalModel;
pub use openai_compatible::OpenAiCompatibleModel;
