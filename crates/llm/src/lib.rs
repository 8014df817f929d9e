//! Provider-agnostic chat model adapters and the neuron registry that
//! resolves a `(neuron_id, user_id)` pair to a freshly-built
//! [`graph_core::llm::ChatModel`], implementing `graph-core`'s
//! [`graph_core::llm::LmRegistry`] seam.

pub mod clients;
pub mod error;
pub mod neuron_store;
pub mod registry;

pub use clients::{AnthropicCompatibleModel, LocalModel, OpenAiCompatibleModel};
pub use error::{LlmError, Result};
pub use neuron_store::{InMemoryNeuronStore, NeuronStore};
pub use registry::ProviderRegistry;
