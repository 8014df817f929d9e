//! Lookup of persisted [`NeuronConfig`] documents, the thing a
//! [`crate::registry::ProviderRegistry`] resolves a neuron id against
//! before building a [`graph_core::llm::ChatModel`].

use async_trait::async_trait;
use graph_core::model::NeuronConfig;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{LlmError, Result};

#[async_trait]
pub trait NeuronStore: Send + Sync {
    async fn get_neuron(&self, neuron_id: &str) -> Result<NeuronConfig>;
    async fn default_neuron_id(&self, user_id: &str) -> Result<String>;
}

/// Reference store for development and tests: neurons registered in
/// memory, one designated default per user.
pub struct InMemoryNeuronStore {
    neurons: RwLock<HashMap<String, NeuronConfig>>,
    defaults: RwLock<HashMap<String, String>>,
}

impl InMemoryNeuronStore {
    pub fn new() -> Self {
        Self {
            neurons: RwLock::new(HashMap::new()),
            defaults: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, neuron: NeuronConfig) {
        self.neurons.write().unwrap().insert(neuron.neuron_id.clone(), neuron);
    }

    pub fn set_default(&self, user_id: impl Into<String>, neuron_id: impl Into<String>) {
        self.defaults.write().unwrap().insert(user_id.into(), neuron_id.into());
    }
}

impl Default for InMemoryNeuronStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NeuronStore for InMemoryNeuronStore {
    async fn get_neuron(&self, neuron_id: &str) -> Result<NeuronConfig> {
        self.neurons
            .read()
            .unwrap()
            .get(neuron_id)
            .cloned()
            .ok_or_else(|| LlmError::NeuronNotFound(neuron_id.to_string()))
    }

    async fn default_neuron_id(&self, user_id: &str) -> Result<String> {
        self.defaults
            .read()
            .unwrap()
            .get(user_id)
            .cloned()
            .ok_or_else(|| LlmError::NeuronNotFound(format!("no default neuron for user '{user_id}'")))
    }
}
