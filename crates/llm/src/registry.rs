//! [`graph_core::llm::LmRegistry`] implementation: resolves a neuron id
//! to a freshly-built [`ChatModel`], caching the looked-up
//! [`NeuronConfig`] (never the model instance itself — every call gets
//! its own client, per the trait's contract) behind an LRU with a TTL.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use graph_core::error::{GraphError, Result as GraphResult};
use graph_core::llm::{ChatModel, LmRegistry};
use graph_core::model::{NeuronConfig, ProviderKind};
use lru::LruCache;
use parking_lot::Mutex;

use crate::clients::{AnthropicCompatibleModel, LocalModel, OpenAiCompatibleModel};
use crate::neuron_store::NeuronStore;

const DEFAULT_CACHE_CAPACITY: usize = 100;
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

struct CachedNeuron {
    config: NeuronConfig,
    cached_at: Instant,
}

/// Resolves neurons through a [`NeuronStore`], gates access by ownership
/// plus tier, and builds a fresh provider client per call. The config
/// cache is keyed by `(user_id, neuron_id)`, not `neuron_id` alone, since
/// access (and therefore what's safe to serve from cache) depends on who's
/// asking.
pub struct ProviderRegistry<S: NeuronStore> {
    store: S,
    cache: Mutex<LruCache<(String, String), CachedNeuron>>,
    ttl: Duration,
}

impl<S: NeuronStore> ProviderRegistry<S> {
    pub fn new(store: S) -> Self {
        Self::with_cache_settings(store, DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL)
    }

    pub fn with_cache_settings(store: S, capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self {
            store,
            cache: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    async fn resolve_neuron(&self, neuron_id: &str, user_id: &str) -> GraphResult<NeuronConfig> {
        let key = (user_id.to_string(), neuron_id.to_string());
        if let Some(cached) = self.cache.lock().get(&key) {
            if cached.cached_at.elapsed() < self.ttl {
                return Ok(cached.config.clone());
            }
        }

        let config = self
            .store
            .get_neuron(neuron_id)
            .await
            .map_err(GraphError::from)?;

        self.cache.lock().put(
            key,
            CachedNeuron {
                config: config.clone(),
                cached_at: Instant::now(),
            },
        );

        Ok(config)
    }

    /// Owner-owned neurons are always accessible to their owner. System
    /// neurons require `user_tier <= neuron.tier` (lower number = higher
    /// privilege). Any other owner's neuron is never accessible.
    fn authorize(&self, neuron: &NeuronConfig, user_id: &str, user_tier: u8) -> GraphResult<()> {
        let allowed = if neuron.owner_id == user_id {
            true
        } else if neuron.owner_id == "system" {
            user_tier <= neuron.tier
        } else {
            false
        };
        if allowed {
            Ok(())
        } else {
            Err(GraphError::AccessDenied(format!(
                "user '{user_id}' cannot use neuron '{}'",
                neuron.neuron_id
            )))
        }
    }

    fn build_model(&self, neuron: &NeuronConfig) -> GraphResult<Arc<dyn ChatModel>> {
        let model: Arc<dyn ChatModel> = match neuron.provider {
            ProviderKind::OpenaiCompatible | ProviderKind::GoogleCompatible | ProviderKind::Custom => {
                Arc::new(OpenAiCompatibleModel::new(
                    neuron.endpoint.clone(),
                    neuron.model.clone(),
                    neuron.api_key.clone(),
                ))
            }
            ProviderKind::AnthropicCompatible => {
                let api_key = neuron.api_key.clone().ok_or_else(|| {
                    GraphError::StepExecution(format!(
                        "neuron '{}' uses anthropic-compatible provider but has no api_key",
                        neuron.neuron_id
                    ))
                })?;
                Arc::new(AnthropicCompatibleModel::new(
                    neuron.endpoint.clone(),
                    neuron.model.clone(),
                    api_key,
                ))
            }
            ProviderKind::Local => {
                Arc::new(LocalModel::new(neuron.endpoint.clone(), neuron.model.clone()))
            }
        };
        Ok(model)
    }
}

#[async_trait]
impl<S: NeuronStore + Send + Sync> LmRegistry for ProviderRegistry<S> {
    async fn get_model(&self, neuron_id: &str, user_id: &str, user_tier: u8) -> GraphResult<Arc<dyn ChatModel>> {
        let neuron = self.resolve_neuron(neuron_id, user_id).await?;
        self.authorize(&neuron, user_id, user_tier)?;
        self.build_model(&neuron)
    }

    async fn default_neuron_id(&self, user_id: &str) -> GraphResult<String> {
        self.store.default_neuron_id(user_id).await.map_err(GraphError::from)
    }
}
