//! Workflow registry: resolves a `(graphId, userId)` pair to a compiled,
//! ready-to-run graph, with the same LRU/TTL caching shape
//! `llm::ProviderRegistry` uses for neuron lookups, re-specialized for
//! `GraphConfig`/`CompiledGraph`.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use graph_core::compiler::{compile, CompiledGraph, UniversalNodeRegistry};
use graph_core::model::GraphConfig;
use lru::LruCache;
use parking_lot::Mutex;

use crate::error::{OrchestratorError, Result};
use crate::store::GraphStore;

const DEFAULT_CONFIG_CACHE_CAPACITY: usize = 100;
const DEFAULT_GRAPH_CACHE_CAPACITY: usize = 50;
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

struct CachedConfig {
    config: GraphConfig,
    cached_at: Instant,
}

struct CachedGraph {
    graph: Arc<CompiledGraph>,
    cached_at: Instant,
}

/// Usage counters, incremented asynchronously and never read on the
/// request-serving path — a request never waits on this bookkeeping.
#[derive(Default)]
struct UsageCounters {
    hits: std::sync::atomic::AtomicU64,
    compiles: std::sync::atomic::AtomicU64,
}

/// Resolves graphs through a [`GraphStore`], gates access the same way
/// `llm::ProviderRegistry` gates neurons (ownership, not a numeric tier
/// comparison — see `DESIGN.md`'s Open Question resolution #4), and
/// compiles on cache miss.
pub struct WorkflowRegistry<G: GraphStore> {
    store: G,
    universal_nodes: UniversalNodeRegistry,
    config_cache: Mutex<LruCache<(String, String), CachedConfig>>,
    graph_cache: Mutex<LruCache<(String, String), CachedGraph>>,
    ttl: Duration,
    usage: UsageCounters,
}

impl<G: GraphStore> WorkflowRegistry<G> {
    pub fn new(store: G, universal_nodes: UniversalNodeRegistry) -> Self {
        Self::with_cache_settings(
            store,
            universal_nodes,
            DEFAULT_CONFIG_CACHE_CAPACITY,
            DEFAULT_GRAPH_CACHE_CAPACITY,
            DEFAULT_CACHE_TTL,
        )
    }

    pub fn with_cache_settings(
        store: G,
        universal_nodes: UniversalNodeRegistry,
        config_capacity: usize,
        graph_capacity: usize,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            universal_nodes,
            config_cache: Mutex::new(LruCache::new(non_zero(config_capacity))),
            graph_cache: Mutex::new(LruCache::new(non_zero(graph_capacity))),
            ttl,
            usage: UsageCounters::default(),
        }
    }

    fn authorize(&self, graph: &GraphConfig, user_id: &str) -> Result<()> {
        if graph.owner_id == user_id || graph.owner_id == "system" {
            Ok(())
        } else {
            Err(OrchestratorError::AccessDenied(format!(
                "user '{user_id}' cannot use graph '{}'",
                graph.graph_id
            )))
        }
    }

    async fn resolve_config(&self, graph_id: &str, user_id: &str) -> Result<GraphConfig> {
        let key = (user_id.to_string(), graph_id.to_string());
        if let Some(cached) = self.config_cache.lock().get(&key) {
            if cached.cached_at.elapsed() < self.ttl {
                return Ok(cached.config.clone());
            }
        }

        let config = self.store.get_graph(graph_id).await?;
        self.authorize(&config, user_id)?;

        self.config_cache.lock().put(
            key,
            CachedConfig { config: config.clone(), cached_at: Instant::now() },
        );
        Ok(config)
    }

    /// Resolve and compile `graphId` for `userId`, serving from cache when
    /// possible. Bumps usage counters without blocking the caller.
    pub async fn get_graph(&self, graph_id: &str, user_id: &str) -> Result<Arc<CompiledGraph>> {
        let key = (user_id.to_string(), graph_id.to_string());
        if let Some(cached) = self.graph_cache.lock().get(&key) {
            if cached.cached_at.elapsed() < self.ttl {
                self.usage.hits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return Ok(cached.graph.clone());
            }
        }

        let config = self.resolve_config(graph_id, user_id).await?;
        let compiled = compile(&config, &self.universal_nodes).map_err(|e| match e {
            graph_core::GraphError::Validation { graph_id, messages } => {
                OrchestratorError::Validation { graph_id, messages }
            }
            graph_core::GraphError::CompilationFailed { graph_id, message } => {
                OrchestratorError::CompilationFailed { graph_id, message }
            }
            other => OrchestratorError::Graph(other),
        })?;
        let compiled = Arc::new(compiled);

        self.usage.compiles.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.graph_cache.lock().put(key, CachedGraph { graph: compiled.clone(), cached_at: Instant::now() });
        Ok(compiled)
    }

    pub async fn get_config(&self, graph_id: &str, user_id: &str) -> Result<GraphConfig> {
        self.resolve_config(graph_id, user_id).await
    }

    pub async fn get_user_graphs(&self, user_id: &str) -> Result<Vec<GraphConfig>> {
        self.store.user_graphs(user_id).await
    }

    /// Evict every cached entry for `user_id`, or the whole cache when
    /// `user_id` is `None`.
    pub fn clear_cache(&self, user_id: Option<&str>) {
        match user_id {
            Some(user_id) => {
                self.config_cache.lock().pop_entries(|(owner, _)| owner == user_id);
                self.graph_cache.lock().pop_entries(|(owner, _)| owner == user_id);
            }
            None => {
                self.config_cache.lock().clear();
                self.graph_cache.lock().clear();
            }
        }
    }
}

fn non_zero(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap_or(NonZeroUsize::new(1).unwrap())
}

/// `lru::LruCache` has no retain-by-predicate; this walks and re-inserts
/// the entries that should survive.
trait PopEntries<K, V> {
    fn pop_entries(&mut self, should_remove: impl Fn(&K) -> bool);
}

impl<K: std::hash::Hash + Eq + Clone, V> PopEntries<K, V> for LruCache<K, V> {
    fn pop_entries(&mut self, should_remove: impl Fn(&K) -> bool) {
        let doomed: Vec<K> = self.iter().map(|(k, _)| k.clone()).filter(|k| should_remove(k)).collect();
        for k in doomed {
            self.pop(&k);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryGraphStore;
    use graph_core::model::{EdgeDecl, GlobalConfig, NodeConfig, NodeDecl, NodeType, StepType};
    use serde_json::json;

    fn graph(id: &str, owner: &str) -> GraphConfig {
        GraphConfig {
            graph_id: id.into(),
            owner_id: owner.into(),
            tier: 2,
            is_default: false,
            name: "g".into(),
            description: String::new(),
            nodes: vec![NodeDecl {
                id: "n1".into(),
                node_type: NodeType::Universal,
                config: Some(NodeConfig::Single {
                    step_type: StepType::Transform,
                    config: json!({"operation": "set", "outputField": "hit", "value": "yes"}),
                }),
            }],
            edges: vec![
                EdgeDecl { from: "__start__".into(), to: Some("n1".into()), condition: None, targets: None, fallback: None },
                EdgeDecl { from: "n1".into(), to: Some("__end__".into()), condition: None, targets: None, fallback: None },
            ],
            global_config: GlobalConfig::default(),
        }
    }

    #[tokio::test]
    async fn owner_can_compile_their_own_graph() {
        let store = InMemoryGraphStore::new();
        store.register(graph("g1", "alice"));
        let registry = WorkflowRegistry::new(store, UniversalNodeRegistry::new());
        assert!(registry.get_graph("g1", "alice").await.is_ok());
    }

    #[tokio::test]
    async fn non_owner_is_denied() {
        let store = InMemoryGraphStore::new();
        store.register(graph("g1", "alice"));
        let registry = WorkflowRegistry::new(store, UniversalNodeRegistry::new());
        let err = registry.get_graph("g1", "bob").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::AccessDenied(_)));
    }

    #[tokio::test]
    async fn missing_graph_surfaces_not_found() {
        let store = InMemoryGraphStore::new();
        let registry = WorkflowRegistry::new(store, UniversalNodeRegistry::new());
        let err = registry.get_graph("ghost", "alice").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));
    }

    #[tokio::test]
    async fn compiled_graph_is_cached_across_calls() {
        let store = InMemoryGraphStore::new();
        store.register(graph("g1", "system"));
        let registry = WorkflowRegistry::new(store, UniversalNodeRegistry::new());
        let first = registry.get_graph("g1", "alice").await.unwrap();
        let second = registry.get_graph("g1", "alice").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn clear_cache_for_user_forces_recompile() {
        let store = InMemoryGraphStore::new();
        store.register(graph("g1", "system"));
        let registry = WorkflowRegistry::new(store, UniversalNodeRegistry::new());
        let first = registry.get_graph("g1", "alice").await.unwrap();
        registry.clear_cache(Some("alice"));
        let second = registry.get_graph("g1", "alice").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }
}
