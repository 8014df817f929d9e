//! Trait seams over the persistent collections the front door and
//! workflow registry read from (`graphs`, `users`; `universal_nodes` is
//! folded into [`crate::registry::WorkflowRegistry`] construction), plus
//! in-memory reference implementations. Grounded on the same
//! thread-safe-map-of-documents pattern as `llm::neuron_store`.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use graph_core::model::GraphConfig;

use crate::error::{OrchestratorError, Result};

#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn get_graph(&self, graph_id: &str) -> Result<GraphConfig>;
    async fn user_graphs(&self, user_id: &str) -> Result<Vec<GraphConfig>>;
}

/// Reference store for development and tests.
pub struct InMemoryGraphStore {
    graphs: RwLock<HashMap<String, GraphConfig>>,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self { graphs: RwLock::new(HashMap::new()) }
    }

    pub fn register(&self, graph: GraphConfig) {
        self.graphs.write().unwrap().insert(graph.graph_id.clone(), graph);
    }
}

impl Default for InMemoryGraphStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn get_graph(&self, graph_id: &str) -> Result<GraphConfig> {
        self.graphs
            .read()
            .unwrap()
            .get(graph_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(format!("graph '{graph_id}'")))
    }

    async fn user_graphs(&self, user_id: &str) -> Result<Vec<GraphConfig>> {
        Ok(self
            .graphs
            .read()
            .unwrap()
            .values()
            .filter(|g| g.owner_id == user_id || g.owner_id == "system")
            .cloned()
            .collect())
    }
}

/// A user's resolved preferences, read once at the start of `respond`.
#[derive(Debug, Clone)]
pub struct UserSettings {
    pub account_tier: u8,
    pub default_neuron_id: Option<String>,
    pub default_worker_neuron_id: Option<String>,
    pub default_graph_id: Option<String>,
}

impl Default for UserSettings {
    /// Lowest-privilege tier and no configured defaults, the safe
    /// fallback used when a settings lookup fails.
    fn default() -> Self {
        Self {
            account_tier: 4,
            default_neuron_id: None,
            default_worker_neuron_id: None,
            default_graph_id: None,
        }
    }
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_settings(&self, user_id: &str) -> Result<UserSettings>;
}

pub struct InMemoryUserStore {
    settings: RwLock<HashMap<String, UserSettings>>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self { settings: RwLock::new(HashMap::new()) }
    }

    pub fn register(&self, user_id: impl Into<String>, settings: UserSettings) {
        self.settings.write().unwrap().insert(user_id.into(), settings);
    }
}

impl Default for InMemoryUserStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn get_settings(&self, user_id: &str) -> Result<UserSettings> {
        Ok(self.settings.read().unwrap().get(user_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graph_core::model::{EdgeDecl, GlobalConfig, NodeDecl, NodeType};

    fn graph(id: &str, owner: &str) -> GraphConfig {
        GraphConfig {
            graph_id: id.into(),
            owner_id: owner.into(),
            tier: 2,
            is_default: false,
            name: "g".into(),
            description: String::new(),
            nodes: vec![NodeDecl { id: "n1".into(), node_type: NodeType::Universal, config: None }],
            edges: vec![EdgeDecl {
                from: "__start__".into(),
                to: Some("n1".into()),
                condition: None,
                targets: None,
                fallback: None,
            }],
            global_config: GlobalConfig::default(),
        }
    }

    #[tokio::test]
    async fn registered_graph_is_retrievable() {
        let store = InMemoryGraphStore::new();
        store.register(graph("g1", "system"));
        assert!(store.get_graph("g1").await.is_ok());
    }

    #[tokio::test]
    async fn missing_graph_surfaces_not_found() {
        let store = InMemoryGraphStore::new();
        let err = store.get_graph("ghost").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));
    }

    #[tokio::test]
    async fn user_graphs_filters_to_owned_and_system() {
        let store = InMemoryGraphStore::new();
        store.register(graph("mine", "alice"));
        store.register(graph("shared", "system"));
        store.register(graph("other", "bob"));
        let graphs = store.user_graphs("alice").await.unwrap();
        let ids: Vec<_> = graphs.iter().map(|g| g.graph_id.as_str()).collect();
        assert!(ids.contains(&"mine"));
        assert!(ids.contains(&"shared"));
        assert!(!ids.contains(&"other"));
    }

    #[tokio::test]
    async fn unknown_user_gets_default_settings() {
        let store = InMemoryUserStore::new();
        let settings = store.get_settings("ghost").await.unwrap();
        assert_eq!(settings.account_tier, 4);
    }
}
