//! The orchestrator front door: the single `respond` entry point a
//! transport handler calls once per user turn. Resolves the caller's
//! graph, assembles the initial [`RuntimeState`], walks the compiled
//! graph to completion, and reconciles the result back into the
//! conversation and generation stores.
//!
//! Grounded on `orchestrator/src/services/workflow.rs`'s
//! spawn-a-background-task-and-stream-events shape for `execute_workflow`,
//! generalized here into an explicit entry-node-to-`__end__` walk since
//! this system's compiled graph (unlike that service's DB-driven
//! `WorkflowExecutionEngine`) already carries its own routing table.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use regex::Regex;
use graph_core::compiler::{is_terminal, CompiledGraph};
use graph_core::llm::{CallMetadata, LmRegistry};
use graph_core::model::END;
use graph_core::state::{reduce, Handles, RuntimeState};
use graph_core::steps::{NullSink, StreamSink};
use graph_core::tool::ToolClient;
use graph_core::universal_node::execute_node;
use graph_checkpoint::{GenerationEvent, GenerationStore};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::{Config, SYSTEM_DEFAULT_GRAPH_ID, SYSTEM_SIMPLE_GRAPH_ID};
use crate::error::{OrchestratorError, Result};
use crate::pipeline::{reconstruct_tool_history, CancellationRegistry, GenerationSink, ToolExecution};
use crate::registry::WorkflowRegistry;
use crate::store::{GraphStore, UserSettings, UserStore};

const APPEND_MESSAGE_TOOL: &str = "conversation.append_message";

/// A caller-supplied `conversationId`/`graphId` ends up as a store key and
/// travels into tool call metadata, so it's restricted to a safe
/// identifier shape rather than accepted as arbitrary text.
fn identifier_pattern() -> &'static Regex {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.:-]{1,256}$").expect("identifier pattern is valid"))
}

fn validate_identifier(field: &'static str, value: &str) -> Result<()> {
    if identifier_pattern().is_match(value) {
        Ok(())
    } else {
        Err(OrchestratorError::InvalidIdentifier { field, value: value.to_string() })
    }
}

/// One user turn. `graph_id`/`conversation_id` are optional overrides; when
/// absent the caller's default graph and a fresh conversation are used.
pub struct RespondRequest {
    pub user_id: String,
    pub query: Value,
    pub options: Value,
    pub graph_id: Option<String>,
    pub conversation_id: Option<String>,
    pub stream: bool,
}

#[derive(Debug)]
pub struct RespondOutcome {
    pub conversation_id: String,
    pub generation_id: String,
    pub user_message_id: String,
    pub assistant_message_id: String,
    pub content: String,
    pub tool_history: Vec<ToolExecution>,
}

/// Owns every dependency `respond` needs: the workflow registry, the
/// provider/tool seams nodes call through, the shared generation store,
/// and the user-settings lookup.
pub struct Orchestrator<G: GraphStore> {
    registry: Arc<WorkflowRegistry<G>>,
    user_store: Arc<dyn UserStore>,
    generation_store: Arc<dyn GenerationStore>,
    lm_registry: Arc<dyn LmRegistry>,
    tool_client: Arc<dyn ToolClient>,
    cancellations: Arc<CancellationRegistry>,
    active_by_conversation: DashMap<String, String>,
    config: Config,
}

impl<G: GraphStore> Orchestrator<G> {
    pub fn new(
        registry: Arc<WorkflowRegistry<G>>,
        user_store: Arc<dyn UserStore>,
        generation_store: Arc<dyn GenerationStore>,
        lm_registry: Arc<dyn LmRegistry>,
        tool_client: Arc<dyn ToolClient>,
        config: Config,
    ) -> Self {
        Self {
            registry,
            user_store,
            generation_store,
            lm_registry,
            tool_client,
            cancellations: Arc::new(CancellationRegistry::new()),
            active_by_conversation: DashMap::new(),
            config,
        }
    }

    /// Cancel an in-flight generation by id. Returns `false` if nothing
    /// was running under that id.
    pub fn abort_stream(&self, generation_id: &str) -> bool {
        self.cancellations.abort(generation_id)
    }

    /// The shared generation store, for transports that subscribe to a
    /// generation's event stream directly (e.g. an SSE handler) rather
    /// than going through `respond`'s own return value.
    pub fn generation_store(&self) -> &Arc<dyn GenerationStore> {
        &self.generation_store
    }

    pub async fn respond(&self, request: RespondRequest) -> Result<RespondOutcome> {
        if request.user_id.trim().is_empty() {
            return Err(OrchestratorError::MissingField("userId"));
        }
        if let Some(conversation_id) = &request.conversation_id {
            validate_identifier("conversationId", conversation_id)?;
        }
        if let Some(graph_id) = &request.graph_id {
            validate_identifier("graphId", graph_id)?;
        }

        let settings = match self.user_store.get_settings(&request.user_id).await {
            Ok(settings) => settings,
            Err(err) => {
                tracing::warn!(user_id = %request.user_id, error = %err, "user settings lookup failed, using defaults");
                UserSettings::default()
            }
        };

        let requested_graph_id = request
            .graph_id
            .clone()
            .or_else(|| settings.default_graph_id.clone())
            .unwrap_or_else(|| SYSTEM_DEFAULT_GRAPH_ID.to_string());
        let graph = self.resolve_graph(&requested_graph_id, &request.user_id).await?;

        let conversation_id = request.conversation_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        let generation_id = Uuid::new_v4().to_string();
        let user_message_id = Uuid::new_v4().to_string();
        let assistant_message_id = Uuid::new_v4().to_string();

        self.begin_generation(&conversation_id, &generation_id, &user_message_id).await?;

        let result = self
            .run(&graph, &request, &settings, RunIds {
                conversation_id: conversation_id.clone(),
                generation_id: generation_id.clone(),
                user_message_id: user_message_id.clone(),
                assistant_message_id: assistant_message_id.clone(),
            })
            .await;

        self.active_by_conversation.remove(&conversation_id);
        self.cancellations.release(&generation_id);

        match result {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                let _ = self
                    .generation_store
                    .publish(&generation_id, GenerationEvent::Error { message: err.to_string() })
                    .await;
                Err(err)
            }
        }
    }

    async fn begin_generation(&self, conversation_id: &str, generation_id: &str, user_message_id: &str) -> Result<()> {
        match self.active_by_conversation.entry(conversation_id.to_string()) {
            Entry::Occupied(_) => return Err(OrchestratorError::AlreadyInProgress(conversation_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(generation_id.to_string());
            }
        }
        if let Err(err) = self.generation_store.create(user_message_id, generation_id, conversation_id).await {
            self.active_by_conversation.remove(conversation_id);
            return Err(err.into());
        }
        Ok(())
    }

    /// Resolve `graph_id` for `user_id`, falling back first to the system
    /// default graph and then to the minimal system graph when the
    /// requested (or default) graph can't be resolved.
    async fn resolve_graph(&self, graph_id: &str, user_id: &str) -> Result<Arc<CompiledGraph>> {
        match self.registry.get_graph(graph_id, user_id).await {
            Ok(graph) => Ok(graph),
            Err(OrchestratorError::NotFound(_) | OrchestratorError::AccessDenied(_)) if graph_id != SYSTEM_DEFAULT_GRAPH_ID => {
                tracing::warn!(graph_id, "graph unavailable, falling back to system default");
                self.resolve_fallback(user_id).await
            }
            Err(err) => Err(err),
        }
    }

    async fn resolve_fallback(&self, user_id: &str) -> Result<Arc<CompiledGraph>> {
        match self.registry.get_graph(SYSTEM_DEFAULT_GRAPH_ID, user_id).await {
            Ok(graph) => Ok(graph),
            Err(_) => {
                tracing::warn!("system default graph unavailable, falling back to system simple graph");
                self.registry.get_graph(SYSTEM_SIMPLE_GRAPH_ID, user_id).await
            }
        }
    }

    async fn run(&self, graph: &CompiledGraph, request: &RespondRequest, settings: &UserSettings, ids: RunIds) -> Result<RespondOutcome> {
        self.append_message(&ids.conversation_id, &ids.user_message_id, "user", &request.query).await?;

        let handles = Handles { lm_registry: self.lm_registry.clone(), tool_client: self.tool_client.clone() };
        let mut state = RuntimeState::new(
            request.query.clone(),
            request.options.clone(),
            request.user_id.clone(),
            settings.account_tier,
            handles,
            ids.user_message_id.clone(),
            ids.generation_id.clone(),
            ids.conversation_id.clone(),
        );
        state.step_stream_visible = request.stream;
        state.data = json!({ "systemPrompt": self.config.system_prompt });

        let sink: Arc<dyn StreamSink> = if request.stream {
            GenerationSink::new(self.generation_store.clone(), ids.generation_id.clone())
        } else {
            Arc::new(NullSink)
        };

        let cancel = self.cancellations.register(&ids.generation_id);
        let deadline = tokio::time::Instant::now() + self.config.stream_timeout;

        let mut current = graph
            .entry_node()
            .ok_or_else(|| OrchestratorError::CompilationFailed { graph_id: graph.graph_id.clone(), message: "graph has no entry node".into() })?;

        while !is_terminal(&current) {
            let node = graph.nodes.get(&current).ok_or_else(|| OrchestratorError::Graph(graph_core::GraphError::UnknownNode(current.clone())))?;

            let delta = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled(ids.generation_id.clone())),
                _ = tokio::time::sleep_until(deadline) => return Err(OrchestratorError::StreamTimeout(self.config.stream_timeout)),
                result = execute_node(node, &state, sink.as_ref()) => result?,
            };

            reduce(&mut state, &delta);
            current = graph
                .edges
                .get(&current)
                .and_then(|edges| edges.first())
                .map(|edge| edge.resolve(&state))
                .unwrap_or_else(|| END.to_string());
        }

        sink.finish().await;

        // A node writes its answer to `data.response`; `RuntimeState::response`
        // is reserved for structured per-step responses, not the final reply.
        let final_content = state
            .data
            .get("response")
            .and_then(|v| v.as_str())
            .map(String::from)
            .unwrap_or_default();

        self.append_message(&ids.conversation_id, &ids.assistant_message_id, "assistant", &json!(final_content)).await?;

        let tool_history = {
            let generation_state = self.generation_store.get_state(&ids.generation_id).await?;
            reconstruct_tool_history(&generation_state.events)
        };

        self.generation_store
            .publish(&ids.generation_id, GenerationEvent::Done { final_response: json!({ "content": final_content }) })
            .await?;

        self.spawn_background_followups(&ids.conversation_id, &ids.generation_id);

        Ok(RespondOutcome {
            conversation_id: ids.conversation_id,
            generation_id: ids.generation_id,
            user_message_id: ids.user_message_id,
            assistant_message_id: ids.assistant_message_id,
            content: final_content,
            tool_history,
        })
    }

    async fn append_message(&self, conversation_id: &str, message_id: &str, role: &str, content: &Value) -> Result<()> {
        let mut meta = CallMetadata::new();
        meta.insert("conversationId".to_string(), conversation_id.to_string());
        let params = json!({ "conversationId": conversation_id, "messageId": message_id, "role": role, "content": content });
        self.tool_client.call_tool(APPEND_MESSAGE_TOOL, params, meta).await?;
        Ok(())
    }

    /// Summarization, executive-summary and title generation never block
    /// the response: they run fire-and-forget and log rather than
    /// propagate failure.
    fn spawn_background_followups(&self, conversation_id: &str, generation_id: &str) {
        let conversation_id = conversation_id.to_string();
        let generation_id = generation_id.to_string();
        tokio::spawn(async move {
            tracing::debug!(conversation_id, generation_id, "background follow-up tasks would run here");
        });
    }
}

struct RunIds {
    conversation_id: String,
    generation_id: String,
    user_message_id: String,
    assistant_message_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryGraphStore;
    use crate::store::InMemoryUserStore;
    use async_trait::async_trait;
    use graph_checkpoint::InMemoryGenerationStore;
    use graph_core::compiler::UniversalNodeRegistry;
    use graph_core::llm::{ChatModel, ChatRequest, ChatResponse};
    use graph_core::model::{EdgeDecl, GlobalConfig, GraphConfig, NodeConfig, NodeDecl, NodeType, StepType};
    use graph_core::tool::ToolCallResult;
    use std::time::Duration;

    struct EchoTool;

    #[async_trait]
    impl ToolClient for EchoTool {
        async fn call_tool(&self, _name: &str, arguments: Value, _meta: CallMetadata) -> graph_core::Result<ToolCallResult> {
            Ok(ToolCallResult { value: arguments })
        }
    }

    struct NoopRegistry;

    #[async_trait]
    impl LmRegistry for NoopRegistry {
        async fn get_model(&self, _neuron_id: &str, _user_id: &str, _user_tier: u8) -> graph_core::Result<Arc<dyn ChatModel>> {
            Err(graph_core::GraphError::NotFound("no model".into()))
        }
        async fn default_neuron_id(&self, _user_id: &str) -> graph_core::Result<String> {
            Ok("default".into())
        }
    }

    fn single_transform_graph(id: &str, owner: &str) -> GraphConfig {
        GraphConfig {
            graph_id: id.into(),
            owner_id: owner.into(),
            tier: 2,
            is_default: false,
            name: "g".into(),
            description: String::new(),
            nodes: vec![NodeDecl {
                id: "respond".into(),
                node_type: NodeType::Universal,
                config: Some(NodeConfig::Single {
                    step_type: StepType::Transform,
                    config: json!({"operation": "set", "outputField": "response", "value": "hello there"}),
                }),
            }],
            edges: vec![
                EdgeDecl { from: "__start__".into(), to: Some("respond".into()), condition: None, targets: None, fallback: None },
                EdgeDecl { from: "respond".into(), to: Some("__end__".into()), condition: None, targets: None, fallback: None },
            ],
            global_config: GlobalConfig::default(),
        }
    }

    fn make_orchestrator() -> Orchestrator<InMemoryGraphStore> {
        let graph_store = InMemoryGraphStore::new();
        graph_store.register(single_transform_graph(SYSTEM_DEFAULT_GRAPH_ID, "system"));
        let registry = Arc::new(WorkflowRegistry::new(graph_store, UniversalNodeRegistry::new()));
        let user_store: Arc<dyn UserStore> = Arc::new(InMemoryUserStore::new());
        let generation_store: Arc<dyn GenerationStore> = Arc::new(InMemoryGenerationStore::new(Duration::from_secs(60)));
        Orchestrator::new(registry, user_store, generation_store, Arc::new(NoopRegistry), Arc::new(EchoTool), Config::from_env())
    }

    #[tokio::test]
    async fn respond_walks_the_default_graph_and_returns_its_response() {
        let orchestrator = make_orchestrator();
        let request = RespondRequest {
            user_id: "alice".into(),
            query: json!({"message": "hi"}),
            options: json!({}),
            graph_id: None,
            conversation_id: None,
            stream: false,
        };
        let outcome = orchestrator.respond(request).await.unwrap();
        assert_eq!(outcome.content, "hello there");
    }

    #[tokio::test]
    async fn missing_user_id_is_rejected() {
        let orchestrator = make_orchestrator();
        let request = RespondRequest {
            user_id: String::new(),
            query: json!({}),
            options: json!({}),
            graph_id: None,
            conversation_id: None,
            stream: false,
        };
        let err = orchestrator.respond(request).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::MissingField("userId")));
    }

    #[tokio::test]
    async fn malformed_conversation_id_is_rejected() {
        let orchestrator = make_orchestrator();
        let request = RespondRequest {
            user_id: "alice".into(),
            query: json!({"message": "hi"}),
            options: json!({}),
            graph_id: None,
            conversation_id: Some("../../etc/passwd".into()),
            stream: false,
        };
        let err = orchestrator.respond(request).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidIdentifier { field: "conversationId", .. }));
    }

    #[tokio::test]
    async fn unknown_graph_falls_back_to_system_default() {
        let orchestrator = make_orchestrator();
        let request = RespondRequest {
            user_id: "alice".into(),
            query: json!({}),
            options: json!({}),
            graph_id: Some("ghost-graph".into()),
            conversation_id: None,
            stream: false,
        };
        let outcome = orchestrator.respond(request).await.unwrap();
        assert_eq!(outcome.content, "hello there");
    }

    #[tokio::test]
    async fn a_second_request_on_the_same_conversation_is_rejected_while_in_flight() {
        let orchestrator = Arc::new(make_orchestrator());
        let conversation_id = "c1".to_string();

        orchestrator
            .active_by_conversation
            .insert(conversation_id.clone(), "already-running".to_string());

        let request = RespondRequest {
            user_id: "alice".into(),
            query: json!({}),
            options: json!({}),
            graph_id: None,
            conversation_id: Some(conversation_id),
            stream: false,
        };
        let err = orchestrator.respond(request).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::AlreadyInProgress(_)));
    }
}
