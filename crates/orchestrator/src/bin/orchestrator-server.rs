//! Orchestrator server binary: wires the in-memory reference stores, the
//! provider and tool-pool seams, and the front door behind an HTTP API.
//!
//! Grounded on `orchestrator/src/bin/orchestrator-server.rs`'s shape
//! (tracing init, config load, router, graceful shutdown), trimmed down
//! to this system's flat env-var config and in-process stores — there is
//! no database or LDAP layer here to stand up first.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::{Path, State};
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::Stream;
use graph_core::compiler::UniversalNodeRegistry;
use graph_core::model::{EdgeDecl, GlobalConfig, GraphConfig, NeuronConfig, NeuronRole, NodeConfig, NodeDecl, NodeType, ProviderKind, StepType};
use graph_checkpoint::{GenerationEvent, GenerationStore, InMemoryGenerationStore};
use llm::neuron_store::InMemoryNeuronStore;
use llm::registry::ProviderRegistry;
use orchestrator::front_door::{Orchestrator, RespondOutcome, RespondRequest};
use orchestrator::store::{InMemoryGraphStore, InMemoryUserStore};
use orchestrator::{Config, SYSTEM_DEFAULT_GRAPH_ID, SYSTEM_SIMPLE_GRAPH_ID};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tool_pool::{ServerSpec, ToolPool, ToolPoolConfig};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

const DEFAULT_PORT: u16 = 8080;

type App = Orchestrator<InMemoryGraphStore>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let config = Config::from_env();

    let graph_store = InMemoryGraphStore::new();
    graph_store.register(system_default_graph());
    graph_store.register(system_simple_graph());
    for graph in load_yaml_graphs_from_env() {
        graph_store.register(graph);
    }
    let registry = Arc::new(orchestrator::WorkflowRegistry::new(graph_store, UniversalNodeRegistry::new()));

    let user_store: Arc<dyn orchestrator::UserStore> = Arc::new(InMemoryUserStore::new());

    let generation_store_impl = Arc::new(InMemoryGenerationStore::new(config.generation_ttl));
    tokio::spawn(graph_checkpoint::run_ttl_sweeper(generation_store_impl.clone(), Duration::from_secs(60)));
    let generation_store: Arc<dyn GenerationStore> = generation_store_impl;

    let lm_registry: Arc<dyn graph_core::llm::LmRegistry> = Arc::new(seeded_provider_registry(&config));

    let tool_pool = Arc::new(ToolPool::new(ToolPoolConfig::new(tool_servers_from_env())));
    tool_pool.start().await;

    let orchestrator = Arc::new(Orchestrator::new(
        registry,
        user_store,
        generation_store,
        lm_registry,
        tool_pool,
        config,
    ));

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/respond", post(respond))
        .route("/v1/respond/stream", post(respond_stream))
        .route("/v1/generations/:generation_id/abort", post(abort))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(orchestrator);

    let port = std::env::var("PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(DEFAULT_PORT);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "starting orchestrator server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server exited with an error")?;

    tracing::info!("orchestrator server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install CTRL-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received CTRL-C, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}

#[derive(Debug, Deserialize)]
struct RespondBody {
    #[serde(rename = "userId")]
    user_id: String,
    query: Value,
    #[serde(default)]
    options: Value,
    #[serde(default, rename = "graphId")]
    graph_id: Option<String>,
    #[serde(default, rename = "conversationId")]
    conversation_id: Option<String>,
}

impl RespondBody {
    fn into_request(self, stream: bool) -> RespondRequest {
        RespondRequest {
            user_id: self.user_id,
            query: self.query,
            options: self.options,
            graph_id: self.graph_id,
            conversation_id: self.conversation_id,
            stream,
        }
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn respond(State(app): State<Arc<App>>, Json(body): Json<RespondBody>) -> axum::response::Response {
    match app.respond(body.into_request(false)).await {
        Ok(outcome) => Json(outcome_json(&outcome)).into_response(),
        Err(err) => error_response(err),
    }
}

fn outcome_json(outcome: &RespondOutcome) -> Value {
    json!({
        "conversationId": outcome.conversation_id,
        "generationId": outcome.generation_id,
        "userMessageId": outcome.user_message_id,
        "assistantMessageId": outcome.assistant_message_id,
        "content": outcome.content,
        "toolHistory": outcome.tool_history.len(),
    })
}

fn error_response(err: orchestrator::OrchestratorError) -> axum::response::Response {
    use axum::http::StatusCode;
    use orchestrator::OrchestratorError as E;
    let status = match &err {
        E::NotFound(_) => StatusCode::NOT_FOUND,
        E::AccessDenied(_) => StatusCode::FORBIDDEN,
        E::MissingField(_) | E::Validation { .. } => StatusCode::BAD_REQUEST,
        E::AlreadyInProgress(_) => StatusCode::CONFLICT,
        E::StreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

/// Kicks the generation off in the background and streams its published
/// events back as they're published, reconnect-safe since the caller can
/// re-subscribe to the same `generationId` through the replay backlog.
async fn respond_stream(
    State(app): State<Arc<App>>,
    Json(body): Json<RespondBody>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let (generation_id_tx, generation_id_rx) = tokio::sync::oneshot::channel();
    let app_for_task = app.clone();
    let request = body.into_request(true);
    tokio::spawn(async move {
        match app_for_task.respond(request).await {
            Ok(outcome) => {
                let _ = generation_id_tx.send(Ok(outcome.generation_id));
            }
            Err(err) => {
                let _ = generation_id_tx.send(Err(err.to_string()));
            }
        }
    });

    let stream = async_stream::stream! {
        let generation_id = match generation_id_rx.await {
            Ok(Ok(id)) => id,
            Ok(Err(message)) => {
                yield Ok(Event::default().event("error").data(message));
                return;
            }
            Err(_) => {
                yield Ok(Event::default().event("error").data("generation task dropped before starting"));
                return;
            }
        };

        // The generation may complete before we subscribe; `subscribe`
        // still returns the full backlog in that case.
        let mut subscription = match app.generation_store().subscribe(&generation_id).await {
            Ok(sub) => sub,
            Err(err) => {
                yield Ok(Event::default().event("error").data(err.to_string()));
                return;
            }
        };

        for event in subscription.backlog {
            yield Ok(sse_event(&event));
            if matches!(event, GenerationEvent::Done { .. } | GenerationEvent::Error { .. }) {
                return;
            }
        }

        // `BroadcastStream` turns the receiver into a `Stream`, surfacing a
        // lagged-subscriber gap as an `Err` we log and skip past rather
        // than treat as a terminal failure.
        let mut live = BroadcastStream::new(subscription.live);
        while let Some(next) = live.next().await {
            let event = match next {
                Ok(event) => event,
                Err(err) => {
                    tracing::warn!(error = %err, "generation subscriber lagged, some events were dropped");
                    continue;
                }
            };
            let terminal = matches!(event, GenerationEvent::Done { .. } | GenerationEvent::Error { .. });
            yield Ok(sse_event(&event));
            if terminal {
                break;
            }
        }
    };

    Sse::new(stream)
}

fn sse_event(event: &GenerationEvent) -> Event {
    let (kind, data) = match event {
        GenerationEvent::ContentChunk { text } => ("content", json!({ "text": text })),
        GenerationEvent::ThinkingChunk { text } => ("thinking", json!({ "text": text })),
        GenerationEvent::Status { action, description } => ("status", json!({ "action": action, "description": description })),
        GenerationEvent::ToolEvent { tool_id, phase, payload } => ("tool", json!({ "toolId": tool_id, "phase": phase, "payload": payload })),
        GenerationEvent::Done { final_response } => ("done", final_response.clone()),
        GenerationEvent::Error { message } => ("error", json!({ "message": message })),
    };
    Event::default().event(kind).data(data.to_string())
}

async fn abort(State(app): State<Arc<App>>, Path(generation_id): Path<String>) -> Json<Value> {
    let aborted = app.abort_stream(&generation_id);
    Json(json!({ "aborted": aborted }))
}

/// Neurons named by `CHAT_LM_URL`/`WORKER_LM_URL` are registered as
/// system-owned defaults so a deployment with those two env vars set
/// needs no separate neuron-provisioning step.
fn seeded_provider_registry(config: &Config) -> ProviderRegistry<InMemoryNeuronStore> {
    let store = InMemoryNeuronStore::new();
    if let Some(url) = &config.chat_lm_url {
        store.register(NeuronConfig {
            neuron_id: "system-chat".into(),
            owner_id: "system".into(),
            tier: 0,
            name: "system chat model".into(),
            role: NeuronRole::Chat,
            provider: ProviderKind::OpenaiCompatible,
            endpoint: url.clone(),
            model: std::env::var("CHAT_LM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into()),
            api_key: config.provider_api_keys.get("chat").cloned(),
            api_key_encrypted: false,
            temperature: None,
            max_output_tokens: None,
            top_p: None,
        });
        store.set_default("system", "system-chat");
    }
    if let Some(url) = &config.worker_lm_url {
        store.register(NeuronConfig {
            neuron_id: "system-worker".into(),
            owner_id: "system".into(),
            tier: 0,
            name: "system worker model".into(),
            role: NeuronRole::Worker,
            provider: ProviderKind::OpenaiCompatible,
            endpoint: url.clone(),
            model: std::env::var("WORKER_LM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into()),
            api_key: config.provider_api_keys.get("worker").cloned(),
            api_key_encrypted: false,
            temperature: None,
            max_output_tokens: None,
            top_p: None,
        });
    }
    ProviderRegistry::new(store)
}

/// Tool servers are declared as `TOOL_SERVERS`, a JSON array of
/// `{"name", "command", "args"}` objects, matching the
/// `PROVIDER_API_KEY_<NAME>`-style "configure via env, no code change"
/// convention the rest of this binary's config follows.
fn tool_servers_from_env() -> Vec<ServerSpec> {
    #[derive(Deserialize)]
    struct RawSpec {
        name: String,
        command: String,
        #[serde(default)]
        args: Vec<String>,
    }

    let Some(raw) = std::env::var("TOOL_SERVERS").ok() else {
        return Vec::new();
    };

    match serde_json::from_str::<Vec<RawSpec>>(&raw) {
        Ok(specs) => specs
            .into_iter()
            .map(|s| ServerSpec {
                name: s.name,
                command: s.command,
                args: s.args,
                env: std::collections::HashMap::new(),
            })
            .collect(),
        Err(err) => {
            tracing::warn!(error = %err, "TOOL_SERVERS is not valid JSON, starting with no tool servers");
            Vec::new()
        }
    }
}

/// Loads operator-authored graphs from `GRAPH_DEFS_DIR`, a directory of
/// `*.yaml`/`*.yml` files each holding one graph definition. A file that
/// fails to parse is logged and skipped rather than aborting startup.
fn load_yaml_graphs_from_env() -> Vec<GraphConfig> {
    let Some(dir) = std::env::var("GRAPH_DEFS_DIR").ok() else {
        return Vec::new();
    };

    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!(dir = %dir, error = %err, "GRAPH_DEFS_DIR could not be read, skipping");
            return Vec::new();
        }
    };

    let mut graphs = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let is_yaml = matches!(path.extension().and_then(|e| e.to_str()), Some("yaml") | Some("yml"));
        if !is_yaml {
            continue;
        }
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "failed to read graph definition, skipping");
                continue;
            }
        };
        match GraphConfig::from_yaml(&contents) {
            Ok(graph) => {
                tracing::info!(path = %path.display(), graph_id = %graph.graph_id, "loaded graph definition");
                graphs.push(graph);
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "failed to parse graph definition, skipping");
            }
        }
    }
    graphs
}

fn system_default_graph() -> GraphConfig {
    GraphConfig {
        graph_id: SYSTEM_DEFAULT_GRAPH_ID.into(),
        owner_id: "system".into(),
        tier: 0,
        is_default: true,
        name: "default assistant".into(),
        description: "single-neuron chat graph used when a caller has no graph of their own".into(),
        nodes: vec![NodeDecl {
            id: "chat".into(),
            node_type: NodeType::Universal,
            config: Some(NodeConfig::Single {
                step_type: StepType::Neuron,
                config: json!({
                    "neuronId": "system-chat",
                    "systemPrompt": "{{state.data.systemPrompt}}",
                    "userPrompt": "{{state.query.message}}",
                    "outputField": "response",
                    "stream": true,
                }),
            }),
        }],
        edges: vec![
            EdgeDecl { from: "__start__".into(), to: Some("chat".into()), condition: None, targets: None, fallback: None },
            EdgeDecl { from: "chat".into(), to: Some("__end__".into()), condition: None, targets: None, fallback: None },
        ],
        global_config: GlobalConfig::default(),
    }
}

/// Last-resort fallback when even the default graph can't be compiled
/// (for example, no `system-chat` neuron has been configured): echoes
/// the caller's message back rather than failing the turn outright.
fn system_simple_graph() -> GraphConfig {
    GraphConfig {
        graph_id: SYSTEM_SIMPLE_GRAPH_ID.into(),
        owner_id: "system".into(),
        tier: 0,
        is_default: false,
        name: "minimal echo".into(),
        description: "last-resort fallback graph with no LM or tool dependency".into(),
        nodes: vec![NodeDecl {
            id: "echo".into(),
            node_type: NodeType::Universal,
            config: Some(NodeConfig::Single {
                step_type: StepType::Transform,
                config: json!({
                    "operation": "set",
                    "outputField": "response",
                    "value": "{{state.query.message}}",
                }),
            }),
        }],
        edges: vec![
            EdgeDecl { from: "__start__".into(), to: Some("echo".into()), condition: None, targets: None, fallback: None },
            EdgeDecl { from: "echo".into(), to: Some("__end__".into()), condition: None, targets: None, fallback: None },
        ],
        global_config: GlobalConfig::default(),
    }
}
