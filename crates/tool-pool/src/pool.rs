//! [`graph_core::tool::ToolClient`] implementation: a fixed set of named
//! tool servers, routed by tool name, with capped automatic restart on
//! child exit.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use graph_core::error::Result as GraphResult;
use graph_core::llm::CallMetadata;
use graph_core::tool::{ToolCallResult, ToolClient};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::child::{ServerSpec, ToolChild};
use crate::error::{Result, ToolPoolError};

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_RESTARTS: u32 = 3;
const RESTART_INITIAL_BACKOFF_MS: u64 = 200;
const RESTART_MAX_BACKOFF_MS: u64 = 5_000;
const RESTART_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Exponential backoff with up to 25% jitter before a crash-restart, so a
/// tool server stuck in a crash loop doesn't hammer the OS with spawns.
fn restart_backoff(attempt: u32) -> Duration {
    let base = (RESTART_INITIAL_BACKOFF_MS as f64 * RESTART_BACKOFF_MULTIPLIER.powi(attempt as i32)) as u64;
    let base = base.min(RESTART_MAX_BACKOFF_MS);
    let jitter = (base as f64 * 0.25 * rand::random::<f64>()) as u64;
    Duration::from_millis(base + jitter)
}

#[derive(Debug, Clone)]
pub struct ToolPoolConfig {
    pub servers: Vec<ServerSpec>,
    pub handshake_timeout: Duration,
    pub call_timeout: Duration,
    pub max_restart_attempts: u32,
}

impl ToolPoolConfig {
    pub fn new(servers: Vec<ServerSpec>) -> Self {
        Self {
            servers,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            max_restart_attempts: DEFAULT_MAX_RESTARTS,
        }
    }
}

struct Slot {
    spec: ServerSpec,
    child: RwLock<Option<Arc<ToolChild>>>,
    restart_attempts: std::sync::atomic::AtomicU32,
}

/// Supervises the configured tool servers and routes `callTool` by name.
/// A server that fails to initialize is logged and left unavailable; the
/// pool as a whole stays usable.
pub struct ToolPool {
    config: ToolPoolConfig,
    slots: Vec<Arc<Slot>>,
}

impl ToolPool {
    pub fn new(config: ToolPoolConfig) -> Self {
        let slots = config
            .servers
            .iter()
            .map(|spec| {
                Arc::new(Slot {
                    spec: spec.clone(),
                    child: RwLock::new(None),
                    restart_attempts: std::sync::atomic::AtomicU32::new(0),
                })
            })
            .collect();
        Self { config, slots }
    }

    /// Spawns every configured server concurrently. Failures are logged;
    /// the pool remains usable with whichever servers did start.
    pub async fn start(&self) {
        let handshake_timeout = self.config.handshake_timeout;
        let starts = self.slots.iter().map(|slot| {
            let slot = slot.clone();
            async move {
                match ToolChild::spawn(&slot.spec, handshake_timeout).await {
                    Ok(child) => {
                        *slot.child.write().await = Some(Arc::new(child));
                    }
                    Err(e) => {
                        tracing::warn!(server = %slot.spec.name, error = %e, "tool server failed to start");
                    }
                }
            }
        });
        futures_join_all(starts).await;
    }

    /// Terminates every running child. Idempotent.
    pub async fn stop(&self) {
        for slot in &self.slots {
            if let Some(child) = slot.child.write().await.take() {
                child.shutdown().await;
            }
        }
    }

    async fn find_owner(&self, name: &str) -> Result<Arc<ToolChild>> {
        for slot in &self.slots {
            let child = slot.child.read().await.clone();
            let Some(child) = child else { continue };
            if let Ok(tools) = child.tools(self.config.call_timeout).await {
                if tools.iter().any(|t| t.name == name) {
                    return Ok(child);
                }
            }
        }
        Err(ToolPoolError::ToolRouting(name.to_string()))
    }

    async fn restart(&self, slot: &Arc<Slot>) -> Result<Arc<ToolChild>> {
        let attempts = slot.restart_attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if attempts >= self.config.max_restart_attempts {
            return Err(ToolPoolError::SpawnFailed {
                server: slot.spec.name.clone(),
                message: "exceeded maximum restart attempts".into(),
            });
        }
        tokio::time::sleep(restart_backoff(attempts)).await;
        let child = ToolChild::spawn(&slot.spec, self.config.handshake_timeout).await?;
        let child = Arc::new(child);
        *slot.child.write().await = Some(child.clone());
        Ok(child)
    }

    fn slot_for(&self, child_name: &str) -> Option<&Arc<Slot>> {
        self.slots.iter().find(|s| s.spec.name == child_name)
    }
}

#[async_trait]
impl ToolClient for ToolPool {
    async fn call_tool(&self, name: &str, arguments: Value, meta: CallMetadata) -> GraphResult<ToolCallResult> {
        let meta_value = serde_json::to_value(&meta).unwrap_or(Value::Object(Default::default()));

        let child = self.find_owner(name).await.map_err(graph_core::GraphError::from)?;
        match child.call_tool(name, arguments.clone(), meta_value.clone(), self.config.call_timeout).await {
            Ok(value) => Ok(ToolCallResult { value }),
            Err(ToolPoolError::ToolChildExit { .. }) => {
                let Some(slot) = self.slot_for(&child.name) else {
                    return Err(ToolPoolError::ToolChildExit { server: child.name.clone() }.into());
                };
                let restarted = self.restart(slot).await.map_err(graph_core::GraphError::from)?;
                restarted
                    .call_tool(name, arguments, meta_value, self.config.call_timeout)
                    .await
                    .map(|value| ToolCallResult { value })
                    .map_err(graph_core::GraphError::from)
            }
            Err(other) => Err(other.into()),
        }
    }
}

async fn futures_join_all<I>(iter: I)
where
    I: IntoIterator,
    I::Item: std::future::Future<Output = ()> + Send + 'static,
{
    let mut handles = Vec::new();
    for fut in iter {
        handles.push(tokio::spawn(fut));
    }
    for handle in handles {
        let _ = handle.await;
    }
}
