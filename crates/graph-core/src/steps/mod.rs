//! Step executors: the five primitives a universal node's micro-pipeline
//! can run. Each kind lives in its own module; all share the
//! `(config, state) -> delta` contract and the error-handling policy in
//! [`ErrorPolicy`].

pub mod conditional;
pub mod loop_step;
pub mod neuron;
pub mod tool;
pub mod transform;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::model::Step;
use crate::state::{RuntimeState, StateDelta};

/// Sink for transport-visible events produced while executing a step. The
/// neuron step forwards chunks here only when the owning step's `stream`
/// flag is set; the tool step always reports `tool_event` regardless of
/// visibility, since those are routed to the shared event log rather than
/// raw token output.
#[async_trait]
pub trait StreamSink: Send + Sync {
    async fn content_chunk(&self, text: &str);
    async fn thinking_chunk(&self, text: &str);
    async fn status(&self, action: &str, description: Option<&str>);
    async fn tool_event(&self, tool_id: &str, phase: ToolEventPhase, payload: Value);

    /// Called once after the owning node-walk finishes, streamed or not,
    /// so a batching sink can flush whatever it's still holding. A no-op
    /// for sinks with nothing to flush.
    async fn finish(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolEventPhase {
    Start,
    Progress,
    Complete,
    Error,
}

/// A sink that discards everything; used for internal (non-streamed) calls
/// and in tests.
pub struct NullSink;

#[async_trait]
impl StreamSink for NullSink {
    async fn content_chunk(&self, _text: &str) {}
    async fn thinking_chunk(&self, _text: &str) {}
    async fn status(&self, _action: &str, _description: Option<&str>) {}
    async fn tool_event(&self, _tool_id: &str, _phase: ToolEventPhase, _payload: Value) {}
}

/// Error-handling policy shared by every step kind.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPolicy {
    #[serde(default)]
    pub retry: u32,
    #[serde(default)]
    pub retry_delay: u64,
    #[serde(default)]
    pub fallback_value: Option<Value>,
    #[serde(default)]
    pub on_error: OnError,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    #[default]
    Throw,
    Fallback,
    Skip,
}

/// Execution context passed to every step: the accumulated working state
/// (original state deep-merged with prior steps' deltas) plus the stream
/// sink and visibility flag for this step.
pub struct StepContext<'a> {
    pub state: &'a RuntimeState,
    pub sink: &'a dyn StreamSink,
    pub stream_visible: bool,
}

/// Run `step.config` against `retry`/`retry_delay`/`on_error`, delegating
/// the actual unit of work to `body`. This is the one place the retry
/// loop lives; each step module calls it instead of re-implementing
/// backoff.
pub async fn with_error_policy<F, Fut>(
    policy: &ErrorPolicy,
    output_field: &str,
    mut body: F,
) -> Result<StateDelta>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<StateDelta>>,
{
    let mut attempt = 0u32;
    loop {
        match body().await {
            Ok(delta) => return Ok(delta),
            Err(err) => {
                if attempt < policy.retry {
                    let delay_ms = (attempt as u64 + 1) * policy.retry_delay;
                    tracing::warn!(attempt, %err, "step failed, retrying");
                    if delay_ms > 0 {
                        tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                    }
                    attempt += 1;
                    continue;
                }
                return match policy.on_error {
                    OnError::Throw => Err(err),
                    OnError::Fallback => {
                        let mut fields = serde_json::Map::new();
                        fields.insert(
                            output_field.to_string(),
                            policy.fallback_value.clone().unwrap_or(Value::Null),
                        );
                        Ok(StateDelta::data_only(Value::Object(fields)))
                    }
                    OnError::Skip => Ok(StateDelta::empty()),
                };
            }
        }
    }
}

/// Dispatch a single [`Step`] to its kind-specific executor.
pub async fn execute_step(step: &Step, ctx: &StepContext<'_>) -> Result<StateDelta> {
    use crate::model::StepType;
    match step.step_type {
        StepType::Neuron => neuron::execute(&step.config, ctx).await,
        StepType::Tool => tool::execute(&step.config, ctx).await,
        StepType::Transform => transform::execute(&step.config, ctx).await,
        StepType::Conditional => conditional::execute(&step.config, ctx).await,
        StepType::Loop => Box::pin(loop_step::execute(&step.config, ctx)).await,
    }
}
