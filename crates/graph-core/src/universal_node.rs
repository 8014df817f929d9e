//! The universal node: every node archetype a graph declares runs through
//! this one executor. It sequences a node's steps, merges their deltas,
//! tracks the node counter, and routes exceptions to an error handler
//! node when one is configured.

use serde_json::Value;

use crate::error::{GraphError, Result};
use crate::expr::truthy;
use crate::model::{NodeConfig, Step};
use crate::state::{deep_merge, reduce, RuntimeState, StateDelta};
use crate::steps::{execute_step, StepContext, StreamSink};

/// Resolved, ready-to-run form of a node's configuration: a flat step
/// list (a `Reference` node config is resolved to this before the node
/// runs, by the compiler's node registry lookup).
#[derive(Debug, Clone)]
pub struct ResolvedNode {
    pub id: String,
    pub steps: Vec<Step>,
}

pub fn resolve_steps(config: &NodeConfig) -> Vec<Step> {
    match config {
        NodeConfig::Single { step_type, config } => vec![Step {
            step_type: *step_type,
            config: config.clone(),
            condition: None,
        }],
        NodeConfig::Multi { steps } => steps.clone(),
        NodeConfig::Reference { .. } => {
            // Resolved earlier by the compiler against the universal-node
            // registry; a bare reference reaching here has nothing to run.
            Vec::new()
        }
    }
}

/// Execute every step of `node` in order against `state`, accumulating
/// deltas into a working copy of state so later steps see earlier
/// steps' output, then increment the node counter.
///
/// Never propagates a step's error: on exception the remaining steps are
/// skipped and the returned delta carries `data.error` plus
/// `nextRoute: "error_handler"` instead, so the caller's own edge
/// resolution (not this function) decides where execution goes next.
pub async fn execute_node(
    node: &ResolvedNode,
    state: &RuntimeState,
    sink: &dyn StreamSink,
) -> Result<StateDelta> {
    let mut working_state = state.clone();
    working_state.node_counter += 1;
    let mut accumulated = StateDelta::empty();

    for (index, step) in node.steps.iter().enumerate() {
        working_state.current_step_index = index as u64;

        if let Some(condition) = &step.condition {
            if !truthy(&crate::expr::evaluate(condition, &working_state)) {
                continue;
            }
        }

        let ctx = StepContext {
            state: &working_state,
            sink,
            stream_visible: working_state.step_stream_visible,
        };

        let result = execute_step(step, &ctx).await;
        match result {
            Ok(delta) => {
                reduce(&mut working_state, &delta);
                accumulated = merge_deltas(accumulated, delta);
            }
            Err(err) => {
                tracing::warn!(node_id = %node.id, step = index, error = %err, "node step failed, routing to error handler");
                let mut error_delta = error_payload(&err);
                error_delta.next_route = Some("error_handler".to_string());
                accumulated = merge_deltas(accumulated, error_delta);
                return Ok(accumulated);
            }
        }
    }

    let mut node_counter_delta = serde_json::Map::new();
    node_counter_delta.insert("nodeCounter".to_string(), Value::from(working_state.node_counter));
    accumulated = merge_deltas(
        accumulated,
        StateDelta::data_only(Value::Object(node_counter_delta)),
    );

    Ok(accumulated)
}

fn error_payload(err: &GraphError) -> StateDelta {
    let mut fields = serde_json::Map::new();
    fields.insert("error".to_string(), Value::String(err.to_string()));
    StateDelta::data_only(Value::Object(fields))
}

fn merge_deltas(base: StateDelta, next: StateDelta) -> StateDelta {
    let data = match (base.data, next.data) {
        (Some(a), Some(b)) => Some(deep_merge(&a, &b)),
        (Some(a), None) => Some(a),
        (None, b) => b,
    };
    let mut messages = base.messages;
    messages.extend(next.messages);
    StateDelta {
        data,
        messages,
        response: next.response.or(base.response),
        next_route: next.next_route.or(base.next_route),
        final_response: next.final_response.or(base.final_response),
    }
}
