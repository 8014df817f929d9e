//! Loop step: repeats a nested step sequence until an exit condition
//! holds or a hard iteration cap is reached, collecting results into an
//! accumulator field.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{GraphError, Result};
use crate::expr::truthy;
use crate::model::Step;
use crate::state::{deep_merge, reduce, RuntimeState, StateDelta};

use super::StepContext;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopStepConfig {
    pub steps: Vec<Step>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default)]
    pub exit_condition: Option<String>,
    #[serde(default)]
    pub accumulator_field: Option<String>,
    #[serde(default)]
    pub on_max_iterations: OnMaxIterations,
}

fn default_max_iterations() -> u32 {
    5
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OnMaxIterations {
    /// Stop silently and keep whatever the accumulator collected so far.
    #[default]
    Continue,
    /// Stop and surface an error.
    Throw,
}

pub async fn execute(config: &Value, ctx: &StepContext<'_>) -> Result<StateDelta> {
    let cfg: LoopStepConfig = serde_json::from_value(config.clone())
        .map_err(|e| GraphError::StepExecution(format!("invalid loop step config: {e}")))?;

    let mut working_state = ctx.state.clone();
    let starting_messages = working_state.messages.len();
    let mut accumulated_data = Value::Null;
    let mut iterations = 0u32;
    let mut exit_condition_met = false;

    loop {
        if iterations >= cfg.max_iterations {
            if cfg.on_max_iterations == OnMaxIterations::Throw {
                return Err(GraphError::StepExecution(format!(
                    "loop step exceeded maxIterations ({})",
                    cfg.max_iterations
                )));
            }
            break;
        }

        let iteration_number = iterations + 1;
        working_state.data = deep_merge(
            &working_state.data,
            &json!({
                "loopIteration": iteration_number,
                "loopAccumulator": accumulated_data,
            }),
        );

        let delta = run_sequence(&cfg.steps, &working_state, ctx).await?;
        reduce(&mut working_state, &delta);

        if let Some(field) = &cfg.accumulator_field {
            if let Some(item) = working_state.get_path(&format!("data.{field}")) {
                accumulated_data = append_item(accumulated_data, item);
            }
        }

        iterations += 1;

        if let Some(exit) = &cfg.exit_condition {
            if truthy(&crate::expr::evaluate(exit, &working_state)) {
                exit_condition_met = true;
                break;
            }
        }
    }

    let mut data_fields = match working_state.data.clone() {
        Value::Object(m) => m,
        _ => serde_json::Map::new(),
    };
    data_fields.remove("loopIteration");
    data_fields.remove("loopAccumulator");
    data_fields.insert("loopIterations".to_string(), json!(iterations));
    data_fields.insert("loopExitConditionMet".to_string(), json!(exit_condition_met));
    if let Some(field) = &cfg.accumulator_field {
        let array = accumulated_data.as_array().cloned().unwrap_or_default();
        data_fields.insert(format!("{field}Array"), json!(array.clone()));
        data_fields.insert(format!("{field}Count"), json!(array.len()));
    }

    let mut delta = StateDelta::data_only(Value::Object(data_fields));
    delta.messages = working_state.messages[starting_messages..].to_vec();
    if working_state.response != ctx.state.response {
        delta.response = working_state.response.clone();
    }
    if working_state.next_route != ctx.state.next_route {
        delta.next_route = working_state.next_route.clone();
    }
    if working_state.final_response != ctx.state.final_response {
        delta.final_response = working_state.final_response.clone();
    }
    Ok(delta)
}

fn append_item(acc: Value, item: Value) -> Value {
    match acc {
        Value::Null => Value::Array(vec![item]),
        Value::Array(mut items) => {
            items.push(item);
            Value::Array(items)
        }
        other => Value::Array(vec![other, item]),
    }
}

async fn run_sequence(
    steps: &[Step],
    state: &RuntimeState,
    ctx: &StepContext<'_>,
) -> Result<StateDelta> {
    let mut working_state = state.clone();
    let mut accumulated = StateDelta::empty();

    for step in steps {
        if let Some(condition) = &step.condition {
            if !truthy(&crate::expr::evaluate(condition, &working_state)) {
                continue;
            }
        }
        let inner_ctx = StepContext {
            state: &working_state,
            sink: ctx.sink,
            stream_visible: ctx.stream_visible,
        };
        let delta = super::execute_step(step, &inner_ctx).await?;
        reduce(&mut working_state, &delta);
        accumulated = merge_deltas(accumulated, delta);
    }

    Ok(accumulated)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::tests::NoopLmRegistry;
    use crate::state::Handles;
    use crate::tool::tests::NoopToolClient;
    use serde_json::json;
    use std::sync::Arc;

    fn state_with_data(data: Value) -> RuntimeState {
        let handles = Handles {
            lm_registry: Arc::new(NoopLmRegistry),
            tool_client: Arc::new(NoopToolClient),
        };
        let mut s = RuntimeState::new(json!({}), json!({}), "u1", 4, handles, "m", "g", "c");
        s.data = data;
        s
    }

    #[tokio::test]
    async fn stops_at_max_iterations_by_default() {
        let state = state_with_data(json!({"count": 0}));
        let sink = crate::steps::NullSink;
        let ctx = StepContext { state: &state, sink: &sink, stream_visible: false };
        let cfg = json!({
            "steps": [
                {"type": "transform", "config": {"operation": "set", "outputField": "count", "value": "{{state.data.loopIteration}}"}}
            ],
            "maxIterations": 3,
            "exitCondition": "false",
            "accumulatorField": "count"
        });
        let delta = execute(&cfg, &ctx).await.unwrap();
        let data = delta.data.unwrap();
        assert_eq!(data["countArray"].as_array().unwrap().len(), 3);
        assert_eq!(data["countCount"], json!(3));
        assert_eq!(data["loopIterations"], json!(3));
        assert_eq!(data["loopExitConditionMet"], json!(false));
    }

    #[tokio::test]
    async fn exposes_loop_accumulator_to_nested_steps() {
        let state = state_with_data(json!({}));
        let sink = crate::steps::NullSink;
        let ctx = StepContext { state: &state, sink: &sink, stream_visible: false };
        let cfg = json!({
            "steps": [
                {"type": "transform", "config": {"operation": "set", "outputField": "seen", "value": "{{state.data.loopAccumulator}}"}}
            ],
            "maxIterations": 2,
            "exitCondition": "state.data.loopIteration >= 2"
        });
        let delta = execute(&cfg, &ctx).await.unwrap();
        let data = delta.data.unwrap();
        assert_eq!(data["loopIterations"], json!(2));
        assert_eq!(data["loopExitConditionMet"], json!(true));
        assert_eq!(data["seen"], Value::Null);
    }

    #[tokio::test]
    async fn throws_when_policy_is_throw() {
        let state = state_with_data(json!({}));
        let sink = crate::steps::NullSink;
        let ctx = StepContext { state: &state, sink: &sink, stream_visible: false };
        let cfg = json!({
            "steps": [],
            "maxIterations": 1,
            "exitCondition": "false",
            "onMaxIterations": "throw"
        });
        assert!(execute(&cfg, &ctx).await.is_err());
    }
}
