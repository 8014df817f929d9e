//! Conditional step: evaluates a condition and writes one of two values
//! into a single output field, based on the result.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

use crate::error::{GraphError, Result};
use crate::expr::{evaluate_with_bindings, truthy};
use crate::render::render;
use crate::state::StateDelta;

use super::StepContext;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalStepConfig {
    pub condition: String,
    pub set_field: String,
    pub true_value: String,
    pub false_value: String,
}

pub async fn execute(config: &Value, ctx: &StepContext<'_>) -> Result<StateDelta> {
    let cfg: ConditionalStepConfig = serde_json::from_value(config.clone())
        .map_err(|e| GraphError::StepExecution(format!("invalid conditional step config: {e}")))?;

    let matched = truthy(&crate::expr::evaluate(&cfg.condition, ctx.state));
    let chosen = if matched { &cfg.true_value } else { &cfg.false_value };
    let value = render_or_eval(chosen, ctx.state)?;

    let mut fields = serde_json::Map::new();
    fields.insert(cfg.set_field, value);
    Ok(StateDelta::data_only(Value::Object(fields)))
}

/// A `{{...}}`-wrapped value is evaluated as an expression; otherwise it's
/// rendered as a template string.
fn render_or_eval(value: &str, state: &crate::state::RuntimeState) -> Result<Value> {
    let trimmed = value.trim();
    if let Some(inner) = trimmed.strip_prefix("{{").and_then(|s| s.strip_suffix("}}")) {
        return Ok(evaluate_with_bindings(inner.trim(), state, &HashMap::new()));
    }
    Ok(Value::String(render(value, state)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::tests::NoopLmRegistry;
    use crate::state::{Handles, RuntimeState};
    use crate::steps::NullSink;
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
    async fn writes_true_value_when_condition_holds() {
        let state = state_with_data(json!({"route": "plan"}));
        let sink = NullSink;
        let ctx = StepContext { state: &state, sink: &sink, stream_visible: false };
        let cfg = json!({
            "condition": "state.data.route === 'plan'",
            "setField": "hit",
            "trueValue": "matched",
            "falseValue": "unmatched"
        });
        let delta = execute(&cfg, &ctx).await.unwrap();
        assert_eq!(delta.data.unwrap()["hit"], json!("matched"));
    }

    #[tokio::test]
    async fn writes_false_value_when_condition_fails() {
        let state = state_with_data(json!({"route": "unknown"}));
        let sink = NullSink;
        let ctx = StepContext { state: &state, sink: &sink, stream_visible: false };
        let cfg = json!({
            "condition": "state.data.route === 'plan'",
            "setField": "hit",
            "trueValue": "matched",
            "falseValue": "unmatched"
        });
        let delta = execute(&cfg, &ctx).await.unwrap();
        assert_eq!(delta.data.unwrap()["hit"], json!("unmatched"));
    }

    #[tokio::test]
    async fn chosen_value_is_evaluated_as_expression_when_brace_wrapped() {
        let state = state_with_data(json!({"route": "plan", "count": 3}));
        let sink = NullSink;
        let ctx = StepContext { state: &state, sink: &sink, stream_visible: false };
        let cfg = json!({
            "condition": "state.data.route === 'plan'",
            "setField": "hit",
            "trueValue": "{{state.data.count}}",
            "falseValue": "0"
        });
        let delta = execute(&cfg, &ctx).await.unwrap();
        assert_eq!(delta.data.unwrap()["hit"], json!(3));
    }
}
