//! Transform step: the eight data-shaping operations available to a
//! pipeline without calling out to an LM or a tool process.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

use crate::error::{GraphError, Result};
use crate::expr::{evaluate_with_bindings, truthy};
use crate::render::render;
use crate::state::StateDelta;

use super::StepContext;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "operation", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum TransformConfig {
    Map {
        input_field: String,
        output_field: String,
        transform: String,
    },
    Filter {
        input_field: String,
        output_field: String,
        filter_condition: String,
    },
    Select {
        input_field: String,
        output_field: String,
        path: String,
    },
    Set {
        output_field: String,
        value: String,
    },
    ParseJson {
        input_field: String,
        output_field: String,
    },
    Append {
        output_field: String,
        value: Value,
        #[serde(default)]
        condition: Option<String>,
    },
    Concat {
        output_field: String,
        left_field: String,
        right_field: String,
        #[serde(default)]
        left_fallback: Option<Value>,
        #[serde(default)]
        right_fallback: Option<Value>,
    },
    BuildMessages {
        output_field: String,
        #[serde(default)]
        use_existing_field: Option<String>,
        #[serde(default)]
        messages: Vec<MessageTemplate>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageTemplate {
    pub role: String,
    pub content: String,
}

pub async fn execute(config: &Value, ctx: &StepContext<'_>) -> Result<StateDelta> {
    let cfg: TransformConfig = serde_json::from_value(config.clone())
        .map_err(|e| GraphError::StepExecution(format!("invalid transform step config: {e}")))?;
    let state = ctx.state;

    let (output_field, value) = match &cfg {
        TransformConfig::Map { input_field, output_field, transform } => {
            let input = state.get_path(input_field).unwrap_or(Value::Null);
            let items = input.as_array().cloned().unwrap_or_default();
            let mut out = Vec::with_capacity(items.len());
            for (index, item) in items.iter().enumerate() {
                let mut bindings = HashMap::new();
                bindings.insert("item".to_string(), item.clone());
                bindings.insert("index".to_string(), Value::from(index));
                out.push(render_or_eval(transform, state, &bindings)?);
            }
            (output_field.clone(), Value::Array(out))
        }
        TransformConfig::Filter { input_field, output_field, filter_condition } => {
            let input = state.get_path(input_field).unwrap_or(Value::Null);
            let items = input.as_array().cloned().unwrap_or_default();
            let mut out = Vec::new();
            for (index, item) in items.into_iter().enumerate() {
                let mut bindings = HashMap::new();
                bindings.insert("item".to_string(), item.clone());
                bindings.insert("index".to_string(), Value::from(index));
                if truthy(&evaluate_with_bindings(filter_condition, state, &bindings)) {
                    out.push(item);
                }
            }
            (output_field.clone(), Value::Array(out))
        }
        TransformConfig::Select { input_field, output_field, path } => {
            let input = state.get_path(input_field).unwrap_or(Value::Null);
            let selected = if let Value::Array(items) = &input {
                Value::Array(items.iter().map(|i| select_path(i, path)).collect())
            } else {
                select_path(&input, path)
            };
            (output_field.clone(), selected)
        }
        TransformConfig::Set { output_field, value } => {
            let result = render_or_eval(value, state, &HashMap::new())?;
            (output_field.clone(), result)
        }
        TransformConfig::ParseJson { input_field, output_field } => {
            let input = state.get_path(input_field).unwrap_or(Value::Null);
            let text = input.as_str().ok_or_else(|| {
                GraphError::StepExecution(format!("parse-json: '{input_field}' is not a string"))
            })?;
            let parsed = serde_json::from_str::<Value>(text)
                .or_else(|_| extract_json(text))
                .map_err(|e| GraphError::StepExecution(format!("parse-json failed: {e}")))?;
            (output_field.clone(), parsed)
        }
        TransformConfig::Append { output_field, value, condition } => {
            if let Some(cond) = condition {
                if !truthy(&evaluate_with_bindings(cond, state, &HashMap::new())) {
                    return Ok(StateDelta::empty());
                }
            }
            let current = state.get_path(&format!("data.{output_field}")).unwrap_or(Value::Null);
            let mut arr = current.as_array().cloned().unwrap_or_default();
            arr.push(value.clone());
            (output_field.clone(), Value::Array(arr))
        }
        TransformConfig::Concat { output_field, left_field, right_field, left_fallback, right_fallback } => {
            let left = state
                .get_path(left_field)
                .and_then(|v| v.as_array().cloned())
                .or_else(|| left_fallback.clone().and_then(|v| v.as_array().cloned()))
                .unwrap_or_default();
            let right = state
                .get_path(right_field)
                .and_then(|v| v.as_array().cloned())
                .or_else(|| right_fallback.clone().and_then(|v| v.as_array().cloned()))
                .unwrap_or_default();
            let mut out = left;
            out.extend(right);
            (output_field.clone(), Value::Array(out))
        }
        TransformConfig::BuildMessages { output_field, use_existing_field, messages } => {
            let built = if let Some(existing) = use_existing_field {
                state.get_path(existing).unwrap_or(Value::Array(vec![]))
            } else {
                let mut out = Vec::with_capacity(messages.len());
                for m in messages {
                    out.push(serde_json::json!({
                        "role": m.role,
                        "content": render(&m.content, state)?,
                    }));
                }
                Value::Array(out)
            };
            (output_field.clone(), built)
        }
    };

    let mut fields = serde_json::Map::new();
    fields.insert(output_field, value);
    Ok(StateDelta::data_only(Value::Object(fields)))
}

fn select_path(value: &Value, path: &str) -> Value {
    let mut current = value;
    for segment in path.split('.') {
        match current.get(segment) {
            Some(v) => current = v,
            None => return Value::Null,
        }
    }
    current.clone()
}

/// `set`/`map` values may be either a `{{...}}` expression or a plain
/// template string: if wrapped in double braces, evaluate as an
/// expression; otherwise render as a template.
fn render_or_eval(
    value: &str,
    state: &crate::state::RuntimeState,
    bindings: &HashMap<String, Value>,
) -> Result<Value> {
    let trimmed = value.trim();
    if let Some(inner) = trimmed.strip_prefix("{{").and_then(|s| s.strip_suffix("}}")) {
        return Ok(evaluate_with_bindings(inner.trim(), state, bindings));
    }
    Ok(Value::String(render(value, state)?))
}

/// Robust JSON extractor for `parse-json`: locate a JSON object or array
/// by bracket scanning when the full string does not parse on its own.
fn extract_json(text: &str) -> std::result::Result<Value, serde_json::Error> {
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let Some(start) = text.find(open) {
            let mut depth = 0i32;
            for (i, c) in text[start..].char_indices() {
                if c == open {
                    depth += 1;
                } else if c == close {
                    depth -= 1;
                    if depth == 0 {
                        let candidate = &text[start..start + i + c.len_utf8()];
                        if let Ok(v) = serde_json::from_str::<Value>(candidate) {
                            return Ok(v);
                        }
                    }
                }
            }
        }
    }
    serde_json::from_str("not json")
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
    async fn map_applies_expression_per_item() {
        let state = state_with_data(json!({"nums": [1, 2, 3]}));
        let sink = NullSink;
        let ctx = StepContext { state: &state, sink: &sink, stream_visible: false };
        let cfg = json!({
            "operation": "map",
            "inputField": "data.nums",
            "outputField": "doubled",
            "transform": "{{item}}"
        });
        let delta = execute(&cfg, &ctx).await.unwrap();
        assert_eq!(delta.data.unwrap()["doubled"], json!([1, 2, 3]));
    }

    #[tokio::test]
    async fn filter_keeps_truthy_items() {
        let state = state_with_data(json!({"items": [{"ok": true}, {"ok": false}]}));
        let sink = NullSink;
        let ctx = StepContext { state: &state, sink: &sink, stream_visible: false };
        let cfg = json!({
            "operation": "filter",
            "inputField": "data.items",
            "outputField": "kept",
            "filterCondition": "item.ok === true"
        });
        let delta = execute(&cfg, &ctx).await.unwrap();
        assert_eq!(delta.data.unwrap()["kept"], json!([{"ok": true}]));
    }

    #[tokio::test]
    async fn parse_json_extracts_embedded_object() {
        let state = state_with_data(json!({"raw": "noise {\"a\":1} trailing"}));
        let sink = NullSink;
        let ctx = StepContext { state: &state, sink: &sink, stream_visible: false };
        let cfg = json!({"operation": "parse-json", "inputField": "data.raw", "outputField": "parsed"});
        let delta = execute(&cfg, &ctx).await.unwrap();
        assert_eq!(delta.data.unwrap()["parsed"], json!({"a": 1}));
    }

    #[tokio::test]
    async fn append_creates_array_if_absent() {
        let state = state_with_data(json!({}));
        let sink = NullSink;
        let ctx = StepContext { state: &state, sink: &sink, stream_visible: false };
        let cfg = json!({"operation": "append", "outputField": "log", "value": "started"});
        let delta = execute(&cfg, &ctx).await.unwrap();
        assert_eq!(delta.data.unwrap()["log"], json!(["started"]));
    }

    #[tokio::test]
    async fn concat_joins_two_arrays() {
        let state = state_with_data(json!({"a": [1, 2], "b": [3]}));
        let sink = NullSink;
        let ctx = StepContext { state: &state, sink: &sink, stream_visible: false };
        let cfg = json!({
            "operation": "concat",
            "outputField": "both",
            "leftField": "data.a",
            "rightField": "data.b"
        });
        let delta = execute(&cfg, &ctx).await.unwrap();
        assert_eq!(delta.data.unwrap()["both"], json!([1, 2, 3]));
    }
}
