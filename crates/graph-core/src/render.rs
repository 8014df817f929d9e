//! Template renderer.
//!
//! Substitutes `{{state.path}}` placeholders against a [`RuntimeState`].
//! Never fails on an unresolved path — it falls back from the literal path
//! to `data.<path>`, and finally leaves the placeholder text untouched
//! while logging a warning. It fails only on malformed placeholder syntax
//! (an unterminated `{{`).

use serde_json::Value;

use crate::error::{GraphError, Result};
use crate::state::RuntimeState;

/// Render every `{{state.<path>}}` occurrence in `template` against `state`.
pub fn render(template: &str, state: &RuntimeState) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    loop {
        match rest.find("{{") {
            None => {
                out.push_str(rest);
                break;
            }
            Some(start) => {
                out.push_str(&rest[..start]);
                let after_open = &rest[start + 2..];
                let end = after_open.find("}}").ok_or_else(|| {
                    GraphError::TemplateSyntax(format!(
                        "unterminated placeholder in template: {template}"
                    ))
                })?;
                let expr = after_open[..end].trim();
                out.push_str(&resolve_placeholder(expr, state));
                rest = &after_open[end + 2..];
            }
        }
    }

    Ok(out)
}

fn resolve_placeholder(expr: &str, state: &RuntimeState) -> String {
    let path = match expr.strip_prefix("state.") {
        Some(p) => p,
        None => {
            // Not a `state.*` placeholder: leave verbatim.
            return format!("{{{{{expr}}}}}");
        }
    };

    if let Some(value) = state.get_path(path) {
        return stringify(&value);
    }
    // Fall back to `data.<path>`.
    let data_path = format!("data.{path}");
    if let Some(value) = state.get_path(&data_path) {
        return stringify(&value);
    }

    tracing::warn!(placeholder = %expr, "unresolved template placeholder, leaving literal");
    format!("{{{{{expr}}}}}")
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Recursively render every string value inside a JSON structure; non-string
/// leaves pass through unchanged.
pub fn render_params(value: &Value, state: &RuntimeState) -> Result<Value> {
    match value {
        Value::String(s) => Ok(Value::String(render(s, state)?)),
        Value::Array(items) => {
            let rendered: Result<Vec<Value>> =
                items.iter().map(|v| render_params(v, state)).collect();
            Ok(Value::Array(rendered?))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), render_params(v, state)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
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
        let mut s = RuntimeState::new(json!({"message": "hi"}), json!({}), "u1", 4, handles, "m", "g", "c");
        s.data = data;
        s
    }

    #[test]
    fn renders_simple_path() {
        let state = state_with_data(json!({"plan": "do the thing"}));
        let out = render("Plan: {{state.data.plan}}", &state).unwrap();
        assert_eq!(out, "Plan: do the thing");
    }

    #[test]
    fn falls_back_to_data_prefix() {
        let state = state_with_data(json!({"custom": 42}));
        // "custom" is not a recognized top-level root, so it is treated as
        // `data.custom` directly by `get_path`, and resolves on the first try.
        let out = render("{{state.custom}}", &state).unwrap();
        assert_eq!(out, "42");
    }

    #[test]
    fn preserves_unresolved_placeholder() {
        let state = state_with_data(json!({}));
        let out = render("{{state.data.missing.path}}", &state).unwrap();
        assert_eq!(out, "{{state.data.missing.path}}");
    }

    #[test]
    fn object_values_encode_as_json() {
        let state = state_with_data(json!({"obj": {"a": 1}}));
        let out = render("{{state.data.obj}}", &state).unwrap();
        assert_eq!(out, r#"{"a":1}"#);
    }

    #[test]
    fn malformed_placeholder_errors() {
        let state = state_with_data(json!({}));
        assert!(render("{{state.data.plan", &state).is_err());
    }

    #[test]
    fn idempotent_when_no_placeholders() {
        let state = state_with_data(json!({}));
        let t = "plain text, no placeholders";
        assert_eq!(render(t, &state).unwrap(), t);
    }

    #[test]
    fn idempotent_once_resolved() {
        let state = state_with_data(json!({"plan": "x"}));
        let t = "{{state.data.plan}}";
        let once = render(t, &state).unwrap();
        let twice = render(&once, &state).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn render_params_recurses_arrays_and_objects() {
        let state = state_with_data(json!({"name": "world"}));
        let input = json!({
            "greeting": "hello {{state.data.name}}",
            "list": ["a", "{{state.data.name}}"],
            "count": 3,
        });
        let out = render_params(&input, &state).unwrap();
        assert_eq!(out["greeting"], json!("hello world"));
        assert_eq!(out["list"][1], json!("world"));
        assert_eq!(out["count"], json!(3));
    }
}
