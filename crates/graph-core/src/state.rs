//! The per-request [`RuntimeState`] tree and its reducer.
//!
//! `RuntimeState` is created once per request by the orchestrator, mutated
//! only through [`reduce`], and discarded at generation completion. Its
//! durable projection lives in the shared cache under `messageId` — that
//! projection is [`crate::generation`]'s concern, not this module's.

use serde_json::{json, Map, Value};
use std::sync::Arc;

use crate::llm::LmRegistry;
use crate::tool::ToolClient;

/// Everything a step or node needs to call out of the graph: the LM
/// registry, the tool client, and identifiers used for streaming/telemetry.
///
/// These handles are cheap `Arc` clones; they are never part of the
/// serializable `data`/`messages` workspace and are never written by the
/// reducer.
#[derive(Clone)]
pub struct Handles {
    pub lm_registry: Arc<dyn LmRegistry>,
    pub tool_client: Arc<dyn ToolClient>,
}

/// The per-request state tree threaded through the compiled graph.
#[derive(Clone)]
pub struct RuntimeState {
    // Input
    pub query: Value,
    pub options: Value,
    pub user_id: String,
    pub account_tier: u8,

    // Component handles
    pub handles: Handles,

    // Conversation context
    pub context_messages: Vec<Value>,
    pub context_summary: String,

    // Universal workspace
    pub data: Value,
    pub messages: Vec<Value>,
    pub response: Option<Value>,
    pub next_route: Option<String>,
    pub final_response: Option<Value>,
    pub node_counter: u64,
    pub current_step_index: u64,
    pub search_iterations: u32,

    // Streaming plumbing
    pub message_id: String,
    pub generation_id: String,
    pub conversation_id: String,
    /// Whether the step currently executing should forward tokens to the
    /// transport.
    pub step_stream_visible: bool,
}

impl RuntimeState {
    pub fn new(
        query: Value,
        options: Value,
        user_id: impl Into<String>,
        account_tier: u8,
        handles: Handles,
        message_id: impl Into<String>,
        generation_id: impl Into<String>,
        conversation_id: impl Into<String>,
    ) -> Self {
        Self {
            query,
            options,
            user_id: user_id.into(),
            account_tier,
            handles,
            context_messages: Vec::new(),
            context_summary: String::new(),
            data: json!({}),
            messages: Vec::new(),
            response: None,
            next_route: None,
            final_response: None,
            node_counter: 0,
            current_step_index: 0,
            search_iterations: 0,
            message_id: message_id.into(),
            generation_id: generation_id.into(),
            conversation_id: conversation_id.into(),
            step_stream_visible: false,
        }
    }

    /// Dot-path lookup against `{query, options, userId, accountTier, data,
    /// messages, response, contextMessages, contextSummary}`, used by the
    /// template renderer and expression evaluator. A bare path (no leading
    /// segment matching a top-level field) falls through to `data.<path>`.
    pub fn get_path(&self, path: &str) -> Option<Value> {
        let mut parts = path.split('.');
        let head = parts.next()?;
        let root = match head {
            "query" => self.query.clone(),
            "options" => self.options.clone(),
            "userId" => json!(self.user_id),
            "accountTier" => json!(self.account_tier),
            "data" => self.data.clone(),
            "messages" => json!(self.messages),
            "response" => self.response.clone().unwrap_or(Value::Null),
            "contextMessages" => json!(self.context_messages),
            "contextSummary" => json!(self.context_summary),
            "nextRoute" => self.next_route.clone().map(Value::String).unwrap_or(Value::Null),
            _ => {
                // Bare path without a recognized root: treat the whole path
                // as relative to `data`.
                return walk(&self.data, path);
            }
        };
        let rest: Vec<&str> = parts.collect();
        if rest.is_empty() {
            Some(root)
        } else {
            walk(&root, &rest.join("."))
        }
    }
}

fn walk(value: &Value, path: &str) -> Option<Value> {
    if path.is_empty() {
        return Some(value.clone());
    }
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current.clone())
}

/// A partial state update returned by a step or node. Only the workspace
/// fields are mutable via deltas; handles/identifiers are set once at
/// construction.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct StateDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_route: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_response: Option<Value>,
}

impl StateDelta {
    pub fn data_only(data: Value) -> Self {
        Self {
            data: Some(data),
            ..Default::default()
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a delta from a flat dot-path key (e.g. `"data.plan"`) and a
    /// value, expanding it into a nested `data` object.
    pub fn from_flat_key(key: &str, value: Value) -> Self {
        let stripped = key.strip_prefix("data.").unwrap_or(key);
        Self::data_only(nest(stripped, value))
    }
}

fn nest(path: &str, value: Value) -> Value {
    let mut segments: Vec<&str> = path.split('.').collect();
    let mut result = value;
    while let Some(segment) = segments.pop() {
        let mut obj = Map::new();
        obj.insert(segment.to_string(), result);
        result = Value::Object(obj);
    }
    result
}

/// Deep-merge `update` into `current`: objects merge key-by-key
/// recursively, arrays are replaced by the newer value except that
/// array-valued keys literally named `messages` anywhere in the tree are
/// concatenated rather than replaced.
pub fn deep_merge(current: &Value, update: &Value) -> Value {
    merge_inner(current, update, false)
}

fn merge_inner(current: &Value, update: &Value, is_messages_key: bool) -> Value {
    match (current, update) {
        (Value::Object(a), Value::Object(b)) => {
            let mut out = a.clone();
            for (k, v) in b {
                let merged = match out.get(k) {
                    Some(existing) => merge_inner(existing, v, k == "messages"),
                    None => v.clone(),
                };
                out.insert(k.clone(), merged);
            }
            Value::Object(out)
        }
        (Value::Array(a), Value::Array(b)) if is_messages_key => {
            let mut out = a.clone();
            out.extend(b.clone());
            Value::Array(out)
        }
        (_, b) => b.clone(),
    }
}

/// Apply a [`StateDelta`] onto a [`RuntimeState`], following the same
/// reducer semantics as [`deep_merge`] for `data`, and concatenation for
/// `messages`. Scalars (`response`, `next_route`, `final_response`) are
/// last-write-wins and only overwritten when the delta sets them.
pub fn reduce(state: &mut RuntimeState, delta: &StateDelta) {
    if let Some(data) = &delta.data {
        state.data = deep_merge(&state.data, data);
    }
    if !delta.messages.is_empty() {
        state.messages.extend(delta.messages.clone());
    }
    if let Some(response) = &delta.response {
        state.response = Some(response.clone());
    }
    if let Some(route) = &delta.next_route {
        state.next_route = Some(route.clone());
    }
    if let Some(fin) = &delta.final_response {
        state.final_response = Some(fin.clone());
    }
}

/// Apply a sequence of deltas in order; used by property tests to check
/// reducer associativity.
pub fn reduce_all(state: &mut RuntimeState, deltas: &[StateDelta]) {
    for d in deltas {
        reduce(state, d);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deep_merge_nests_objects() {
        let current = json!({"a": {"x": 1, "y": 2}});
        let update = json!({"a": {"y": 3, "z": 4}});
        let merged = deep_merge(&current, &update);
        assert_eq!(merged, json!({"a": {"x": 1, "y": 3, "z": 4}}));
    }

    #[test]
    fn deep_merge_replaces_non_messages_arrays() {
        let current = json!({"list": [1, 2, 3]});
        let update = json!({"list": [9]});
        assert_eq!(deep_merge(&current, &update), json!({"list": [9]}));
    }

    #[test]
    fn deep_merge_concats_messages_arrays() {
        let current = json!({"messages": [1, 2]});
        let update = json!({"messages": [3]});
        assert_eq!(deep_merge(&current, &update), json!({"messages": [1, 2, 3]}));
    }

    #[test]
    fn from_flat_key_nests_dot_path() {
        let delta = StateDelta::from_flat_key("data.plan.steps", json!(["a"]));
        assert_eq!(delta.data, Some(json!({"plan": {"steps": ["a"]}})));
    }

    #[test]
    fn reduce_composition_matches_single_pass() {
        use crate::tool::tests::NoopToolClient;
        use crate::llm::tests::NoopLmRegistry;

        let handles = Handles {
            lm_registry: Arc::new(NoopLmRegistry),
            tool_client: Arc::new(NoopToolClient),
        };
        let mut a = RuntimeState::new(json!({}), json!({}), "u", 4, handles.clone(), "m", "g", "c");
        let mut b = a.clone();

        let deltas = vec![
            StateDelta::data_only(json!({"x": 1})),
            StateDelta {
                messages: vec![json!("hi")],
                ..Default::default()
            },
            StateDelta::data_only(json!({"y": 2})),
        ];

        for d in &deltas[..2] {
            reduce(&mut a, d);
        }
        reduce(&mut a, &deltas[2]);

        reduce_all(&mut b, &deltas);

        assert_eq!(a.data, b.data);
        assert_eq!(a.messages, b.messages);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use crate::llm::tests::NoopLmRegistry;
    use crate::tool::tests::NoopToolClient;
    use proptest::collection::vec as pvec;
    use proptest::prelude::*;

    fn leaf_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i32>().prop_map(|n| json!(n)),
            "[a-z]{0,8}".prop_map(Value::String),
        ]
    }

    /// A shallow JSON object: a handful of string keys mapping to scalar
    /// leaves. Deep recursion isn't needed to exercise `deep_merge`'s
    /// object/array branches.
    fn shallow_object() -> impl Strategy<Value = Value> {
        prop::collection::btree_map("[a-c]", leaf_value(), 0..4)
            .prop_map(|m| Value::Object(m.into_iter().collect()))
    }

    fn state_delta() -> impl Strategy<Value = StateDelta> {
        (
            prop::option::of(shallow_object()),
            pvec(leaf_value(), 0..3),
            prop::option::of(leaf_value()),
        )
            .prop_map(|(data, messages, response)| StateDelta {
                data,
                messages,
                response,
                next_route: None,
                final_response: None,
            })
    }

    fn fresh_state() -> RuntimeState {
        let handles = Handles {
            lm_registry: Arc::new(NoopLmRegistry),
            tool_client: Arc::new(NoopToolClient),
        };
        RuntimeState::new(json!({}), json!({}), "u", 4, handles, "m", "g", "c")
    }

    proptest! {
        /// Folding a sequence of deltas via `reduce` one at a time, split at
        /// any point, agrees with folding them via `reduce_all` in one
        /// shot. This is the associativity property the reducer promises:
        /// callers (background retries, resumed streams) can replay deltas
        /// in whatever batches are convenient.
        #[test]
        fn reduce_is_split_invariant(deltas in pvec(state_delta(), 0..8), split in 0usize..9) {
            let split = split.min(deltas.len());

            let mut one_shot = fresh_state();
            reduce_all(&mut one_shot, &deltas);

            let mut in_parts = fresh_state();
            reduce_all(&mut in_parts, &deltas[..split]);
            reduce_all(&mut in_parts, &deltas[split..]);

            prop_assert_eq!(one_shot.data, in_parts.data);
            prop_assert_eq!(one_shot.messages, in_parts.messages);
            prop_assert_eq!(one_shot.response, in_parts.response);
        }

        /// `deep_merge` never drops a key present in either side: every key
        /// in `current` or `update` is present afterward (its value may
        /// have been overwritten or merged, but not discarded).
        #[test]
        fn deep_merge_preserves_keys(current in shallow_object(), update in shallow_object()) {
            let merged = deep_merge(&current, &update);
            let merged_obj = merged.as_object().unwrap();
            for key in current.as_object().unwrap().keys().chain(update.as_object().unwrap().keys()) {
                prop_assert!(merged_obj.contains_key(key));
            }
        }

        /// Merging an empty update is a no-op; merging onto an empty base
        /// reproduces the update.
        #[test]
        fn deep_merge_identity(value in shallow_object()) {
            prop_assert_eq!(deep_merge(&value, &json!({})), value.clone());
            prop_assert_eq!(deep_merge(&json!({}), &value), value);
        }
    }
}
