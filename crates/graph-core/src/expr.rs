//! Safe expression evaluator.
//!
//! A small hand-rolled recursive-descent parser and evaluator over a
//! deliberately closed grammar: property access, comparisons, `&&`/`||`,
//! and literals. There is no escape hatch to dynamic code — extending the
//! grammar means adding a new production here, never adding an "eval"
//! fallback.

use serde_json::Value;
use std::collections::HashMap;

use crate::model::FALLBACK_KEY;
use crate::state::RuntimeState;

/// Identifiers that abort evaluation outright if they appear as a bare
/// token anywhere in the expression source.
const FORBIDDEN_TOKENS: &[&str] = &[
    "eval",
    "Function",
    "constructor",
    "__proto__",
    "prototype",
    "require",
    "import",
    "process",
    "global",
    "globalThis",
    "this",
];

/// Evaluate `expression` against `state`. This never raises — a forbidden
/// token or a syntax error both evaluate to `Value::Bool(false)` (the
/// caller that needs the `__fallback__` string uses [`resolve_edge`]
/// instead).
pub fn evaluate(expression: &str, state: &RuntimeState) -> Value {
    evaluate_with_bindings(expression, state, &HashMap::new())
}

/// Same as [`evaluate`] but with extra local bindings (e.g. `item`, `index`
/// for `map`/`filter` transform steps) layered on top of `state`.
pub fn evaluate_with_bindings(
    expression: &str,
    state: &RuntimeState,
    bindings: &HashMap<String, Value>,
) -> Value {
    if contains_forbidden_token(expression) {
        tracing::warn!(%expression, "expression contains forbidden token, treating as unsafe");
        return Value::Bool(false);
    }
    match parse_and_eval(expression, state, bindings) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(%expression, error = %e, "expression failed to parse, treating as unsafe");
            Value::Bool(false)
        }
    }
}

/// Coerce a value the way the step `condition` guard does: `false`,
/// `null`, `0`, `""`, and the JSON `false` literal are falsy; everything
/// else is truthy.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(_) => true,
    }
}

/// Resolve a conditional edge's routing key: evaluate, then compare the
/// stringified result against `targets`' keys, then its values, else
/// `__fallback__`.
pub fn resolve_edge(
    condition: &str,
    state: &RuntimeState,
    targets: &HashMap<String, String>,
) -> String {
    if contains_forbidden_token(condition) {
        return FALLBACK_KEY.to_string();
    }
    let result = match parse_and_eval(condition, state, &HashMap::new()) {
        Ok(v) => v,
        Err(_) => return FALLBACK_KEY.to_string(),
    };
    let stringified = match &result {
        Value::String(s) => s.clone(),
        other => stringify_scalar(other),
    };
    if targets.contains_key(&stringified) {
        return stringified;
    }
    for (key, value) in targets {
        if value == &stringified {
            return key.clone();
        }
    }
    FALLBACK_KEY.to_string()
}

fn stringify_scalar(v: &Value) -> String {
    match v {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn contains_forbidden_token(expression: &str) -> bool {
    for token in FORBIDDEN_TOKENS {
        if contains_identifier(expression, token) {
            return true;
        }
    }
    false
}

/// True if `token` appears in `source` as a standalone identifier (not as a
/// substring of a larger identifier, and not inside a quoted string
/// literal).
fn contains_identifier(source: &str, token: &str) -> bool {
    let bytes = source.as_bytes();
    let mut in_string: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match in_string {
            Some(q) if b == q => in_string = None,
            Some(_) => {}
            None if b == b'"' || b == b'\'' => in_string = Some(b),
            None => {}
        }
        i += 1;
    }
    // Re-scan stripping string literals, then check for the identifier with
    // word boundaries.
    let stripped = strip_string_literals(source);
    let tb = token.as_bytes();
    let sb = stripped.as_bytes();
    let mut idx = 0;
    while let Some(pos) = find_sub(&sb[idx..], tb) {
        let start = idx + pos;
        let end = start + tb.len();
        let before_ok = start == 0 || !is_ident_byte(sb[start - 1]);
        let after_ok = end == sb.len() || !is_ident_byte(sb[end]);
        if before_ok && after_ok {
            return true;
        }
        idx = start + 1;
    }
    false
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

fn find_sub(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn strip_string_literals(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut chars = source.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '"' || c == '\'' {
            out.push(' ');
            for inner in chars.by_ref() {
                if inner == c {
                    break;
                }
                out.push(' ');
            }
        } else {
            out.push(c);
        }
    }
    out
}

// --- Recursive-descent parser -------------------------------------------
//
// Grammar:
//   expr        := or_expr
//   or_expr     := and_expr ( '||' and_expr )*
//   and_expr    := comparison ( '&&' comparison )*
//   comparison  := operand ( OP operand )?
//   operand     := literal | property_access
//   OP          := '===' | '!==' | '==' | '!=' | '>=' | '<=' | '>' | '<'

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

type ParseResult<T> = std::result::Result<T, String>;

pub fn parse_and_eval(
    expression: &str,
    state: &RuntimeState,
    bindings: &HashMap<String, Value>,
) -> ParseResult<Value> {
    let mut parser = Parser {
        input: expression,
        pos: 0,
    };
    let value = parser.parse_or(state, bindings)?;
    parser.skip_ws();
    if parser.pos != parser.input.len() {
        return Err(format!("trailing input: {}", &parser.input[parser.pos..]));
    }
    Ok(value)
}

impl<'a> Parser<'a> {
    fn skip_ws(&mut self) {
        while self.pos < self.input.len() && self.input.as_bytes()[self.pos] == b' ' {
            self.pos += 1;
        }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn try_consume(&mut self, token: &str) -> bool {
        self.skip_ws();
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn parse_or(
        &mut self,
        state: &RuntimeState,
        bindings: &HashMap<String, Value>,
    ) -> ParseResult<Value> {
        let mut left = self.parse_and(state, bindings)?;
        loop {
            if self.try_consume("||") {
                let right = self.parse_and(state, bindings)?;
                left = Value::Bool(truthy(&left) || truthy(&right));
            } else {
                break;
            }
        }
        Ok(left)
    }

    fn parse_and(
        &mut self,
        state: &RuntimeState,
        bindings: &HashMap<String, Value>,
    ) -> ParseResult<Value> {
        let mut left = self.parse_comparison(state, bindings)?;
        loop {
            if self.try_consume("&&") {
                let right = self.parse_comparison(state, bindings)?;
                left = Value::Bool(truthy(&left) && truthy(&right));
            } else {
                break;
            }
        }
        Ok(left)
    }

    fn parse_comparison(
        &mut self,
        state: &RuntimeState,
        bindings: &HashMap<String, Value>,
    ) -> ParseResult<Value> {
        let left = self.parse_operand(state, bindings)?;
        self.skip_ws();
        const OPS: &[&str] = &["===", "!==", "==", "!=", ">=", "<=", ">", "<"];
        for op in OPS {
            if self.rest().starts_with(op) {
                self.pos += op.len();
                let right = self.parse_operand(state, bindings)?;
                return Ok(Value::Bool(apply_op(op, &left, &right)));
            }
        }
        Ok(left)
    }

    fn parse_operand(
        &mut self,
        state: &RuntimeState,
        bindings: &HashMap<String, Value>,
    ) -> ParseResult<Value> {
        self.skip_ws();
        if self.rest().starts_with('\'') || self.rest().starts_with('"') {
            return self.parse_string();
        }
        if self.rest().starts_with("true") && !self.next_is_ident_continuation(4) {
            self.pos += 4;
            return Ok(Value::Bool(true));
        }
        if self.rest().starts_with("false") && !self.next_is_ident_continuation(5) {
            self.pos += 5;
            return Ok(Value::Bool(false));
        }
        if self.rest().starts_with("null") && !self.next_is_ident_continuation(4) {
            self.pos += 4;
            return Ok(Value::Null);
        }
        if self.rest().starts_with("undefined") && !self.next_is_ident_continuation(9) {
            self.pos += 9;
            return Ok(Value::Null);
        }
        if self
            .rest()
            .chars()
            .next()
            .map(|c| c.is_ascii_digit() || c == '-')
            .unwrap_or(false)
        {
            return self.parse_number();
        }
        self.parse_property(state, bindings)
    }

    fn next_is_ident_continuation(&self, offset: usize) -> bool {
        self.rest()
            .as_bytes()
            .get(offset)
            .map(|b| is_ident_byte(*b))
            .unwrap_or(false)
    }

    fn parse_string(&mut self) -> ParseResult<Value> {
        let quote = self.rest().chars().next().unwrap();
        self.pos += 1;
        let start = self.pos;
        let end = self.rest().find(quote).ok_or("unterminated string literal")?;
        let s = self.input[start..start + end].to_string();
        self.pos = start + end + 1;
        Ok(Value::String(s))
    }

    fn parse_number(&mut self) -> ParseResult<Value> {
        let start = self.pos;
        if self.rest().starts_with('-') {
            self.pos += 1;
        }
        while self
            .rest()
            .chars()
            .next()
            .map(|c| c.is_ascii_digit() || c == '.')
            .unwrap_or(false)
        {
            self.pos += 1;
        }
        let text = &self.input[start..self.pos];
        let n: f64 = text.parse().map_err(|_| format!("invalid number: {text}"))?;
        Ok(serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null))
    }

    fn parse_property(
        &mut self,
        state: &RuntimeState,
        bindings: &HashMap<String, Value>,
    ) -> ParseResult<Value> {
        let start = self.pos;
        while self
            .rest()
            .chars()
            .next()
            .map(|c| c.is_alphanumeric() || c == '_' || c == '.' || c == '$')
            .unwrap_or(false)
        {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(format!("expected operand at: {}", self.rest()));
        }
        let path = &self.input[start..self.pos];
        Ok(resolve_property(path, state, bindings))
    }
}

fn resolve_property(
    path: &str,
    state: &RuntimeState,
    bindings: &HashMap<String, Value>,
) -> Value {
    // A bare path is auto-prefixed with `state.`; a local binding (e.g.
    // `item`, `item.field`) takes precedence over state.
    let mut parts = path.splitn(2, '.');
    let head = parts.next().unwrap_or("");
    if let Some(bound) = bindings.get(head) {
        return match parts.next() {
            Some(rest) => walk_value(bound, rest),
            None => bound.clone(),
        };
    }

    let full = path.strip_prefix("state.").unwrap_or(path);
    state.get_path(full).unwrap_or(Value::Null)
}

fn walk_value(value: &Value, path: &str) -> Value {
    let mut current = value;
    for segment in path.split('.') {
        match current.get(segment) {
            Some(v) => current = v,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn apply_op(op: &str, left: &Value, right: &Value) -> bool {
    match op {
        "===" => left == right,
        "!==" => left != right,
        "==" => loose_eq(left, right),
        "!=" => !loose_eq(left, right),
        ">" | "<" | ">=" | "<=" => compare_numeric_or_string(op, left, right),
        _ => false,
    }
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    // Numeric/string coercion, the one loose-equality case the grammar needs.
    if let (Some(a), Some(b)) = (as_f64(left), as_f64(right)) {
        return a == b;
    }
    false
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn compare_numeric_or_string(op: &str, left: &Value, right: &Value) -> bool {
    let ordering = match (as_f64(left), as_f64(right)) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => match (left.as_str(), right.as_str()) {
            (Some(a), Some(b)) => Some(a.cmp(b)),
            _ => None,
        },
    };
    let Some(ord) = ordering else { return false };
    match op {
        ">" => ord == std::cmp::Ordering::Greater,
        "<" => ord == std::cmp::Ordering::Less,
        ">=" => ord != std::cmp::Ordering::Less,
        "<=" => ord != std::cmp::Ordering::Greater,
        _ => unreachable!(),
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use crate::llm::tests::NoopLmRegistry;
    use crate::state::Handles;
    use crate::tool::tests::NoopToolClient;
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::Arc;

    fn fresh_state() -> RuntimeState {
        let handles = Handles {
            lm_registry: Arc::new(NoopLmRegistry),
            tool_client: Arc::new(NoopToolClient),
        };
        RuntimeState::new(json!({}), json!({}), "u", 4, handles, "m", "g", "c")
    }

    proptest! {
        /// `evaluate` never raises: arbitrary (mostly garbage) input either
        /// parses to a value or falls back to `false`, but it never panics
        /// and never reaches the forbidden-token identifiers by another
        /// route. This is the contract callers (the conditional edge
        /// resolver, transform `filter`/`map` steps) rely on instead of
        /// wrapping every call in `catch_unwind`.
        #[test]
        fn evaluate_never_panics(expr in "[a-zA-Z0-9_.'\" ()!=<>&|-]{0,40}") {
            let state = fresh_state();
            let _ = evaluate(&expr, &state);
        }

        /// Same guarantee for the edge resolver, which has its own
        /// forbidden-token short-circuit ahead of the parser.
        #[test]
        fn resolve_edge_never_panics(expr in "[a-zA-Z0-9_.'\" ()!=<>&|-]{0,40}") {
            let state = fresh_state();
            let targets = HashMap::new();
            let _ = resolve_edge(&expr, &state, &targets);
        }

        /// A forbidden identifier as its own word always evaluates to
        /// `false`, regardless of the whitespace/operators around it.
        #[test]
        fn forbidden_token_always_unsafe(prefix in "[ .()!&|]{0,6}", suffix in "[ .()!&|]{0,6}") {
            let state = fresh_state();
            let expr = format!("{prefix}eval{suffix}");
            prop_assert_eq!(evaluate(&expr, &state), Value::Bool(false));
        }
    }
}
