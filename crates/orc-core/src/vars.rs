//! Variable substitution: `${NAME}` / `${NAME:-DEFAULT}` resolved against a
//! layered runtime namespace.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::{json, Value};
use tracing::warn;

/// A single logical scope, accessed via dotted paths, built from layers in
/// priority order (first match wins):
///
/// 1. Per-iteration loop bindings
/// 2. Completed stage outputs (`<stage>.output`, `<stage>.review`)
/// 3. Workflow variables from the definition
/// 4. Built-ins (`timestamp`, `date`, `time`, `uuid`, `user_name`)
/// 5. System properties / environment
/// 6. Literal default from `${name:-default}` (handled by the caller, not a layer)
#[derive(Debug, Clone, Default)]
pub struct Namespace {
    layers: Vec<Value>,
}

impl Namespace {
    pub fn new() -> Self {
        Self { layers: Vec::new() }
    }

    /// Push a layer with the given priority: layers pushed later are
    /// searched *after* layers pushed earlier. Callers should push in the
    /// order: iteration bindings, stage outputs, workflow variables,
    /// built-ins, environment.
    pub fn push_layer(&mut self, layer: Value) {
        self.layers.push(layer);
    }

    /// Resolve a dotted path against the layered scope. Returns a clone of
    /// the first match, in layer priority order.
    pub fn resolve(&self, path: &str) -> Option<Value> {
        for layer in &self.layers {
            if let Some(v) = resolve_dotted(layer, path) {
                return Some(v.clone());
            }
        }
        None
    }
}

/// Walk a dotted path (`a.b.c`) through nested JSON objects. Anything other
/// than an object terminates the walk with `None` for any remaining
/// segment.
pub fn resolve_dotted<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        match current {
            Value::Object(map) => {
                current = map.get(segment)?;
            }
            _ => return None,
        }
    }
    Some(current)
}

/// Render a JSON value as the string substitution would natural-stringify
/// it: strings pass through unquoted, numbers/bools use their natural
/// display, null/arrays/objects fall back to compact JSON.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Layer 4 of the runtime namespace: `timestamp`, `date`, `time`,
/// `uuid`, `user_name`, computed fresh at the moment a workflow run starts
/// and pushed as one namespace layer ahead of environment/system properties.
pub fn builtins(now: DateTime<Utc>) -> Value {
    json!({
        "timestamp": now.format("%Y%m%d-%H%M%S").to_string(),
        "date": now.format("%Y-%m-%d").to_string(),
        "time": now.format("%H:%M:%S").to_string(),
        "uuid": uuid::Uuid::new_v4().to_string(),
        "user_name": std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string()),
    })
}

/// Layer 5 of the runtime namespace: process environment variables, exposed
/// flat (no dotted nesting) since env var names are not structured paths.
pub fn environment_layer() -> Value {
    let mut map = serde_json::Map::new();
    for (k, v) in std::env::vars() {
        map.insert(k, Value::String(v));
    }
    Value::Object(map)
}

/// Resolve a workflow's `output_dir` template against `${timestamp}` and
/// `${workflow}`, using the same
/// substitution layer as prompt rendering. No file I/O happens here; the
/// kernel only returns the resolved path string.
pub fn resolve_output_dir(template: &str, workflow_name: &str, now: DateTime<Utc>) -> String {
    let mut ns = Namespace::new();
    ns.push_layer(json!({ "workflow": workflow_name }));
    ns.push_layer(builtins(now));
    substitute(template, &ns)
}

fn var_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z0-9_.]+)(:-([^}]*))?\}").unwrap())
}

/// Resolve all `${NAME}` / `${NAME:-DEFAULT}` tokens in `input` against the
/// namespace. Unresolved names with no default are passed through as the
/// literal `${NAME}` — substitution never raises on a missing variable.
pub fn substitute(input: &str, ns: &Namespace) -> String {
    var_pattern()
        .replace_all(input, |caps: &regex::Captures| {
            let name = &caps[1];
            let default = caps.get(3).map(|m| m.as_str());

            match ns.resolve(name) {
                Some(v) => stringify(&v),
                None => match default {
                    Some(d) => d.to_string(),
                    None => {
                        warn!(name, "unresolved variable, leaving literal token in place");
                        caps[0].to_string()
                    }
                },
            }
        })
        .into_owned()
}

/// Recursively substitute through nested JSON containers, producing a deep
/// copy. Strings have `${...}` tokens resolved; numbers/bools/null pass
/// through unchanged; objects and arrays are rebuilt recursively.
pub fn substitute_deep(value: &Value, ns: &Namespace) -> Value {
    match value {
        Value::String(s) => Value::String(substitute(s, ns)),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| substitute_deep(v, ns)).collect())
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), substitute_deep(v, ns));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ns_with(layers: Vec<Value>) -> Namespace {
        let mut ns = Namespace::new();
        for l in layers {
            ns.push_layer(l);
        }
        ns
    }

    #[test]
    fn resolves_simple_name() {
        let ns = ns_with(vec![json!({"topic": "rust"})]);
        assert_eq!(substitute("hello ${topic}", &ns), "hello rust");
    }

    #[test]
    fn resolves_dotted_path() {
        let ns = ns_with(vec![json!({"a": {"b": {"c": "deep"}}})]);
        assert_eq!(substitute("${a.b.c}", &ns), "deep");
    }

    #[test]
    fn missing_with_default_resolves_to_default() {
        let ns = ns_with(vec![json!({})]);
        assert_eq!(substitute("${missing:-fallback}", &ns), "fallback");
    }

    #[test]
    fn missing_with_empty_default_resolves_to_empty_string() {
        let ns = ns_with(vec![json!({})]);
        assert_eq!(substitute("[${A:-}]", &ns), "[]");
    }

    #[test]
    fn missing_without_default_passes_through_literal() {
        let ns = ns_with(vec![json!({})]);
        assert_eq!(substitute("${UNSET}", &ns), "${UNSET}");
    }

    #[test]
    fn earlier_layer_wins_over_later_layer() {
        let ns = ns_with(vec![json!({"name": "first"}), json!({"name": "second"})]);
        assert_eq!(substitute("${name}", &ns), "first");
    }

    #[test]
    fn number_and_bool_stringify_naturally() {
        let ns = ns_with(vec![json!({"n": 42, "flag": true})]);
        assert_eq!(substitute("${n}-${flag}", &ns), "42-true");
    }

    #[test]
    fn idempotent_after_one_expansion() {
        let ns = ns_with(vec![json!({"x": "y"})]);
        let once = substitute("${x}", &ns);
        let twice = substitute(&once, &ns);
        assert_eq!(once, twice);
    }

    #[test]
    fn substitute_deep_walks_nested_containers() {
        let ns = ns_with(vec![json!({"name": "alice"})]);
        let input = json!({
            "greeting": "hi ${name}",
            "list": ["a ${name}", "b"],
            "nested": {"inner": "${name}!"},
            "num": 3,
        });
        let out = substitute_deep(&input, &ns);
        assert_eq!(out["greeting"], json!("hi alice"));
        assert_eq!(out["list"][0], json!("a alice"));
        assert_eq!(out["nested"]["inner"], json!("alice!"));
        assert_eq!(out["num"], json!(3));
    }

    #[test]
    fn substitute_deep_does_not_mutate_input() {
        let ns = ns_with(vec![json!({"name": "alice"})]);
        let input = json!({"greeting": "hi ${name}"});
        let _ = substitute_deep(&input, &ns);
        assert_eq!(input["greeting"], json!("hi ${name}"));
    }

    #[test]
    fn builtins_expose_timestamp_date_time_uuid_user_name() {
        let now = DateTime::parse_from_rfc3339("2026-07-28T12:34:56Z")
            .unwrap()
            .with_timezone(&Utc);
        let b = builtins(now);
        assert_eq!(b["timestamp"], json!("20260728-123456"));
        assert_eq!(b["date"], json!("2026-07-28"));
        assert_eq!(b["time"], json!("12:34:56"));
        assert!(b["uuid"].as_str().unwrap().len() == 36);
        assert!(b["user_name"].is_string());
    }

    #[test]
    fn resolve_output_dir_substitutes_workflow_and_timestamp() {
        let now = DateTime::parse_from_rfc3339("2026-07-28T12:34:56Z")
            .unwrap()
            .with_timezone(&Utc);
        let path = resolve_output_dir("./out/${workflow}-${timestamp}", "book", now);
        assert_eq!(path, "./out/book-20260728-123456");
    }
}
