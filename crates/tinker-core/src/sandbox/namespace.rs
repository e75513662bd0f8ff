//! The persistent variable namespace shared by all code blocks of one task.
//!
//! The namespace lives for exactly one task: created empty (or seeded from a
//! stored snapshot on explicit resume), never reset between rounds, dropped
//! with the task. Only sandbox code mutates it - the write methods are
//! crate-private - while the task controller owns its lifetime.

use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

/// JSON-valued name bindings carried across rounds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Namespace {
    bindings: BTreeMap<String, Value>,
}

impl Namespace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a namespace from a stored snapshot.
    ///
    /// Anything but a JSON object yields an empty namespace with a warning;
    /// snapshots are best-effort by design.
    pub fn from_snapshot(snapshot: Value) -> Self {
        match snapshot {
            Value::Object(map) => Self {
                bindings: map.into_iter().collect(),
            },
            Value::Null => Self::default(),
            other => {
                warn!(kind = json_kind(&other), "Namespace snapshot is not an object; starting empty");
                Self::default()
            }
        }
    }

    /// Serializes the current bindings as a JSON object.
    pub fn snapshot(&self) -> Value {
        Value::Object(self.bindings.clone().into_iter().collect())
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }

    /// Replaces the whole binding set with the state captured after an
    /// execution. Runtimes inject the previous bindings before running, so
    /// the captured state is a superset of anything still alive.
    ///
    /// Write access is reserved for [`LanguageRuntime`](super::LanguageRuntime)
    /// implementations: the only `&mut Namespace` in the system flows
    /// through [`Sandbox::run`](super::Sandbox::run).
    pub fn replace(&mut self, bindings: BTreeMap<String, Value>) {
        self.bindings = bindings;
    }

    /// Binds a single name. Used by runtimes that update incrementally;
    /// see [`replace`](Self::replace) for the access rule.
    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        self.bindings.insert(name.into(), value);
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_snapshot_roundtrip() {
        let mut ns = Namespace::new();
        ns.bind("x", json!(42));
        ns.bind("rows", json!([1, 2, 3]));

        let snapshot = ns.snapshot();
        let restored = Namespace::from_snapshot(snapshot);
        assert_eq!(restored, ns);
        assert_eq!(restored.get("x"), Some(&json!(42)));
    }

    #[test]
    fn test_non_object_snapshot_starts_empty() {
        let ns = Namespace::from_snapshot(json!([1, 2]));
        assert!(ns.is_empty());
        let ns = Namespace::from_snapshot(Value::Null);
        assert!(ns.is_empty());
    }

    #[test]
    fn test_replace_overwrites_bindings() {
        let mut ns = Namespace::new();
        ns.bind("old", json!(1));

        let mut new_state = BTreeMap::new();
        new_state.insert("old".to_string(), json!(1));
        new_state.insert("fresh".to_string(), json!("hi"));
        ns.replace(new_state);

        assert_eq!(ns.len(), 2);
        assert_eq!(ns.get("fresh"), Some(&json!("hi")));
    }
}
