//! JSON load/store for pure value trees.
//!
//! Only null, bool, number, string, list, and assoc nodes have a JSON
//! image; labels, comments, and opcodes do not survive the trip and cyclic
//! graphs are rejected. Non-finite numbers map to JSON null.

use crate::{NodeId, NodeKind, NodeManager, NodeRef};
use rustc_hash::FxHashSet;
use serde_json::{Map, Number, Value};

/// Errors for JSON conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JsonError {
    /// Input text was not valid JSON.
    Parse(String),
    /// The tree contains a kind with no JSON image.
    UnsupportedKind(NodeKind),
    /// The tree is cyclic.
    Cyclic,
}

impl std::fmt::Display for JsonError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JsonError::Parse(msg) => write!(f, "invalid JSON: {msg}"),
            JsonError::UnsupportedKind(kind) => {
                write!(f, "{:?} nodes have no JSON representation", kind)
            }
            JsonError::Cyclic => write!(f, "cyclic trees have no JSON representation"),
        }
    }
}

impl std::error::Error for JsonError {}

/// Parse JSON text into a node tree owned by `manager`.
pub fn from_json_str(source: &str, manager: &mut NodeManager) -> Result<NodeRef, JsonError> {
    let value: Value =
        serde_json::from_str(source).map_err(|e| JsonError::Parse(e.to_string()))?;
    Ok(value_to_node(&value, manager))
}

fn value_to_node(value: &Value, manager: &mut NodeManager) -> NodeRef {
    match value {
        Value::Null => manager.alloc_null(),
        Value::Bool(b) => manager.alloc_bool(*b),
        Value::Number(n) => manager.alloc_number(n.as_f64().unwrap_or(f64::NAN)),
        Value::String(s) => manager.alloc_string(s),
        Value::Array(items) => {
            let children: Vec<NodeRef> =
                items.iter().map(|item| value_to_node(item, manager)).collect();
            manager.alloc_list(children)
        }
        Value::Object(map) => {
            let parent = manager.alloc(NodeKind::Assoc);
            for (key, item) in map {
                let child = value_to_node(item, manager);
                let key_id = manager.pool().intern(key);
                manager.set_assoc_child(parent.id, key_id, child);
            }
            parent
        }
    }
}

/// Render the tree at `root` as JSON text.
pub fn to_json_string(
    manager: &NodeManager,
    root: NodeId,
    pretty: bool,
) -> Result<String, JsonError> {
    let mut on_path = FxHashSet::default();
    let value = node_to_value(manager, root, &mut on_path)?;
    let rendered = if pretty {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    };
    rendered.map_err(|e| JsonError::Parse(e.to_string()))
}

fn node_to_value(
    manager: &NodeManager,
    id: NodeId,
    on_path: &mut FxHashSet<NodeId>,
) -> Result<Value, JsonError> {
    let node = manager.get(id);
    if !on_path.insert(id) {
        return Err(JsonError::Cyclic);
    }

    let value = match node.kind() {
        NodeKind::Null => Value::Null,
        NodeKind::Bool => Value::Bool(node.bool_value().unwrap_or(false)),
        NodeKind::Number => {
            let n = node.number_value().unwrap_or(f64::NAN);
            Number::from_f64(n).map_or(Value::Null, Value::Number)
        }
        NodeKind::String | NodeKind::Symbol => {
            let sid = node.string_id().unwrap_or_default();
            Value::String(manager.pool().get(sid))
        }
        NodeKind::List => {
            let mut items = Vec::with_capacity(node.children().len());
            for &child in node.children() {
                items.push(node_to_value(manager, child, on_path)?);
            }
            Value::Array(items)
        }
        NodeKind::Assoc => {
            let assoc = node.assoc().map(Clone::clone).unwrap_or_default();
            // Sort keys so the output is deterministic across builds.
            let mut entries: Vec<(String, NodeId)> = assoc
                .iter()
                .map(|(&key, &child)| (manager.pool().get(key), child))
                .collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut map = Map::new();
            for (key, child) in entries {
                map.insert(key, node_to_value(manager, child, on_path)?);
            }
            Value::Object(map)
        }
        other => return Err(JsonError::UnsupportedKind(other)),
    };

    on_path.remove(&id);
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::default_pool;
    use pretty_assertions::assert_eq;

    fn manager() -> NodeManager {
        NodeManager::new(default_pool())
    }

    #[test]
    fn round_trip_pure_tree() {
        let mut m = manager();
        let text = r#"{"a":[1.0,2.5,null],"b":"hi","c":true}"#;
        let root = from_json_str(text, &mut m).expect("parse");
        let rendered = to_json_string(&m, root.id, false).expect("render");
        assert_eq!(rendered, text);
    }

    #[test]
    fn nested_round_trip_is_identity() {
        let mut m = manager();
        let text = r#"[{"x":[[]],"y":{}},false,"s"]"#;
        let root = from_json_str(text, &mut m).expect("parse");
        let rendered = to_json_string(&m, root.id, false).expect("render");
        let root2 = from_json_str(&rendered, &mut m).expect("reparse");
        assert!(m.deep_equal(root.id, root2.id));
    }

    #[test]
    fn non_finite_numbers_render_null() {
        let mut m = manager();
        let nan = m.alloc_number(f64::NAN);
        let inf = m.alloc_number(f64::INFINITY);
        let root = m.alloc_list([nan, inf]);
        let rendered = to_json_string(&m, root.id, false).expect("render");
        assert_eq!(rendered, "[null,null]");
    }

    #[test]
    fn opcodes_are_rejected() {
        let mut m = manager();
        let op = m.alloc(NodeKind::Add);
        let err = to_json_string(&m, op.id, false).unwrap_err();
        assert_eq!(err, JsonError::UnsupportedKind(NodeKind::Add));
    }

    #[test]
    fn cycles_are_rejected() {
        let mut m = manager();
        let a = m.alloc(NodeKind::List);
        let b = m.alloc(NodeKind::List);
        m.add_child(a.id, crate::NodeRef::shared(b.id));
        m.add_child(b.id, crate::NodeRef::shared(a.id));
        let err = to_json_string(&m, a.id, false).unwrap_err();
        assert_eq!(err, JsonError::Cyclic);
    }

    #[test]
    fn invalid_json_reports_parse_error() {
        let mut m = manager();
        assert!(matches!(
            from_json_str("{oops", &mut m),
            Err(JsonError::Parse(_))
        ));
    }
}
