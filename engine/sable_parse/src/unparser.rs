//! Unparser: node trees back to canonical text.

use crate::lexer::escape;
use sable_intern::natural_compare;
use sable_ir::{NodeId, NodeKind, NodeManager};
use rustc_hash::FxHashSet;
use std::fmt::Write;

/// Render the tree at `root`.
///
/// With `sort_keys` assoc entries are emitted in natural key order, making
/// the output deterministic across builds. `pretty` adds indentation; the
/// compact form uses single spaces only. A cycle back to a node already on
/// the path is rendered as `null`.
pub fn unparse(manager: &NodeManager, root: NodeId, pretty: bool, sort_keys: bool) -> String {
    let mut out = String::new();
    let mut on_path = FxHashSet::default();
    let mut w = Writer {
        manager,
        pretty,
        sort_keys,
        on_path: &mut on_path,
    };
    w.write_node(&mut out, root, 0);
    out
}

struct Writer<'a> {
    manager: &'a NodeManager,
    pretty: bool,
    sort_keys: bool,
    on_path: &'a mut FxHashSet<NodeId>,
}

impl Writer<'_> {
    fn write_node(&mut self, out: &mut String, id: NodeId, indent: usize) {
        if !self.on_path.insert(id) {
            out.push_str("null");
            return;
        }
        let node = self.manager.get(id);

        // Comments precede the node, one `;` line each.
        let comment = node.comment();
        if comment.is_string() {
            let text = self.manager.pool().get(comment);
            for line in text.split('\n') {
                out.push(';');
                out.push_str(line);
                out.push('\n');
                self.write_indent(out, indent);
            }
        }

        for &label in node.labels() {
            out.push('#');
            out.push_str(&self.manager.pool().get(label));
            out.push(' ');
        }

        if node.is_concurrent() && node.kind().uses_ordered_children() {
            out.push_str("||");
        }

        match node.kind() {
            NodeKind::Null => out.push_str("null"),
            NodeKind::Bool => {
                out.push_str(if node.bool_value() == Some(true) { "true" } else { "false" });
            }
            NodeKind::Number => {
                write_number(out, node.number_value().unwrap_or(f64::NAN));
            }
            NodeKind::String => {
                let sid = node.string_id().unwrap_or_default();
                out.push_str(&escape(&self.manager.pool().get(sid)));
            }
            NodeKind::Symbol => {
                let sid = node.string_id().unwrap_or_default();
                out.push_str(&self.manager.pool().get(sid));
            }
            NodeKind::Assoc => self.write_assoc(out, id, indent),
            _ => self.write_form(out, id, indent),
        }

        self.on_path.remove(&id);
    }

    fn write_form(&mut self, out: &mut String, id: NodeId, indent: usize) {
        let node = self.manager.get(id);
        out.push('(');
        out.push_str(node.kind().keyword());

        let children = node.children().to_vec();
        let break_lines = self.pretty && self.should_break(&children);
        for &child in &children {
            if break_lines {
                out.push('\n');
                self.write_indent(out, indent + 1);
            } else {
                out.push(' ');
            }
            self.write_node(out, child, indent + 1);
        }
        if break_lines {
            out.push('\n');
            self.write_indent(out, indent);
        }
        out.push(')');
    }

    fn write_assoc(&mut self, out: &mut String, id: NodeId, indent: usize) {
        let node = self.manager.get(id);
        out.push_str("(assoc");

        let mut entries: Vec<(String, NodeId)> = node
            .assoc()
            .map(|map| {
                map.iter()
                    .map(|(&key, &child)| (self.manager.pool().get(key), child))
                    .collect()
            })
            .unwrap_or_default();
        if self.sort_keys {
            entries.sort_by(|a, b| natural_compare(&a.0, &b.0));
        }

        let children: Vec<NodeId> = entries.iter().map(|(_, child)| *child).collect();
        let break_lines = self.pretty && self.should_break(&children);
        for (key, child) in entries {
            if break_lines {
                out.push('\n');
                self.write_indent(out, indent + 1);
            } else {
                out.push(' ');
            }
            write_key(out, &key);
            out.push(' ');
            self.write_node(out, child, indent + 1);
        }
        if break_lines {
            out.push('\n');
            self.write_indent(out, indent);
        }
        out.push(')');
    }

    fn should_break(&self, children: &[NodeId]) -> bool {
        children.len() > 4
            || children.iter().any(|&child| {
                let kind = self.manager.get(child).kind();
                !kind.is_immediate()
            })
    }

    fn write_indent(&self, out: &mut String, indent: usize) {
        for _ in 0..indent {
            out.push_str("  ");
        }
    }
}

fn write_number(out: &mut String, value: f64) {
    if value.is_nan() {
        out.push_str("nan");
    } else if value == f64::INFINITY {
        out.push_str("infinity");
    } else if value == f64::NEG_INFINITY {
        out.push_str("-infinity");
    } else {
        let _ = write!(out, "{value}");
    }
}

fn is_bare_key(key: &str) -> bool {
    let mut chars = key.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
}

fn write_key(out: &mut String, key: &str) {
    if is_bare_key(key) {
        out.push_str(key);
    } else {
        out.push_str(&escape(key));
    }
}
