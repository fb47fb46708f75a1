//! Write listener: mirror entity mutations into an assignment log.

use sable_ir::{NodeKind, NodeManager, NodeRef};
use std::io::{self, Write};

/// Immediate value as seen by the log.
#[derive(Debug, Clone, PartialEq)]
pub enum LoggedValue {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Numeric value.
    Number(f64),
    /// String value.
    String(String),
    /// Structured value, already unparsed to canonical text.
    Code(String),
}

/// Callbacks invoked on every entity mutation.
///
/// Implementations append assignment-form nodes to a log; a file-backed
/// implementation flushes them to disk as a write-ahead mirror.
pub trait WriteListener {
    /// A single labelled value was written.
    fn log_write_value(&mut self, entity: &str, label: &str, value: &LoggedValue);
    /// Several labelled values were written together.
    fn log_write_values(&mut self, entity: &str, values: &[(String, LoggedValue)]);
    /// The entity's whole root tree was replaced.
    fn log_write_code(&mut self, entity: &str, unparsed_root: &str);
    /// A contained entity was created.
    fn log_create_entity(&mut self, entity: &str);
    /// A contained entity was destroyed.
    fn log_destroy_entity(&mut self, entity: &str);
    /// The entity's random stream was reseeded.
    fn log_set_rng_seed(&mut self, entity: &str, seed: &str);
}

/// In-memory write log.
///
/// Each mutation becomes an assignment-form node tree in the log's own
/// manager; [`AssignmentLog::flush_to`] drains them as canonical text, one
/// entry per line.
pub struct AssignmentLog {
    manager: NodeManager,
    entries: Vec<sable_ir::NodeId>,
}

impl AssignmentLog {
    /// Empty log with its own node manager over `pool`.
    pub fn new(pool: sable_intern::SharedPool) -> Self {
        AssignmentLog {
            manager: NodeManager::new(pool),
            entries: Vec::new(),
        }
    }

    /// Number of logged mutations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing has been logged.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render every entry to canonical text, in order.
    pub fn entries_as_text(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|&id| sable_parse::unparse(&self.manager, id, false, true))
            .collect()
    }

    /// Write entries to `sink`, one per line, and clear the log.
    pub fn flush_to(&mut self, sink: &mut dyn Write) -> io::Result<()> {
        for &id in &self.entries {
            let line = sable_parse::unparse(&self.manager, id, false, true);
            sink.write_all(line.as_bytes())?;
            sink.write_all(b"\n")?;
        }
        for id in self.entries.drain(..) {
            self.manager.free_tree(id);
        }
        Ok(())
    }

    fn value_node(&mut self, value: &LoggedValue) -> NodeRef {
        match value {
            LoggedValue::Null => self.manager.alloc_null(),
            LoggedValue::Bool(b) => self.manager.alloc_bool(*b),
            LoggedValue::Number(n) => self.manager.alloc_number(*n),
            LoggedValue::String(s) => self.manager.alloc_string(s),
            LoggedValue::Code(text) => sable_parse::parse(text, &mut self.manager)
                .unwrap_or_else(|_| self.manager.alloc_null()),
        }
    }

    /// `(assign_to_entities entity (assoc label value ...))`
    fn push_assignment(&mut self, entity: &str, pairs: &[(String, LoggedValue)]) {
        let assoc = self.manager.alloc(NodeKind::Assoc);
        for (label, value) in pairs {
            let child = self.value_node(value);
            let key = self.manager.pool().intern(label);
            self.manager.set_assoc_child(assoc.id, key, child);
        }
        let name = self.manager.alloc_string(entity);
        let entry = self
            .manager
            .alloc_opcode(NodeKind::AssignToEntities, [name, assoc]);
        self.entries.push(entry.id);
    }

    fn push_simple(&mut self, kind: NodeKind, entity: &str, extra: Option<NodeRef>) {
        let name = self.manager.alloc_string(entity);
        let entry = match extra {
            Some(extra) => self.manager.alloc_opcode(kind, [name, extra]),
            None => self.manager.alloc_opcode(kind, [name]),
        };
        self.entries.push(entry.id);
    }
}

impl WriteListener for AssignmentLog {
    fn log_write_value(&mut self, entity: &str, label: &str, value: &LoggedValue) {
        self.push_assignment(entity, &[(label.to_owned(), value.clone())]);
    }

    fn log_write_values(&mut self, entity: &str, values: &[(String, LoggedValue)]) {
        self.push_assignment(entity, values);
    }

    fn log_write_code(&mut self, entity: &str, unparsed_root: &str) {
        let code = sable_parse::parse(unparsed_root, &mut self.manager)
            .unwrap_or_else(|_| self.manager.alloc_null());
        self.push_simple(NodeKind::AssignEntityRoots, entity, Some(code));
    }

    fn log_create_entity(&mut self, entity: &str) {
        self.push_simple(NodeKind::CreateEntities, entity, None);
    }

    fn log_destroy_entity(&mut self, entity: &str) {
        self.push_simple(NodeKind::DestroyEntities, entity, None);
    }

    fn log_set_rng_seed(&mut self, entity: &str, seed: &str) {
        let seed_node = self.manager.alloc_string(seed);
        self.push_simple(NodeKind::SetEntityRandSeed, entity, Some(seed_node));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Entity;
    use pretty_assertions::assert_eq;
    use sable_ir::default_pool;

    #[test]
    fn mutations_append_assignment_forms() {
        let pool = default_pool();
        let mut log = AssignmentLog::new(pool.clone());
        let mut e = Entity::new("store", pool.clone());
        e.set_root_from_source("(list #x 1)", None).expect("parse");

        let x = pool.get_id("x");
        let nine = e.manager_mut().alloc_number(9.0);
        e.set_value_at_label(x, nine, Some(&mut log)).expect("write");
        e.set_rand_seed("seed-1", Some(&mut log));

        let entries = log.entries_as_text();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], r#"(assign_to_entities "store" (assoc x 9))"#);
        assert_eq!(entries[1], r#"(set_entity_rand_seed "store" "seed-1")"#);
    }

    #[test]
    fn create_and_destroy_are_logged() {
        let pool = default_pool();
        let mut log = AssignmentLog::new(pool.clone());
        let mut container = Entity::new("top", pool.clone());
        container
            .add_child(Entity::new("worker", pool.clone()), Some(&mut log))
            .expect("add");
        let worker = pool.get_id("worker");
        container.remove_child(worker, Some(&mut log)).expect("remove");

        let entries = log.entries_as_text();
        assert_eq!(entries[0], r#"(create_entities "worker")"#);
        assert_eq!(entries[1], r#"(destroy_entities "worker")"#);
    }

    #[test]
    fn flush_drains_to_sink() {
        let pool = default_pool();
        let mut log = AssignmentLog::new(pool);
        log.log_create_entity("a");
        log.log_create_entity("b");

        let mut sink = Vec::new();
        log.flush_to(&mut sink).expect("flush");
        assert!(log.is_empty());
        assert_eq!(
            String::from_utf8(sink).expect("utf8"),
            "(create_entities \"a\")\n(create_entities \"b\")\n"
        );
    }
}
