//! The entity container.

use crate::listener::{LoggedValue, WriteListener};
use crate::EntityError;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use sable_intern::{SharedPool, StringId};
use sable_ir::{MetadataPolicy, NodeId, NodeKind, NodeManager, NodeRef};
use sable_rand::RandomStream;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_UID: AtomicU64 = AtomicU64::new(1);

/// Reader-writer lock wrapping an [`Entity`].
///
/// Query reads take the read side; label mutation and child add/remove take
/// the write side. Unrelated entities share no lock.
pub type EntityLock = RwLock<Entity>;

/// A named container holding a code/data tree plus nested child entities.
pub struct Entity {
    uid: u64,
    name: String,
    manager: NodeManager,
    root: Option<NodeId>,
    rng: RandomStream,
    root_permission: bool,
    children: Vec<Entity>,
    child_index_by_name: FxHashMap<StringId, usize>,
    /// label → node tagged with it, rebuilt when the root changes.
    label_index: FxHashMap<StringId, NodeId>,
}

impl Entity {
    /// Create an empty entity sharing the given string pool.
    pub fn new(name: &str, pool: SharedPool) -> Self {
        Entity {
            uid: NEXT_UID.fetch_add(1, Ordering::Relaxed),
            name: name.to_owned(),
            manager: NodeManager::new(pool),
            root: None,
            rng: RandomStream::from_seed(name),
            root_permission: false,
            children: Vec::new(),
            child_index_by_name: FxHashMap::default(),
            label_index: FxHashMap::default(),
        }
    }

    /// Process-unique identity, stable for the entity's lifetime. Query
    /// caches key their per-container state on it.
    #[inline]
    pub fn uid(&self) -> u64 {
        self.uid
    }

    /// The entity's name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The entity-local node manager.
    #[inline]
    pub fn manager(&self) -> &NodeManager {
        &self.manager
    }

    /// Mutable access to the entity-local node manager.
    #[inline]
    pub fn manager_mut(&mut self) -> &mut NodeManager {
        &mut self.manager
    }

    /// The root node, if any.
    #[inline]
    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    /// Replace the root tree and rebuild the label index. The previous root
    /// is freed.
    pub fn set_root(&mut self, root: NodeRef, listener: Option<&mut dyn WriteListener>) {
        if let Some(old) = self.root.take() {
            self.manager.free_tree(old);
        }
        self.root = Some(root.id);
        self.rebuild_label_index();
        if let Some(listener) = listener {
            let unparsed = sable_parse::unparse(&self.manager, root.id, false, true);
            listener.log_write_code(&self.name, &unparsed);
        }
    }

    /// Parse `source` and install it as the root tree.
    pub fn set_root_from_source(
        &mut self,
        source: &str,
        listener: Option<&mut dyn WriteListener>,
    ) -> Result<(), sable_parse::ParseError> {
        let root = sable_parse::parse(source, &mut self.manager)?;
        self.set_root(root, listener);
        Ok(())
    }

    /// Walk the root tree and map every label to its node. First tagging
    /// wins for duplicate labels.
    fn rebuild_label_index(&mut self) {
        self.label_index.clear();
        let Some(root) = self.root else {
            return;
        };
        let mut stack = vec![root];
        let mut visited = sable_sets::BitSet::new();
        while let Some(id) = stack.pop() {
            if !visited.insert(id.index()) {
                continue;
            }
            let node = self.manager.get(id);
            for &label in node.labels() {
                self.label_index.entry(label).or_insert(id);
            }
            stack.extend(node.child_ids());
        }
    }

    /// All labels currently anchored in the root tree.
    pub fn labels(&self) -> impl Iterator<Item = StringId> + '_ {
        self.label_index.keys().copied()
    }

    /// Node tagged with `label`, or None.
    pub fn lookup_label(&self, label: StringId) -> Option<NodeId> {
        self.label_index.get(&label).copied()
    }

    /// Numeric value at `label`, when the tagged node is a number.
    pub fn number_at_label(&self, label: StringId) -> Option<f64> {
        self.lookup_label(label)
            .and_then(|id| self.manager.get(id).number_value())
    }

    /// Overwrite the value of the node tagged with `label` from `source`,
    /// which must live in this entity's manager. Immediate payloads are
    /// copied in place; structured payloads replace the node's children
    /// with a deep copy.
    pub fn set_value_at_label(
        &mut self,
        label: StringId,
        source: NodeRef,
        listener: Option<&mut dyn WriteListener>,
    ) -> Result<(), EntityError> {
        let Some(target) = self.lookup_label(label) else {
            return Err(EntityError::NoSuchEntity(self.manager.pool().get(label)));
        };

        let source_kind = self.manager.get(source.id).kind();
        match source_kind {
            NodeKind::Number => {
                let value = self.manager.get(source.id).number_value().unwrap_or(f64::NAN);
                if self.manager.get(target).kind() == NodeKind::Number {
                    self.manager.set_number(target, value);
                } else {
                    self.replace_labelled_node(label, target, source);
                }
            }
            _ => self.replace_labelled_node(label, target, source),
        }

        if let Some(listener) = listener {
            let label_text = self.manager.pool().get(label);
            listener.log_write_value(&self.name, &label_text, &self.logged_value(source.id));
        }
        Ok(())
    }

    /// Write several labelled values in one operation.
    pub fn set_values_at_labels(
        &mut self,
        values: &[(StringId, NodeRef)],
        listener: Option<&mut dyn WriteListener>,
    ) -> Result<(), EntityError> {
        for &(label, source) in values {
            self.set_value_at_label(label, source, None)?;
        }
        if let Some(listener) = listener {
            let logged: Vec<(String, LoggedValue)> = values
                .iter()
                .map(|&(label, source)| {
                    (self.manager.pool().get(label), self.logged_value(source.id))
                })
                .collect();
            listener.log_write_values(&self.name, &logged);
        }
        Ok(())
    }

    fn logged_value(&self, id: NodeId) -> LoggedValue {
        let node = self.manager.get(id);
        match node.kind() {
            NodeKind::Null => LoggedValue::Null,
            NodeKind::Bool => LoggedValue::Bool(node.bool_value().unwrap_or(false)),
            NodeKind::Number => LoggedValue::Number(node.number_value().unwrap_or(f64::NAN)),
            NodeKind::String | NodeKind::Symbol => LoggedValue::String(
                self.manager.pool().get(node.string_id().unwrap_or_default()),
            ),
            _ => LoggedValue::Code(sable_parse::unparse(&self.manager, id, false, true)),
        }
    }

    /// Swap the labelled node for a copy of `source`, carrying the target's
    /// labels over so the anchor survives.
    fn replace_labelled_node(&mut self, label: StringId, target: NodeId, source: NodeRef) {
        let copy = self
            .manager
            .deep_alloc_copy(source.id, MetadataPolicy::DropAll);
        // Carry the anchor label onto the replacement.
        self.manager.add_label_id(copy.id, label);

        // Re-point every parent slot at the replacement.
        let Some(root) = self.root else { return };
        if root == target {
            self.root = Some(copy.id);
        } else {
            repoint_child(&mut self.manager, root, target, copy.id);
        }
        self.manager.free_tree(target);
        self.rebuild_label_index();
    }

    // -- Random stream --

    /// Serialised random-stream state.
    pub fn rand_state(&self) -> [u8; sable_rand::STATE_LEN] {
        self.rng.state_bytes()
    }

    /// Reseed the stream from a string.
    pub fn set_rand_seed(&mut self, seed: &str, listener: Option<&mut dyn WriteListener>) {
        self.rng = RandomStream::from_seed(seed);
        if let Some(listener) = listener {
            listener.log_set_rng_seed(&self.name, seed);
        }
    }

    /// Mutable access to the stream for stochastic queries.
    pub fn rng_mut(&mut self) -> &mut RandomStream {
        &mut self.rng
    }

    // -- Permissions --

    /// Whether this entity has root permission.
    #[inline]
    pub fn has_root_permission(&self) -> bool {
        self.root_permission
    }

    /// Change the permission flag; requires the grantor itself to be
    /// privileged.
    pub fn set_root_permission(
        &mut self,
        granted: bool,
        grantor_has_root: bool,
    ) -> Result<(), EntityError> {
        if !grantor_has_root {
            return Err(EntityError::PermissionDenied(self.name.clone()));
        }
        self.root_permission = granted;
        Ok(())
    }

    /// Grant root permission without a grantor check; for the host setting
    /// up the top-level entity.
    pub fn grant_root_permission(&mut self) {
        self.root_permission = true;
    }

    // -- Contained entities --

    /// Number of contained entities.
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Contained entities in slot order.
    pub fn children(&self) -> &[Entity] {
        &self.children
    }

    /// Contained entity at `index`.
    pub fn child(&self, index: usize) -> Option<&Entity> {
        self.children.get(index)
    }

    /// Mutable contained entity at `index`.
    pub fn child_mut(&mut self, index: usize) -> Option<&mut Entity> {
        self.children.get_mut(index)
    }

    /// Slot of the contained entity named `name`.
    pub fn child_index(&self, name: StringId) -> Option<usize> {
        self.child_index_by_name.get(&name).copied()
    }

    /// Add a contained entity, returning its slot.
    pub fn add_child(
        &mut self,
        child: Entity,
        listener: Option<&mut dyn WriteListener>,
    ) -> Result<usize, EntityError> {
        let name_id = self.manager.pool().intern(&child.name);
        if self.child_index_by_name.contains_key(&name_id) {
            // The name reference from the failed intern must not leak.
            let name = child.name.clone();
            self.manager.pool().release(name_id);
            return Err(EntityError::DuplicateEntity(name));
        }
        let index = self.children.len();
        if let Some(listener) = listener {
            listener.log_create_entity(&child.name);
        }
        self.child_index_by_name.insert(name_id, index);
        self.children.push(child);
        tracing::trace!(container = %self.name, index, "entity added");
        Ok(index)
    }

    /// Remove the contained entity named `name`.
    ///
    /// The last slot is reassigned to the vacated one; returns the removed
    /// entity and, when a move happened, the slot pair `(from, to)` so
    /// query caches can follow.
    pub fn remove_child(
        &mut self,
        name: StringId,
        listener: Option<&mut dyn WriteListener>,
    ) -> Result<(Entity, Option<(usize, usize)>), EntityError> {
        let Some(index) = self.child_index_by_name.remove(&name) else {
            return Err(EntityError::NoSuchEntity(self.manager.pool().get(name)));
        };
        self.manager.pool().release(name);

        let removed = self.children.swap_remove(index);
        let moved = if index < self.children.len() {
            // The former last entity now occupies `index`.
            let moved_name = self.manager.pool().get_id(&self.children[index].name);
            if let Some(slot) = self.child_index_by_name.get_mut(&moved_name) {
                *slot = index;
            }
            Some((self.children.len(), index))
        } else {
            None
        };

        if let Some(listener) = listener {
            listener.log_destroy_entity(&removed.name);
        }
        tracing::trace!(container = %self.name, index, "entity removed");
        Ok((removed, moved))
    }
}

/// Replace every edge pointing at `target` with `replacement`.
fn repoint_child(manager: &mut NodeManager, root: NodeId, target: NodeId, replacement: NodeId) {
    let mut stack = vec![root];
    let mut visited = sable_sets::BitSet::new();
    while let Some(id) = stack.pop() {
        if !visited.insert(id.index()) {
            continue;
        }
        let node = manager.get(id);
        let ordered_hits: Vec<usize> = node
            .children()
            .iter()
            .enumerate()
            .filter_map(|(slot, &child)| (child == target).then_some(slot))
            .collect();
        let assoc_hits: Vec<StringId> = node
            .assoc()
            .map(|map| {
                map.iter()
                    .filter_map(|(&key, &child)| (child == target).then_some(key))
                    .collect()
            })
            .unwrap_or_default();
        stack.extend(node.child_ids().filter(|&c| c != target));

        for slot in ordered_hits {
            manager.replace_ordered_child(id, slot, replacement);
        }
        for key in assoc_hits {
            manager.replace_assoc_child(id, key, replacement);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sable_ir::default_pool;

    fn entity(name: &str) -> Entity {
        Entity::new(name, default_pool())
    }

    #[test]
    fn label_lookup_finds_tagged_nodes() {
        let mut e = entity("holder");
        e.set_root_from_source("(list #x 3 #y \"s\")", None).expect("parse");

        let pool = e.manager().pool().clone();
        let x = pool.get_id("x");
        let y = pool.get_id("y");
        assert_eq!(e.number_at_label(x), Some(3.0));
        let y_node = e.lookup_label(y).expect("y anchored");
        assert_eq!(e.manager().get(y_node).kind(), NodeKind::String);
        assert_eq!(e.lookup_label(pool.get_id("missing")), None);
    }

    #[test]
    fn set_value_at_label_updates_in_place() {
        let mut e = entity("holder");
        e.set_root_from_source("(list #x 3)", None).expect("parse");
        let pool = e.manager().pool().clone();
        let x = pool.get_id("x");

        let replacement = e.manager_mut().alloc_number(9.0);
        e.set_value_at_label(x, replacement, None).expect("write");
        assert_eq!(e.number_at_label(x), Some(9.0));
    }

    #[test]
    fn set_value_at_label_replaces_structured_values() {
        let mut e = entity("holder");
        e.set_root_from_source("(list #x 3 7)", None).expect("parse");
        let pool = e.manager().pool().clone();
        let x = pool.get_id("x");

        let replacement = {
            let m = e.manager_mut();
            let one = m.alloc_number(1.0);
            let two = m.alloc_number(2.0);
            m.alloc_list([one, two])
        };
        e.set_value_at_label(x, replacement, None).expect("write");

        let node = e.lookup_label(x).expect("still anchored");
        assert_eq!(e.manager().get(node).kind(), NodeKind::List);
        assert_eq!(e.manager().get(node).children().len(), 2);
    }

    #[test]
    fn unknown_label_write_is_an_error() {
        let mut e = entity("holder");
        e.set_root_from_source("(list 1)", None).expect("parse");
        let ghost = e.manager().pool().intern("ghost");
        let v = e.manager_mut().alloc_number(0.0);
        assert!(matches!(
            e.set_value_at_label(ghost, v, None),
            Err(EntityError::NoSuchEntity(_))
        ));
    }

    #[test]
    fn children_are_addressable_by_name_and_slot() {
        let mut container = entity("container");
        container.add_child(entity("a"), None).expect("add a");
        container.add_child(entity("b"), None).expect("add b");
        container.add_child(entity("c"), None).expect("add c");

        let pool = container.manager().pool().clone();
        assert_eq!(container.child_index(pool.get_id("b")), Some(1));
        assert!(matches!(
            container.add_child(entity("b"), None),
            Err(EntityError::DuplicateEntity(_))
        ));

        // Removal reassigns the last slot into the hole.
        let (removed, moved) = container.remove_child(pool.get_id("a"), None).expect("remove");
        assert_eq!(removed.name(), "a");
        assert_eq!(moved, Some((2, 0)));
        assert_eq!(container.child(0).map(Entity::name), Some("c"));
        assert_eq!(container.child_index(pool.get_id("c")), Some(0));
        assert_eq!(container.child_count(), 2);
    }

    #[test]
    fn permission_changes_require_a_privileged_grantor() {
        let mut e = entity("guarded");
        assert!(e.set_root_permission(true, false).is_err());
        assert!(!e.has_root_permission());
        e.set_root_permission(true, true).expect("granted");
        assert!(e.has_root_permission());
    }

    #[test]
    fn rand_state_round_trips_through_seed() {
        let mut a = entity("e");
        let mut b = entity("e");
        a.set_rand_seed("shared-seed", None);
        b.set_rand_seed("shared-seed", None);
        assert_eq!(a.rng_mut().rand_u32(), b.rng_mut().rand_u32());
    }

    #[test]
    fn uids_are_unique() {
        let a = entity("x");
        let b = entity("x");
        assert_ne!(a.uid(), b.uid());
    }
}
