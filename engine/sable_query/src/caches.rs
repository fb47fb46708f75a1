//! Query caches: the column indices attached to one container entity.
//!
//! Columns are built lazily: the first condition touching a label walks the
//! container's children once and populates that label's column. Mutation
//! hooks keep exactly the affected columns current afterwards. A registry
//! maps container identity to its caches behind a reader-writer lock, read
//! by queries and written only when a container gains caches.

use crate::column::ColumnData;
use crate::value::{column_value, ColumnValue};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use sable_entity::Entity;
use sable_intern::StringId;
use std::sync::Arc;

/// Column indices for one container.
pub struct QueryCaches {
    container_uid: u64,
    columns: FxHashMap<StringId, ColumnData>,
}

impl QueryCaches {
    /// Empty caches for `container`.
    pub fn new(container: &Entity) -> Self {
        QueryCaches {
            container_uid: container.uid(),
            columns: FxHashMap::default(),
        }
    }

    /// Identity of the container these caches index.
    pub fn container_uid(&self) -> u64 {
        self.container_uid
    }

    /// Column for `label`, if already built.
    pub fn column(&self, label: StringId) -> Option<&ColumnData> {
        self.columns.get(&label)
    }

    /// Column for `label`, building it from the container's children on
    /// first use.
    pub fn ensure_column(&mut self, container: &Entity, label: StringId) -> &ColumnData {
        debug_assert_eq!(container.uid(), self.container_uid);
        self.columns.entry(label).or_insert_with(|| {
            tracing::debug!(
                container = container.name(),
                label = %container.manager().pool().get(label),
                children = container.child_count(),
                "populating column"
            );
            let mut column = ColumnData::new(label, container.manager().pool().clone());
            for (index, child) in container.children().iter().enumerate() {
                let value = column_value(child, label);
                column.insert(index, &value);
            }
            column
        })
    }

    // -- Mutation hooks --

    /// A child was appended at `index`.
    pub fn add_entity(&mut self, container: &Entity, index: usize) {
        let Some(child) = container.child(index) else {
            return;
        };
        for (&label, column) in &mut self.columns {
            let value = column_value(child, label);
            column.insert(index, &value);
        }
    }

    /// The child at `removed_index` was removed with `old_values` — the
    /// values it held per built column — and, when `moved` is set, the
    /// former last child moved from slot `moved.0` to `moved.1`.
    pub fn remove_entity(
        &mut self,
        container: &Entity,
        removed_index: usize,
        old_values: &FxHashMap<StringId, ColumnValue>,
        moved: Option<(usize, usize)>,
    ) {
        for (&label, column) in &mut self.columns {
            if let Some(old) = old_values.get(&label) {
                column.erase(removed_index, old);
            }
            if let Some((from, to)) = moved {
                let moved_child = container.child(to);
                if let Some(child) = moved_child {
                    let value = column_value(child, label);
                    column.reassign_slot(from, to, &value);
                }
            }
        }
    }

    /// One label of the child at `index` changed from `old` to its current
    /// value.
    pub fn label_changed(
        &mut self,
        container: &Entity,
        index: usize,
        label: StringId,
        old: &ColumnValue,
    ) {
        let Some(child) = container.child(index) else {
            return;
        };
        if let Some(column) = self.columns.get_mut(&label) {
            let new = column_value(child, label);
            column.update(index, old, &new);
        }
    }

    /// The whole label set of the child at `index` may have changed;
    /// `old_values` holds its former value per built column.
    pub fn labels_updated(
        &mut self,
        container: &Entity,
        index: usize,
        old_values: &FxHashMap<StringId, ColumnValue>,
    ) {
        let Some(child) = container.child(index) else {
            return;
        };
        for (&label, column) in &mut self.columns {
            let old = old_values.get(&label).copied().unwrap_or(ColumnValue::NotExist);
            let new = column_value(child, label);
            column.update(index, &old, &new);
        }
    }

    /// Snapshot the values the child at `index` currently holds for every
    /// built column; feed this to the removal and update hooks.
    pub fn snapshot_values(
        &self,
        container: &Entity,
        index: usize,
    ) -> FxHashMap<StringId, ColumnValue> {
        let mut out = FxHashMap::default();
        let Some(child) = container.child(index) else {
            return out;
        };
        for &label in self.columns.keys() {
            out.insert(label, column_value(child, label));
        }
        out
    }
}

/// Process-wide registry of per-container caches.
#[derive(Default)]
pub struct CacheRegistry {
    caches: RwLock<FxHashMap<u64, Arc<RwLock<QueryCaches>>>>,
}

impl CacheRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        CacheRegistry::default()
    }

    /// The caches for `container`, created on first use.
    pub fn for_container(&self, container: &Entity) -> Arc<RwLock<QueryCaches>> {
        if let Some(found) = self.caches.read().get(&container.uid()) {
            return Arc::clone(found);
        }
        let mut writable = self.caches.write();
        Arc::clone(
            writable
                .entry(container.uid())
                .or_insert_with(|| Arc::new(RwLock::new(QueryCaches::new(container)))),
        )
    }

    /// Drop the caches for a destroyed container.
    pub fn forget(&self, container_uid: u64) {
        self.caches.write().remove(&container_uid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sable_ir::default_pool;
    use sable_sets::BitSet;

    fn container_with(values: &[f64]) -> Entity {
        let pool = default_pool();
        let mut container = Entity::new("container", pool.clone());
        for (index, value) in values.iter().enumerate() {
            let mut child = Entity::new(&format!("e{index}"), pool.clone());
            child
                .set_root_from_source(&format!("(list #x {value})"), None)
                .expect("child root");
            container.add_child(child, None).expect("add child");
        }
        container
    }

    fn range_ids(caches: &mut QueryCaches, container: &Entity, lo: f64, hi: f64) -> Vec<usize> {
        let label = container.manager().pool().get_id("x");
        let column = caches.ensure_column(container, label);
        let mut out = BitSet::new();
        column.find_within_range(
            &ColumnValue::Number(lo),
            &ColumnValue::Number(hi),
            true,
            &mut out,
        );
        out.iter().collect()
    }

    #[test]
    fn lazy_population_and_query() {
        let container = container_with(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        let mut caches = QueryCaches::new(&container);
        assert!(caches.column(container.manager().pool().get_id("x")).is_none());
        assert_eq!(range_ids(&mut caches, &container, 2.0, 4.0), vec![1, 2, 3]);
    }

    #[test]
    fn add_entity_updates_built_columns() {
        let mut container = container_with(&[1.0, 2.0]);
        let mut caches = QueryCaches::new(&container);
        range_ids(&mut caches, &container, 0.0, 10.0);

        let pool = container.manager().pool().clone();
        let mut child = Entity::new("e2", pool.clone());
        child.set_root_from_source("(list #x 7)", None).expect("root");
        let index = container.add_child(child, None).expect("add");
        caches.add_entity(&container, index);

        assert_eq!(range_ids(&mut caches, &container, 6.0, 8.0), vec![2]);
    }

    #[test]
    fn remove_entity_reassigns_the_moved_slot() {
        let mut container = container_with(&[1.0, 2.0, 3.0]);
        let mut caches = QueryCaches::new(&container);
        range_ids(&mut caches, &container, 0.0, 10.0);

        let pool = container.manager().pool().clone();
        let victim = pool.get_id("e0");
        let victim_index = container.child_index(victim).expect("slot");
        let old_values = caches.snapshot_values(&container, victim_index);
        let (_, moved) = container.remove_child(victim, None).expect("remove");
        caches.remove_entity(&container, victim_index, &old_values, moved);

        // e2 (value 3) now sits in slot 0; e1 (value 2) stays in slot 1.
        assert_eq!(range_ids(&mut caches, &container, 2.5, 3.5), vec![0]);
        assert_eq!(range_ids(&mut caches, &container, 1.5, 2.5), vec![1]);
    }

    #[test]
    fn label_changed_updates_one_column() {
        let mut container = container_with(&[1.0, 2.0]);
        let mut caches = QueryCaches::new(&container);
        range_ids(&mut caches, &container, 0.0, 10.0);

        let pool = container.manager().pool().clone();
        let x = pool.get_id("x");
        let old = ColumnValue::Number(2.0);
        {
            let child = container.child_mut(1).expect("child");
            let nine = child.manager_mut().alloc_number(9.0);
            child.set_value_at_label(x, nine, None).expect("write");
        }
        caches.label_changed(&container, 1, x, &old);

        assert_eq!(range_ids(&mut caches, &container, 8.0, 10.0), vec![1]);
        assert_eq!(range_ids(&mut caches, &container, 1.5, 2.5), Vec::<usize>::new());
    }

    #[test]
    fn column_view_agrees_with_entity_lookup() {
        let container = container_with(&[4.0, 8.0, 15.0]);
        let mut caches = QueryCaches::new(&container);
        let label = container.manager().pool().get_id("x");
        let column = caches.ensure_column(&container, label);

        for (index, child) in container.children().iter().enumerate() {
            assert_eq!(column.number_value(index), child.number_at_label(label));
        }
    }

    #[test]
    fn registry_hands_out_one_cache_per_container() {
        let registry = CacheRegistry::new();
        let container = container_with(&[1.0]);
        let first = registry.for_container(&container);
        let second = registry.for_container(&container);
        assert!(Arc::ptr_eq(&first, &second));

        registry.forget(container.uid());
        let third = registry.for_container(&container);
        assert!(!Arc::ptr_eq(&first, &third));
    }
}
