//! Arena node manager.
//!
//! All nodes live in a manager-owned slab and are addressed by [`NodeId`].
//! The manager is the sole freer: handles never run destructors, freed slots
//! go on a free list for reuse, and a freed node's tag becomes
//! `Deallocated`. Reference cycles are legal in the graph; every traversal
//! that could revisit a node (copy, free, size, equality) memoises when the
//! root's `NEED_CYCLE_CHECK` bit says it must.

use crate::node::{Extended, LabelList, Payload};
use crate::{Node, NodeFlags, NodeId, NodeKind};
use rustc_hash::{FxHashMap, FxHashSet};
use sable_intern::{SharedPool, StringId};
use sable_sets::BitSet;
use smallvec::SmallVec;

/// Handle to a node, with advisory uniqueness bits.
///
/// `unique` means no other handle observes this subtree; `unique_top` means
/// the top node itself is only referenced by this handle. Both permit
/// in-place mutation without a copy. They are advisory: correctness never
/// depends on them, only copy avoidance does.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NodeRef {
    /// Arena handle.
    pub id: NodeId,
    /// No other handle observes this subtree.
    pub unique: bool,
    /// The top node is only referenced by this handle.
    pub unique_top: bool,
}

impl NodeRef {
    /// Handle to a freshly built, unshared subtree.
    #[inline]
    pub fn new_unique(id: NodeId) -> Self {
        NodeRef {
            id,
            unique: true,
            unique_top: true,
        }
    }

    /// Handle to a subtree that other handles may also observe.
    #[inline]
    pub fn shared(id: NodeId) -> Self {
        NodeRef {
            id,
            unique: false,
            unique_top: false,
        }
    }
}

/// What `deep_alloc_copy` does with labels and comments.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MetadataPolicy {
    /// Copy labels and comments.
    KeepAll,
    /// Copy comments, drop labels. Dropping labels can restore idempotency.
    DropLabels,
    /// Drop labels and comments.
    DropAll,
}

/// Bulk allocator and owner of evaluable nodes.
pub struct NodeManager {
    nodes: Vec<Node>,
    free_list: Vec<NodeId>,
    pool: SharedPool,
}

impl NodeManager {
    /// New manager sharing the given string pool.
    pub fn new(pool: SharedPool) -> Self {
        NodeManager {
            nodes: Vec::new(),
            free_list: Vec::new(),
            pool,
        }
    }

    /// The string pool this manager charges string references to.
    #[inline]
    pub fn pool(&self) -> &SharedPool {
        &self.pool
    }

    /// Nodes currently allocated (live).
    pub fn live_count(&self) -> usize {
        self.nodes.len() - self.free_list.len()
    }

    /// Total slots ever allocated, live or free.
    pub fn slot_count(&self) -> usize {
        self.nodes.len()
    }

    /// Borrow a node. Accessing a deallocated node is a defect.
    #[inline]
    #[track_caller]
    pub fn get(&self, id: NodeId) -> &Node {
        let node = &self.nodes[id.index()];
        debug_assert!(!node.is_deallocated(), "access to deallocated {id:?}");
        node
    }

    #[inline]
    #[track_caller]
    pub(crate) fn get_mut(&mut self, id: NodeId) -> &mut Node {
        let node = &mut self.nodes[id.index()];
        debug_assert!(!node.is_deallocated(), "access to deallocated {id:?}");
        node
    }

    fn alloc_slot(&mut self, node: Node) -> NodeId {
        match self.free_list.pop() {
            Some(id) => {
                self.nodes[id.index()] = node;
                id
            }
            None => {
                let id = NodeId::from_raw(self.nodes.len() as u32);
                self.nodes.push(node);
                id
            }
        }
    }

    /// Allocate a node of `kind` with its default payload.
    pub fn alloc(&mut self, kind: NodeKind) -> NodeRef {
        let payload = Node::default_payload(kind);
        NodeRef::new_unique(self.alloc_slot(Node::new(kind, payload)))
    }

    /// Allocate a null node.
    pub fn alloc_null(&mut self) -> NodeRef {
        self.alloc(NodeKind::Null)
    }

    /// Allocate a boolean node.
    pub fn alloc_bool(&mut self, value: bool) -> NodeRef {
        NodeRef::new_unique(self.alloc_slot(Node::new(NodeKind::Bool, Payload::Bool(value))))
    }

    /// Allocate a number node.
    pub fn alloc_number(&mut self, value: f64) -> NodeRef {
        NodeRef::new_unique(self.alloc_slot(Node::new(NodeKind::Number, Payload::Number(value))))
    }

    /// Allocate a string node, interning its text.
    pub fn alloc_string(&mut self, text: &str) -> NodeRef {
        let id = self.pool.intern(text);
        NodeRef::new_unique(self.alloc_slot(Node::new(NodeKind::String, Payload::Str(id))))
    }

    /// Allocate a string node from an ID, creating a new reference.
    pub fn alloc_string_id(&mut self, id: StringId) -> NodeRef {
        self.pool.intern_id(id);
        NodeRef::new_unique(self.alloc_slot(Node::new(NodeKind::String, Payload::Str(id))))
    }

    /// Allocate a symbol node, interning its name.
    pub fn alloc_symbol(&mut self, name: &str) -> NodeRef {
        let id = self.pool.intern(name);
        NodeRef::new_unique(self.alloc_slot(Node::new(NodeKind::Symbol, Payload::Str(id))))
    }

    /// Allocate a list node over children this caller owns.
    pub fn alloc_list(&mut self, children: impl IntoIterator<Item = NodeRef>) -> NodeRef {
        self.alloc_opcode(NodeKind::List, children)
    }

    /// Allocate an ordered-children node of any opcode kind.
    pub fn alloc_opcode(
        &mut self,
        kind: NodeKind,
        children: impl IntoIterator<Item = NodeRef>,
    ) -> NodeRef {
        debug_assert!(kind.uses_ordered_children());
        let parent = self.alloc(kind);
        for child in children {
            self.add_child(parent.id, child);
        }
        parent
    }

    /// Allocate an assoc node from `(key, child)` pairs, interning keys.
    pub fn alloc_assoc<'k>(
        &mut self,
        entries: impl IntoIterator<Item = (&'k str, NodeRef)>,
    ) -> NodeRef {
        let parent = self.alloc(NodeKind::Assoc);
        for (key, child) in entries {
            let key_id = self.pool.intern(key);
            self.set_assoc_child(parent.id, key_id, child);
        }
        parent
    }

    /// Append `child` to `parent`'s ordered children, propagating the
    /// child's invariant bits upward: a cycle-checked child makes the parent
    /// cycle-checked, a non-idempotent child makes the parent
    /// non-idempotent. A non-unique child additionally marks the whole
    /// attachment as multiply reachable.
    pub fn add_child(&mut self, parent: NodeId, child: NodeRef) {
        if !child.unique {
            self.get_mut(child.id).flags_mut().insert(NodeFlags::NEED_CYCLE_CHECK);
        }
        let (child_cycle, child_idempotent) = {
            let c = self.get(child.id);
            (c.needs_cycle_check(), c.is_idempotent())
        };
        let parent_node = self.get_mut(parent);
        parent_node.ordered_mut().push(child.id);
        if child_cycle {
            parent_node.flags_mut().insert(NodeFlags::NEED_CYCLE_CHECK);
        }
        if !child_idempotent {
            parent_node.flags_mut().remove(NodeFlags::IDEMPOTENT);
        }
    }

    /// Map `key` to `child` in `parent`'s assoc payload. The key reference
    /// is handed off from the caller. Replacing an existing binding returns
    /// the previous child.
    pub fn set_assoc_child(
        &mut self,
        parent: NodeId,
        key: StringId,
        child: NodeRef,
    ) -> Option<NodeId> {
        if !child.unique {
            self.get_mut(child.id).flags_mut().insert(NodeFlags::NEED_CYCLE_CHECK);
        }
        let (child_cycle, child_idempotent) = {
            let c = self.get(child.id);
            (c.needs_cycle_check(), c.is_idempotent())
        };
        let parent_node = self.get_mut(parent);
        let previous = parent_node.assoc_mut().insert(key, child.id);
        if previous.is_some() {
            // Two references to the key were held; drop the replaced one.
            self.pool.release(key);
        }
        let parent_node = self.get_mut(parent);
        if child_cycle {
            parent_node.flags_mut().insert(NodeFlags::NEED_CYCLE_CHECK);
        }
        if !child_idempotent {
            parent_node.flags_mut().remove(NodeFlags::IDEMPOTENT);
        }
        previous
    }

    /// Remove the ordered child at `index`, returning it.
    ///
    /// Detaching never clears the parent's cycle-check bit — the bit is
    /// monotonic until the next collection pass.
    pub fn remove_child(&mut self, parent: NodeId, index: usize) -> Option<NodeId> {
        let children = self.get_mut(parent).ordered_mut();
        if index >= children.len() {
            return None;
        }
        Some(children.remove(index))
    }

    /// Re-point the ordered child slot at `index` to `replacement`,
    /// returning the node formerly there.
    pub fn replace_ordered_child(
        &mut self,
        parent: NodeId,
        index: usize,
        replacement: NodeId,
    ) -> Option<NodeId> {
        let children = self.get_mut(parent).ordered_mut();
        let slot = children.get_mut(index)?;
        Some(std::mem::replace(slot, replacement))
    }

    /// Re-point an existing assoc binding to `replacement`, returning the
    /// node formerly bound. The key's reference count is untouched.
    pub fn replace_assoc_child(
        &mut self,
        parent: NodeId,
        key: StringId,
        replacement: NodeId,
    ) -> Option<NodeId> {
        let map = self.get_mut(parent).assoc_mut();
        let slot = map.get_mut(&key)?;
        Some(std::mem::replace(slot, replacement))
    }

    /// Attach a label, interning its text.
    pub fn add_label(&mut self, id: NodeId, label: &str) {
        let label_id = self.pool.intern(label);
        self.get_mut(id).push_label(label_id);
    }

    /// Attach a label by ID, creating a new reference.
    pub fn add_label_id(&mut self, id: NodeId, label: StringId) {
        self.pool.intern_id(label);
        self.get_mut(id).push_label(label);
    }

    /// Set the comment, interning its text and releasing any previous one.
    pub fn set_comment(&mut self, id: NodeId, comment: &str) {
        let comment_id = self.pool.intern(comment);
        let previous = self.get_mut(id).set_comment(comment_id);
        if previous.is_string() {
            self.pool.release(previous);
        }
    }

    /// Set or clear the concurrency hint.
    pub fn set_concurrent(&mut self, id: NodeId, concurrent: bool) {
        self.get_mut(id).set_concurrent(concurrent);
    }

    /// Overwrite a number node's value in place.
    pub fn set_number(&mut self, id: NodeId, value: f64) {
        debug_assert_eq!(self.get(id).kind(), NodeKind::Number);
        self.get_mut(id).set_number(value);
    }

    // -- Deep copy --

    /// Structural copy of the subtree at `src`.
    ///
    /// Terminates on cyclic graphs by memoising source→destination when the
    /// source is cycle-checked; the copy then reproduces the sharing of the
    /// source. String references owned by copied nodes are re-counted.
    pub fn deep_alloc_copy(&mut self, src: NodeId, policy: MetadataPolicy) -> NodeRef {
        let mut memo = if self.get(src).needs_cycle_check() {
            Some(FxHashMap::default())
        } else {
            None
        };
        let id = self.copy_rec(src, policy, &mut memo);
        NodeRef::new_unique(id)
    }

    fn copy_rec(
        &mut self,
        src: NodeId,
        policy: MetadataPolicy,
        memo: &mut Option<FxHashMap<NodeId, NodeId>>,
    ) -> NodeId {
        if let Some(map) = memo.as_ref() {
            if let Some(&dst) = map.get(&src) {
                return dst;
            }
        }

        let source = self.nodes[src.index()].clone();

        // Allocate the destination shell before copying children so that a
        // cycle back to `src` resolves through the memo.
        let mut shell = Node::new(source.kind(), Node::default_payload(source.kind()));
        *shell.flags_mut() = source.flags();
        let dst = self.alloc_slot(shell);
        if let Some(map) = memo.as_mut() {
            map.insert(src, dst);
        }

        match source_base(&source) {
            Payload::Bool(b) => self.get_mut(dst).set_bool(*b),
            Payload::Number(n) => self.get_mut(dst).set_number(*n),
            Payload::Str(s) => {
                self.pool.intern_id(*s);
                self.get_mut(dst).set_string_id(*s);
            }
            Payload::Ordered(children) => {
                for &child in children {
                    let copied = self.copy_rec(child, policy, memo);
                    self.get_mut(dst).ordered_mut().push(copied);
                }
            }
            Payload::Assoc(map) => {
                for (&key, &child) in map {
                    self.pool.intern_id(key);
                    let copied = self.copy_rec(child, policy, memo);
                    self.get_mut(dst).assoc_mut().insert(key, copied);
                }
            }
            Payload::Empty | Payload::Extended(_) => {}
        }

        let (labels, comment) = metadata_to_copy(&source, policy);
        if !labels.is_empty() {
            self.pool.intern_ids(labels.iter().copied());
            for label in labels {
                self.get_mut(dst).push_label(label);
            }
        } else if policy != MetadataPolicy::KeepAll {
            // Labels were dropped: the copy may be idempotent again.
            let restore = source.kind().is_potentially_idempotent()
                && self
                    .get(dst)
                    .child_ids()
                    .all(|c| self.nodes[c.index()].is_idempotent());
            if restore {
                self.get_mut(dst).flags_mut().insert(NodeFlags::IDEMPOTENT);
            }
        }
        if comment.is_string() {
            self.pool.intern_id(comment);
            self.get_mut(dst).set_comment(comment);
        }

        dst
    }

    /// Return `handle` if it is safe to mutate in place, otherwise a deep
    /// copy that is.
    pub fn ensure_modifiable(&mut self, handle: NodeRef) -> NodeRef {
        if handle.unique {
            handle
        } else {
            self.deep_alloc_copy(handle.id, MetadataPolicy::KeepAll)
        }
    }

    // -- Freeing --

    /// Free the subtree only when the handle vouches no other reference
    /// observes it.
    pub fn free_tree_if_possible(&mut self, handle: NodeRef) {
        if handle.unique {
            self.free_tree(handle.id);
        }
    }

    /// Free the subtree at `root`.
    ///
    /// A tree known free of shared reachability is freed recursively, each
    /// child slot walked exactly once; otherwise reachability is collected
    /// into a mark set whose lifetime is this call.
    pub fn free_tree(&mut self, root: NodeId) {
        if self.get(root).needs_cycle_check() {
            let mut reached = BitSet::new();
            self.collect_reachable(root, &mut reached);
            for index in reached.iter() {
                self.free_node(NodeId::from_raw(index as u32));
            }
        } else {
            let mut stack: Vec<NodeId> = vec![root];
            while let Some(id) = stack.pop() {
                let children = self.free_node(id);
                stack.extend(children);
            }
        }
    }

    /// Free a single node: release owned string references, set the
    /// `Deallocated` tag, push the slot on the free list. Returns the
    /// former children.
    fn free_node(&mut self, id: NodeId) -> SmallVec<[NodeId; 8]> {
        let node = &mut self.nodes[id.index()];
        debug_assert!(!node.is_deallocated(), "double free of {id:?}");

        let payload = node.take_payload();
        node.set_kind(NodeKind::Deallocated);
        *node.flags_mut() = NodeFlags::empty();
        self.free_list.push(id);

        let mut strings: SmallVec<[StringId; 4]> = SmallVec::new();
        let mut children: SmallVec<[NodeId; 8]> = SmallVec::new();
        collect_owned(payload, &mut strings, &mut children);
        if !strings.is_empty() {
            self.pool.release_ids(strings.iter().copied());
        }
        children
    }

    fn collect_reachable(&self, root: NodeId, reached: &mut BitSet) {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if self.nodes[id.index()].is_deallocated() {
                continue;
            }
            if !reached.insert(id.index()) {
                continue;
            }
            stack.extend(self.nodes[id.index()].child_ids());
        }
    }

    // -- Garbage collection --

    /// Mark-sweep over the whole arena from `roots`.
    ///
    /// Unreached nodes are freed. Reached nodes get their cycle-check bit
    /// recomputed: set exactly when the node is reachable through more than
    /// one path or some descendant is.
    pub fn collect(&mut self, roots: &[NodeId]) {
        let len = self.nodes.len();
        let mut reach_counts = vec![0u32; len];
        for &root in roots {
            self.count_reaches(root, &mut reach_counts);
        }

        let mut freed = 0usize;
        for index in 0..len {
            if reach_counts[index] == 0 && !self.nodes[index].is_deallocated() {
                self.free_node(NodeId::from_raw(index as u32));
                freed += 1;
            }
        }

        let mut state = vec![0u8; len];
        let mut flagged = vec![false; len];
        for &root in roots {
            self.compute_cycle_flag(root, &reach_counts, &mut state, &mut flagged);
        }
        for (index, &is_flagged) in flagged.iter().enumerate() {
            if reach_counts[index] > 0 {
                self.nodes[index]
                    .flags_mut()
                    .set(NodeFlags::NEED_CYCLE_CHECK, is_flagged);
            }
        }

        tracing::debug!(freed, live = self.live_count(), "mark-sweep pass");
    }

    fn count_reaches(&self, root: NodeId, counts: &mut [u32]) {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if self.nodes[id.index()].is_deallocated() {
                continue;
            }
            counts[id.index()] += 1;
            if counts[id.index()] == 1 {
                stack.extend(self.nodes[id.index()].child_ids());
            }
        }
    }

    fn compute_cycle_flag(
        &self,
        id: NodeId,
        counts: &[u32],
        state: &mut [u8],
        flagged: &mut [bool],
    ) -> bool {
        match state[id.index()] {
            2 => return flagged[id.index()],
            // Re-entry while computing: we are on a cycle.
            1 => return true,
            _ => {}
        }
        state[id.index()] = 1;
        let mut result = counts[id.index()] > 1;
        let children: SmallVec<[NodeId; 8]> = self.nodes[id.index()].child_ids().collect();
        for child in children {
            result |= self.compute_cycle_flag(child, counts, state, flagged);
        }
        state[id.index()] = 2;
        flagged[id.index()] = result;
        result
    }

    // -- Structural measures --

    /// Number of nodes in the subtree, counting shared nodes once.
    pub fn deep_size(&self, root: NodeId) -> usize {
        let mut reached = BitSet::new();
        self.collect_reachable(root, &mut reached);
        reached.len()
    }

    /// Structural equality: kinds, payloads, and children, ignoring labels
    /// and comments. NaN numbers compare by bit identity. Tolerates cycles
    /// by assuming equality on revisit.
    pub fn deep_equal(&self, a: NodeId, b: NodeId) -> bool {
        let needs_memo =
            self.get(a).needs_cycle_check() || self.get(b).needs_cycle_check();
        let mut memo: Option<FxHashSet<(NodeId, NodeId)>> =
            if needs_memo { Some(FxHashSet::default()) } else { None };
        self.deep_equal_rec(a, b, &mut memo)
    }

    fn deep_equal_rec(
        &self,
        a: NodeId,
        b: NodeId,
        memo: &mut Option<FxHashSet<(NodeId, NodeId)>>,
    ) -> bool {
        if a == b {
            return true;
        }
        if let Some(set) = memo.as_mut() {
            if !set.insert((a, b)) {
                return true;
            }
        }
        let na = &self.nodes[a.index()];
        let nb = &self.nodes[b.index()];
        if na.kind() != nb.kind() {
            return false;
        }
        match (na.kind().is_immediate(), na.kind().uses_assoc()) {
            (true, _) => match na.kind() {
                NodeKind::Number => {
                    let (x, y) = (na.number_value(), nb.number_value());
                    match (x, y) {
                        (Some(x), Some(y)) => x.to_bits() == y.to_bits(),
                        _ => x == y,
                    }
                }
                NodeKind::Bool => na.bool_value() == nb.bool_value(),
                NodeKind::String | NodeKind::Symbol => na.string_id() == nb.string_id(),
                _ => true, // null
            },
            (_, true) => {
                let (Some(ma), Some(mb)) = (na.assoc(), nb.assoc()) else {
                    return false;
                };
                if ma.len() != mb.len() {
                    return false;
                }
                ma.iter().all(|(key, &va)| {
                    mb.get(key).is_some_and(|&vb| self.deep_equal_rec(va, vb, memo))
                })
            }
            _ => {
                let ca = na.children();
                let cb = nb.children();
                ca.len() == cb.len()
                    && ca
                        .iter()
                        .zip(cb)
                        .all(|(&x, &y)| self.deep_equal_rec(x, y, memo))
            }
        }
    }
}

fn source_base(node: &Node) -> &Payload {
    node.raw_base()
}

fn metadata_to_copy(node: &Node, policy: MetadataPolicy) -> (LabelList, StringId) {
    match policy {
        MetadataPolicy::KeepAll => (
            node.labels().iter().copied().collect(),
            node.comment(),
        ),
        MetadataPolicy::DropLabels => (LabelList::new(), node.comment()),
        MetadataPolicy::DropAll => (LabelList::new(), StringId::NOT_A_STRING),
    }
}

fn collect_owned(
    payload: Payload,
    strings: &mut SmallVec<[StringId; 4]>,
    children: &mut SmallVec<[NodeId; 8]>,
) {
    match payload {
        Payload::Str(s) => strings.push(s),
        Payload::Ordered(ids) => children.extend(ids),
        Payload::Assoc(map) => {
            for (key, child) in map {
                strings.push(key);
                children.push(child);
            }
        }
        Payload::Extended(ext) => {
            let Extended {
                base,
                labels,
                comment,
            } = *ext;
            collect_owned(base, strings, children);
            strings.extend(labels);
            if comment.is_string() {
                strings.push(comment);
            }
        }
        Payload::Empty | Payload::Bool(_) | Payload::Number(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn manager() -> NodeManager {
        NodeManager::new(SharedPool::default())
    }

    #[test]
    fn alloc_and_reuse_slots() {
        let mut m = manager();
        let a = m.alloc_number(1.0);
        let b = m.alloc_number(2.0);
        assert_eq!(m.live_count(), 2);

        m.free_tree(a.id);
        assert_eq!(m.live_count(), 1);

        // Freed slot is reused, not grown past.
        let c = m.alloc_number(3.0);
        assert_eq!(c.id, a.id);
        assert_eq!(m.get(c.id).number_value(), Some(3.0));
        assert_eq!(m.get(b.id).number_value(), Some(2.0));
    }

    #[test]
    fn freeing_releases_string_references() {
        let m = SharedPool::default();
        let mut mgr = NodeManager::new(m.clone());
        let s = mgr.alloc_string("transient");
        let sid = mgr.get(s.id).string_id().expect("string payload");
        assert_eq!(m.get(sid), "transient");

        mgr.free_tree(s.id);
        assert_eq!(m.get_id("transient"), StringId::NOT_A_STRING);
    }

    #[test]
    fn idempotency_propagates_through_construction() {
        let mut m = manager();
        let pure = m.alloc_number(1.0);
        let list = m.alloc_list([pure]);
        assert!(m.get(list.id).is_idempotent());

        // A side-effecting child makes the parent non-idempotent.
        let rand = m.alloc(NodeKind::Rand);
        let one = m.alloc_number(1.0);
        let list2 = m.alloc_list([one, rand]);
        assert!(!m.get(list2.id).is_idempotent());

        // A labelled child does too.
        let labelled = m.alloc_number(2.0);
        m.add_label(labelled.id, "anchor");
        assert!(!m.get(labelled.id).is_idempotent());
        let list3 = m.alloc_list([labelled]);
        assert!(!m.get(list3.id).is_idempotent());
    }

    #[test]
    fn cycle_check_propagates_to_ancestors() {
        let mut m = manager();
        let inner = m.alloc_number(1.0);
        let shared = m.alloc_list([inner]);
        let outer = m.alloc(NodeKind::List);

        // Attaching a non-unique handle marks the child and the parent.
        m.add_child(outer.id, NodeRef::shared(shared.id));
        assert!(m.get(shared.id).needs_cycle_check());
        assert!(m.get(outer.id).needs_cycle_check());

        // The bit travels upward when the flagged subtree is attached.
        let wrapper = m.alloc(NodeKind::List);
        m.add_child(wrapper.id, NodeRef::new_unique(outer.id));
        assert!(m.get(wrapper.id).needs_cycle_check());
    }

    #[test]
    fn deep_copy_of_plain_tree() {
        let mut m = manager();
        let child = m.alloc_string("leaf");
        let seven = m.alloc_number(7.0);
        let original = m.alloc_list([child, seven]);
        m.add_label(original.id, "tagged");

        let copy = m.deep_alloc_copy(original.id, MetadataPolicy::KeepAll);
        assert_ne!(copy.id, original.id);
        assert!(m.deep_equal(copy.id, original.id));
        assert_eq!(m.get(copy.id).labels(), m.get(original.id).labels());

        // Copies share no nodes with the source.
        let copy_children = m.get(copy.id).children().to_vec();
        let orig_children = m.get(original.id).children().to_vec();
        for c in &copy_children {
            assert!(!orig_children.contains(c));
        }
    }

    #[test]
    fn deep_copy_terminates_on_cycles() {
        let mut m = manager();
        // A -> B -> A, as two assigns would build it.
        let a = m.alloc(NodeKind::List);
        let b = m.alloc(NodeKind::List);
        m.add_child(a.id, NodeRef::shared(b.id));
        m.add_child(b.id, NodeRef::shared(a.id));
        assert!(m.get(a.id).needs_cycle_check());

        let copy = m.deep_alloc_copy(a.id, MetadataPolicy::KeepAll);
        let a2 = copy.id;
        let b2 = m.get(a2).children()[0];
        let back = m.get(b2).children()[0];

        // Copy reproduces the cycle with no nodes shared with the source.
        assert_eq!(back, a2);
        assert_ne!(a2, a.id);
        assert_ne!(b2, b.id);
    }

    #[test]
    fn drop_labels_policy_restores_idempotency() {
        let mut m = manager();
        let n = m.alloc_number(3.0);
        m.add_label(n.id, "x");
        assert!(!m.get(n.id).is_idempotent());

        let stripped = m.deep_alloc_copy(n.id, MetadataPolicy::DropLabels);
        assert!(m.get(stripped.id).labels().is_empty());
        assert!(m.get(stripped.id).is_idempotent());
    }

    #[test]
    fn ensure_modifiable_copies_only_shared_handles() {
        let mut m = manager();
        let n = m.alloc_number(8.0);
        let same = m.ensure_modifiable(n);
        assert_eq!(same.id, n.id);

        let copied = m.ensure_modifiable(NodeRef::shared(n.id));
        assert_ne!(copied.id, n.id);
        assert_eq!(m.get(copied.id).number_value(), Some(8.0));
    }

    #[test]
    fn free_tree_handles_cycles() {
        let mut m = manager();
        let a = m.alloc(NodeKind::List);
        let b = m.alloc(NodeKind::List);
        m.add_child(a.id, NodeRef::shared(b.id));
        m.add_child(b.id, NodeRef::shared(a.id));

        m.free_tree(a.id);
        assert_eq!(m.live_count(), 0);
    }

    #[test]
    fn collect_frees_unreachable_and_resets_cycle_bits() {
        let mut m = manager();
        let keep_n = m.alloc_number(1.0);
        let keep = m.alloc_list([keep_n]);
        let lose_n = m.alloc_number(2.0);
        let lose = m.alloc_list([lose_n]);

        // A diamond: two paths to the same leaf force the cycle bit on.
        let leaf = m.alloc_number(9.0);
        let left = m.alloc_list([NodeRef::shared(leaf.id)]);
        let right = m.alloc_list([NodeRef::shared(leaf.id)]);
        let diamond = m.alloc_list([left, right]);
        assert!(m.get(diamond.id).needs_cycle_check());

        m.collect(&[keep.id, diamond.id]);

        // `lose` and its child were swept.
        assert_eq!(
            m.live_count(),
            2 + 4, // keep + its leaf, diamond + two arms + shared leaf
        );
        let _ = lose;

        // Diamond still multiply reaches the leaf: bits stay set.
        assert!(m.get(diamond.id).needs_cycle_check());

        // Break the sharing; a new pass clears the bits.
        m.remove_child(right.id, 0);
        m.collect(&[keep.id, diamond.id]);
        assert!(!m.get(diamond.id).needs_cycle_check());
        assert!(!m.get(left.id).needs_cycle_check());
    }

    #[test]
    fn deep_size_counts_shared_nodes_once() {
        let mut m = manager();
        let leaf = m.alloc_number(1.0);
        let left = m.alloc_list([NodeRef::shared(leaf.id)]);
        let right = m.alloc_list([NodeRef::shared(leaf.id)]);
        let top = m.alloc_list([left, right]);
        assert_eq!(m.deep_size(top.id), 4);
    }

    #[test]
    fn deep_equal_compares_structure_and_nan_bits() {
        let mut m = manager();
        let a_nan = m.alloc_number(f64::NAN);
        let a_s = m.alloc_string("s");
        let a = m.alloc_list([a_nan, a_s]);
        let b_nan = m.alloc_number(f64::NAN);
        let b_s = m.alloc_string("s");
        let b = m.alloc_list([b_nan, b_s]);
        let c_n = m.alloc_number(0.0);
        let c_s = m.alloc_string("s");
        let c = m.alloc_list([c_n, c_s]);
        assert!(m.deep_equal(a.id, b.id));
        assert!(!m.deep_equal(a.id, c.id));
    }
}
