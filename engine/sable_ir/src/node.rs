//! The evaluable node: tagged value plus optional metadata.
//!
//! A node with no labels, no comment, and no extended metadata stays in the
//! compact form: tag, flag byte, and a single payload word. Attaching a
//! label or comment transparently upgrades the payload to a boxed extended
//! form; accessors hide which form is active.

use crate::NodeKind;
use bitflags::bitflags;
use rustc_hash::FxHashMap;
use sable_intern::StringId;
use smallvec::SmallVec;
use std::fmt;

bitflags! {
    /// Invariant bits carried by every node.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct NodeFlags: u8 {
        /// The subtree may be reachable via more than one path; traversals
        /// must memoise. Monotonic within a transaction — attach propagates
        /// it upward, only a collection pass may clear it.
        const NEED_CYCLE_CHECK = 1 << 0;
        /// The subtree is a pure value: no labels, no side-effecting kinds,
        /// all children idempotent. Safe to share and cache.
        const IDEMPOTENT = 1 << 1;
        /// Hint that ordered children may be evaluated concurrently.
        const CONCURRENT = 1 << 2;
    }
}

/// Handle of a node inside its manager's arena.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct NodeId(u32);

impl NodeId {
    /// Create from a raw index.
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        NodeId(raw)
    }

    /// Raw index value.
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Index into the arena.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

/// Map payload of assoc nodes. Iteration order is not semantically
/// significant but is stable within a build.
pub type AssocMap = FxHashMap<StringId, NodeId>;

/// Label list; two inline slots cover almost every labelled node.
pub type LabelList = SmallVec<[StringId; 2]>;

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Payload {
    Empty,
    Bool(bool),
    Number(f64),
    Str(StringId),
    Ordered(Vec<NodeId>),
    Assoc(AssocMap),
    Extended(Box<Extended>),
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Extended {
    /// The plain payload; never itself `Extended`.
    pub base: Payload,
    pub labels: LabelList,
    pub comment: StringId,
}

/// A single evaluable node.
#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    kind: NodeKind,
    flags: NodeFlags,
    payload: Payload,
}

impl Node {
    pub(crate) fn new(kind: NodeKind, payload: Payload) -> Self {
        let mut flags = NodeFlags::empty();
        if kind.is_potentially_idempotent() {
            flags |= NodeFlags::IDEMPOTENT;
        }
        Node {
            kind,
            flags,
            payload,
        }
    }

    /// Default payload for a kind: scalar zero value for immediates, empty
    /// child storage otherwise.
    pub(crate) fn default_payload(kind: NodeKind) -> Payload {
        if kind.uses_assoc() {
            Payload::Assoc(AssocMap::default())
        } else if kind.uses_ordered_children() {
            Payload::Ordered(Vec::new())
        } else {
            match kind {
                NodeKind::Bool => Payload::Bool(false),
                NodeKind::Number => Payload::Number(0.0),
                NodeKind::String | NodeKind::Symbol => Payload::Str(StringId::EMPTY),
                _ => Payload::Empty,
            }
        }
    }

    /// The node's tag.
    #[inline]
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub(crate) fn set_kind(&mut self, kind: NodeKind) {
        self.kind = kind;
        if !kind.is_potentially_idempotent() {
            self.flags.remove(NodeFlags::IDEMPOTENT);
        }
    }

    /// Invariant bits.
    #[inline]
    pub fn flags(&self) -> NodeFlags {
        self.flags
    }

    #[inline]
    pub(crate) fn flags_mut(&mut self) -> &mut NodeFlags {
        &mut self.flags
    }

    /// True if traversals over this subtree must memoise.
    #[inline]
    pub fn needs_cycle_check(&self) -> bool {
        self.flags.contains(NodeFlags::NEED_CYCLE_CHECK)
    }

    /// True if the subtree is a freely shareable pure value.
    #[inline]
    pub fn is_idempotent(&self) -> bool {
        self.flags.contains(NodeFlags::IDEMPOTENT)
    }

    /// Concurrency hint for ordered children.
    #[inline]
    pub fn is_concurrent(&self) -> bool {
        self.flags.contains(NodeFlags::CONCURRENT)
    }

    pub(crate) fn set_concurrent(&mut self, concurrent: bool) {
        self.flags.set(NodeFlags::CONCURRENT, concurrent);
    }

    /// True once the node has been freed. Accessing a deallocated node is a
    /// defect.
    #[inline]
    pub fn is_deallocated(&self) -> bool {
        self.kind == NodeKind::Deallocated
    }

    fn base(&self) -> &Payload {
        match &self.payload {
            Payload::Extended(ext) => &ext.base,
            other => other,
        }
    }

    /// The payload with any extended wrapper peeled off.
    pub(crate) fn raw_base(&self) -> &Payload {
        self.base()
    }

    fn base_mut(&mut self) -> &mut Payload {
        match &mut self.payload {
            Payload::Extended(ext) => &mut ext.base,
            other => other,
        }
    }

    /// Boolean payload; None for non-bool nodes.
    pub fn bool_value(&self) -> Option<bool> {
        match self.base() {
            Payload::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Numeric payload; None for non-number nodes.
    pub fn number_value(&self) -> Option<f64> {
        match self.base() {
            Payload::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// String payload of string and symbol nodes.
    pub fn string_id(&self) -> Option<StringId> {
        match self.base() {
            Payload::Str(id) => Some(*id),
            _ => None,
        }
    }

    /// Ordered children; empty for other payloads.
    pub fn children(&self) -> &[NodeId] {
        match self.base() {
            Payload::Ordered(children) => children,
            _ => &[],
        }
    }

    /// Associative children, if this is an assoc node.
    pub fn assoc(&self) -> Option<&AssocMap> {
        match self.base() {
            Payload::Assoc(map) => Some(map),
            _ => None,
        }
    }

    /// All child handles, ordered or associative.
    pub fn child_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        let (ordered, assoc) = match self.base() {
            Payload::Ordered(children) => (children.as_slice(), None),
            Payload::Assoc(map) => (&[] as &[NodeId], Some(map)),
            _ => (&[] as &[NodeId], None),
        };
        ordered
            .iter()
            .copied()
            .chain(assoc.into_iter().flat_map(|m| m.values().copied()))
    }

    pub(crate) fn set_bool(&mut self, value: bool) {
        *self.base_mut() = Payload::Bool(value);
    }

    pub(crate) fn set_number(&mut self, value: f64) {
        *self.base_mut() = Payload::Number(value);
    }

    pub(crate) fn set_string_id(&mut self, id: StringId) {
        *self.base_mut() = Payload::Str(id);
    }

    pub(crate) fn ordered_mut(&mut self) -> &mut Vec<NodeId> {
        if !matches!(self.base(), Payload::Ordered(_)) {
            *self.base_mut() = Payload::Ordered(Vec::new());
        }
        match self.base_mut() {
            Payload::Ordered(children) => children,
            _ => unreachable!("just normalised to ordered"),
        }
    }

    pub(crate) fn assoc_mut(&mut self) -> &mut AssocMap {
        if !matches!(self.base(), Payload::Assoc(_)) {
            *self.base_mut() = Payload::Assoc(AssocMap::default());
        }
        match self.base_mut() {
            Payload::Assoc(map) => map,
            _ => unreachable!("just normalised to assoc"),
        }
    }

    pub(crate) fn take_payload(&mut self) -> Payload {
        std::mem::replace(&mut self.payload, Payload::Empty)
    }

    /// Labels attached to this node.
    pub fn labels(&self) -> &[StringId] {
        match &self.payload {
            Payload::Extended(ext) => &ext.labels,
            _ => &[],
        }
    }

    /// Comment string, or [`StringId::NOT_A_STRING`] when absent.
    pub fn comment(&self) -> StringId {
        match &self.payload {
            Payload::Extended(ext) => ext.comment,
            _ => StringId::NOT_A_STRING,
        }
    }

    fn extend(&mut self) -> &mut Extended {
        if !matches!(self.payload, Payload::Extended(_)) {
            let base = std::mem::replace(&mut self.payload, Payload::Empty);
            self.payload = Payload::Extended(Box::new(Extended {
                base,
                labels: LabelList::new(),
                comment: StringId::NOT_A_STRING,
            }));
        }
        match &mut self.payload {
            Payload::Extended(ext) => ext,
            _ => unreachable!("just upgraded to extended"),
        }
    }

    /// Attach a label. The caller owns the string reference being handed
    /// over. A labelled node is never idempotent.
    pub(crate) fn push_label(&mut self, label: StringId) {
        self.extend().labels.push(label);
        self.flags.remove(NodeFlags::IDEMPOTENT);
    }

    /// Set the comment string, returning the previous comment's ID so the
    /// caller can release it.
    pub(crate) fn set_comment(&mut self, comment: StringId) -> StringId {
        if comment == StringId::NOT_A_STRING && !matches!(self.payload, Payload::Extended(_)) {
            return StringId::NOT_A_STRING;
        }
        let ext = self.extend();
        std::mem::replace(&mut ext.comment, comment)
    }

    /// True when the node carries no labels and no comment.
    pub fn has_metadata(&self) -> bool {
        match &self.payload {
            Payload::Extended(ext) => !ext.labels.is_empty() || ext.comment.is_string(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_form_stays_compact() {
        let node = Node::new(NodeKind::Number, Payload::Number(4.5));
        assert_eq!(node.number_value(), Some(4.5));
        assert!(node.labels().is_empty());
        assert!(!node.has_metadata());
        assert_eq!(node.comment(), StringId::NOT_A_STRING);
    }

    #[test]
    fn labels_upgrade_payload_transparently() {
        let mut node = Node::new(NodeKind::Number, Payload::Number(1.0));
        assert!(node.is_idempotent());

        node.push_label(StringId::from_raw(40));
        node.push_label(StringId::from_raw(41));

        // Payload survives the upgrade and labels veto idempotency.
        assert_eq!(node.number_value(), Some(1.0));
        assert_eq!(node.labels(), &[StringId::from_raw(40), StringId::from_raw(41)]);
        assert!(!node.is_idempotent());
        assert!(node.has_metadata());
    }

    #[test]
    fn fresh_value_nodes_are_idempotent_and_opcodes_are_not() {
        assert!(Node::new(NodeKind::Number, Payload::Number(0.0)).is_idempotent());
        assert!(Node::new(NodeKind::List, Payload::Ordered(Vec::new())).is_idempotent());
        assert!(!Node::new(NodeKind::Assign, Payload::Ordered(Vec::new())).is_idempotent());
        assert!(!Node::new(NodeKind::Rand, Payload::Ordered(Vec::new())).is_idempotent());
    }

    #[test]
    fn comment_round_trip() {
        let mut node = Node::new(NodeKind::Null, Payload::Empty);
        let prev = node.set_comment(StringId::from_raw(9));
        assert_eq!(prev, StringId::NOT_A_STRING);
        assert_eq!(node.comment(), StringId::from_raw(9));
        let prev = node.set_comment(StringId::from_raw(10));
        assert_eq!(prev, StringId::from_raw(9));
    }

    #[test]
    fn child_ids_covers_both_payload_shapes() {
        let list = Node::new(
            NodeKind::List,
            Payload::Ordered(vec![NodeId::from_raw(1), NodeId::from_raw(2)]),
        );
        assert_eq!(list.child_ids().count(), 2);

        let mut map = AssocMap::default();
        map.insert(StringId::from_raw(5), NodeId::from_raw(3));
        let assoc = Node::new(NodeKind::Assoc, Payload::Assoc(map));
        assert_eq!(assoc.child_ids().count(), 1);
        assert!(assoc.assoc().is_some());
    }
}
