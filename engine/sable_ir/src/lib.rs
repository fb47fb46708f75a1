//! Sable IR — the evaluable-node graph.
//!
//! A Sable program is a tree of typed nodes that is also the engine's data
//! representation: numbers, strings, lists, associative maps, and opcodes
//! are all the same [`Node`] type, distinguished by [`NodeKind`]. Nodes live
//! in an arena owned by a [`NodeManager`], which is the sole allocator and
//! freer; handles are plain indices with advisory uniqueness bits.
//!
//! Two invariant bits thread through everything:
//!
//! - `NEED_CYCLE_CHECK`: the subtree may be reachable through more than one
//!   path, so copy, free, and measurement must memoise. The bit propagates
//!   to ancestors on attach and is only cleared by a collection pass.
//! - `IDEMPOTENT`: the subtree is a pure value — no labels, no
//!   side-effecting kinds, all children idempotent — and may be freely
//!   shared and cached.

mod json;
mod manager;
mod node;
mod opcode;

pub use json::{from_json_str, to_json_string, JsonError};
pub use manager::{MetadataPolicy, NodeManager, NodeRef};
pub use node::{AssocMap, LabelList, Node, NodeFlags, NodeId};
pub use opcode::{NodeKind, ReturnValueKind};

use sable_intern::{SharedPool, StringPool};

/// Build the engine's shared string pool: every opcode keyword plus common
/// literals occupy the static prefix and are never refcounted.
pub fn default_pool() -> SharedPool {
    let literals = ["true", "false", "infinity", "-infinity", "nan"];
    SharedPool::new(StringPool::with_static_strings(
        NodeKind::keywords().chain(literals),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pool_pre_interns_keywords() {
        let pool = default_pool();
        let add = pool.get_id("+");
        assert!(add.is_string());
        assert!(pool.is_static(add));
        assert!(pool.is_static(pool.get_id("query_between")));
        assert!(pool.is_static(pool.get_id("true")));
    }
}
