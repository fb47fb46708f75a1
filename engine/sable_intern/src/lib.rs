//! String interning for the Sable engine.
//!
//! Every string that appears in a node, a label, an entity name, or a query
//! is represented by a small integer [`StringId`] handed out by a
//! process-wide [`StringPool`]. The pool keeps a reference count per dynamic
//! ID so that memory for strings no longer referenced anywhere can be
//! reclaimed and the ID reused, keeping the ID space compact.
//!
//! A fixed prefix of IDs is *static*: interned at pool construction, never
//! refcounted, never freed. The engine pre-interns all opcode keywords and
//! common literals there so the hot paths of the interpreter never touch a
//! reference count.

mod natural;
mod pool;
mod string_id;
mod wire;

pub use natural::{natural_compare, natural_less};
pub use pool::{PoolStats, SharedPool, StringPool};
pub use string_id::StringId;
pub use wire::{read_pool, write_pool, WireError};
