//! Entities: named containers of evaluable-node trees.
//!
//! An entity holds a root node inside its own [`sable_ir::NodeManager`],
//! a seedable random stream, a permission flag, and zero or more child
//! entities addressed both by interned name and by dense slot index. Labels
//! inside the root tree are the entity's named anchors; looking one up
//! yields the node it tags.
//!
//! Mutations flow through methods that notify any registered
//! [`WriteListener`] so a write-ahead log can mirror them.

mod constraints;
mod entity;
mod listener;

pub use constraints::ExecutionConstraints;
pub use entity::{Entity, EntityLock};
pub use listener::{AssignmentLog, LoggedValue, WriteListener};

use thiserror::Error;

/// Entity operation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EntityError {
    /// The operation requires root permission the caller lacks.
    #[error("entity {0:?} denies this operation without root permission")]
    PermissionDenied(String),
    /// No contained entity with the given name.
    #[error("no contained entity named {0:?}")]
    NoSuchEntity(String),
    /// A contained entity with the name already exists.
    #[error("a contained entity named {0:?} already exists")]
    DuplicateEntity(String),
}
