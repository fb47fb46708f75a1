//! Immediate values as the query engine sees them.

use sable_entity::Entity;
use sable_intern::StringId;
use sable_ir::{NodeId, NodeKind};

/// Type tag of a column value.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ValueType {
    /// The entity has no node at the label.
    NotExist,
    /// The labelled node is null.
    Null,
    /// Numeric value (bools coerce to 0/1).
    Number,
    /// Interned string value.
    String,
    /// Any structured node.
    Code,
}

/// A value extracted from one entity at one label.
///
/// Code values stay as handles into the owning entity's manager; their
/// bucketing key is the deep node size.
#[derive(Copy, Clone, Debug)]
pub enum ColumnValue {
    /// Label absent.
    NotExist,
    /// Labelled node is null.
    Null,
    /// Numeric value.
    Number(f64),
    /// Interned string value.
    String(StringId),
    /// Structured value: node handle plus its deep size.
    Code { node: NodeId, size: usize },
}

impl ColumnValue {
    /// The value's type tag.
    pub fn value_type(&self) -> ValueType {
        match self {
            ColumnValue::NotExist => ValueType::NotExist,
            ColumnValue::Null => ValueType::Null,
            ColumnValue::Number(_) => ValueType::Number,
            ColumnValue::String(_) => ValueType::String,
            ColumnValue::Code { .. } => ValueType::Code,
        }
    }

    /// Numeric view, when this is a number.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            ColumnValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// String view, when this is a string.
    pub fn as_string(&self) -> Option<StringId> {
        match self {
            ColumnValue::String(id) => Some(*id),
            _ => None,
        }
    }
}

/// Extract the value of `entity` at `label`.
pub fn column_value(entity: &Entity, label: StringId) -> ColumnValue {
    let Some(id) = entity.lookup_label(label) else {
        return ColumnValue::NotExist;
    };
    let node = entity.manager().get(id);
    match node.kind() {
        NodeKind::Null => ColumnValue::Null,
        NodeKind::Number => ColumnValue::Number(node.number_value().unwrap_or(f64::NAN)),
        NodeKind::Bool => ColumnValue::Number(f64::from(u8::from(node.bool_value() == Some(true)))),
        NodeKind::String | NodeKind::Symbol => {
            ColumnValue::String(node.string_id().unwrap_or_default())
        }
        _ => ColumnValue::Code {
            node: id,
            size: entity.manager().deep_size(id),
        },
    }
}
