//! Interned string identifier.

use std::fmt;

/// Interned string identifier.
///
/// A `StringId` is an index into the pool's entry table. Two IDs compare
/// equal exactly when they were produced by interning the same string in the
/// same pool. The untyped ordering (`Ord`) is allocation order and carries no
/// linguistic meaning; use [`crate::natural_compare`] on the resolved strings
/// when a human-meaningful order is needed.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct StringId(u32);

impl StringId {
    /// Reserved ID meaning "not a string" (null, NaN keys, absent values).
    pub const NOT_A_STRING: StringId = StringId(0);

    /// Pre-interned empty string.
    pub const EMPTY: StringId = StringId(1);

    /// Create from a raw u32 value.
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        StringId(raw)
    }

    /// Get the raw u32 value.
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Index into the pool's entry table.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// True for any ID other than [`StringId::NOT_A_STRING`].
    #[inline]
    pub const fn is_string(self) -> bool {
        self.0 != 0
    }
}

impl Default for StringId {
    fn default() -> Self {
        StringId::NOT_A_STRING
    }
}

impl fmt::Debug for StringId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StringId({})", self.0)
    }
}
