//! Integer sets over `usize` keys.
//!
//! Entity indices flow through every query as sets, and neither a sparse nor
//! a dense representation dominates across workloads: result sets range from
//! a handful of hits in a huge container to nearly-complete slices of it.
//! Three interchangeable forms cover the space:
//!
//! - [`SortedSet`]: a strictly increasing vector; cheap to iterate and to
//!   merge when small.
//! - [`BitSet`]: 64-bit buckets with popcount-assisted `nth`; constant-time
//!   membership and fast bulk boolean operations when dense.
//! - [`EfficientSet`]: holds either of the two and converts when a density
//!   heuristic (with hysteresis) crosses.
//!
//! After every public call, `len()` equals the true cardinality.

mod bits;
mod efficient;
mod sorted;

pub use bits::{BitIter, BitSet};
pub use efficient::{EfficientIter, EfficientSet};
pub use sorted::SortedSet;

/// Bits per bit-array bucket.
pub const BITS_PER_BUCKET: usize = 64;
