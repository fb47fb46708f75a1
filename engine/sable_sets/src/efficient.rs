//! Adaptive hybrid set.

use crate::{BitSet, SortedSet, BITS_PER_BUCKET};
use sable_rand::RandomStream;

/// Set that holds either a [`SortedSet`] or a [`BitSet`] and converts when a
/// density heuristic crosses.
///
/// The heuristic weighs element count against `2 *` the bucket count a bit
/// array would need. Rounding is asymmetric — the densify test adds one
/// bucket, the sparsify test does not — so a set sitting on the boundary
/// does not flip back and forth on single-element churn.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EfficientSet {
    repr: Repr,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Repr {
    Sorted(SortedSet),
    Bits(BitSet),
}

impl EfficientSet {
    /// Empty set, starting sparse.
    pub const fn new() -> Self {
        EfficientSet {
            repr: Repr::Sorted(SortedSet::new()),
        }
    }

    /// Number of elements.
    #[inline]
    pub fn len(&self) -> usize {
        match &self.repr {
            Repr::Sorted(s) => s.len(),
            Repr::Bits(b) => b.len(),
        }
    }

    /// True when no elements are present.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Largest element.
    pub fn max(&self) -> Option<usize> {
        match &self.repr {
            Repr::Sorted(s) => s.max(),
            Repr::Bits(b) => b.max(),
        }
    }

    /// True while the sparse representation is active.
    pub fn is_sparse(&self) -> bool {
        matches!(self.repr, Repr::Sorted(_))
    }

    /// Membership test.
    pub fn contains(&self, value: usize) -> bool {
        match &self.repr {
            Repr::Sorted(s) => s.contains(value),
            Repr::Bits(b) => b.contains(value),
        }
    }

    /// Insert `value`; returns true if it was newly added.
    pub fn insert(&mut self, value: usize) -> bool {
        let added = match &mut self.repr {
            Repr::Sorted(s) => s.insert(value),
            Repr::Bits(b) => b.insert(value),
        };
        if added {
            self.rebalance();
        }
        added
    }

    /// Erase `value`; returns true if it was present.
    pub fn erase(&mut self, value: usize) -> bool {
        let removed = match &mut self.repr {
            Repr::Sorted(s) => s.erase(value),
            Repr::Bits(b) => b.erase(value),
        };
        if removed {
            self.rebalance();
        }
        removed
    }

    /// Insert every value yielded, rebalancing once at the end.
    pub fn insert_batch(&mut self, values: impl IntoIterator<Item = usize>) {
        match &mut self.repr {
            Repr::Sorted(s) => {
                for value in values {
                    s.insert(value);
                }
            }
            Repr::Bits(b) => b.insert_batch(values),
        }
        self.rebalance();
    }

    /// Remove all elements.
    pub fn clear(&mut self) {
        self.repr = Repr::Sorted(SortedSet::new());
    }

    /// k-th smallest element.
    pub fn nth(&self, n: usize) -> Option<usize> {
        match &self.repr {
            Repr::Sorted(s) => s.nth(n),
            Repr::Bits(b) => b.nth(n),
        }
    }

    /// Random element.
    pub fn random_element(&self, rs: &mut RandomStream) -> Option<usize> {
        match &self.repr {
            Repr::Sorted(s) => s.random_element(rs),
            Repr::Bits(b) => b.random_element(rs),
        }
    }

    /// Iterate in increasing order.
    pub fn iter(&self) -> EfficientIter<'_> {
        match &self.repr {
            Repr::Sorted(s) => EfficientIter::Sorted(s.as_slice().iter()),
            Repr::Bits(b) => EfficientIter::Bits(b.iter()),
        }
    }

    /// Copy all elements into a dense bitset.
    pub fn copy_into_bits(&self, out: &mut BitSet) {
        match &self.repr {
            Repr::Sorted(s) => {
                out.clear();
                out.insert_batch(s.iter());
            }
            Repr::Bits(b) => *out = b.clone(),
        }
    }

    /// Union every element into `out`.
    pub fn union_into_bits(&self, out: &mut BitSet) {
        match &self.repr {
            Repr::Sorted(s) => out.insert_batch(s.iter()),
            Repr::Bits(b) => out.union_with(b),
        }
    }

    /// Union in-place with another hybrid set.
    pub fn union_with(&mut self, other: &EfficientSet) {
        match (&mut self.repr, &other.repr) {
            (Repr::Sorted(mine), Repr::Sorted(theirs)) => mine.union_with(theirs),
            (Repr::Bits(mine), _) => match &other.repr {
                Repr::Sorted(s) => mine.insert_batch(s.iter()),
                Repr::Bits(b) => mine.union_with(b),
            },
            (Repr::Sorted(mine), Repr::Bits(theirs)) => {
                let mut bits = BitSet::new();
                bits.insert_batch(mine.iter());
                bits.union_with(theirs);
                self.repr = Repr::Bits(bits);
            }
        }
        self.rebalance();
    }

    /// Keep only elements also present in `other`.
    pub fn intersect_with(&mut self, other: &EfficientSet) {
        match &mut self.repr {
            Repr::Sorted(mine) => mine.retain(|v| other.contains(*v)),
            Repr::Bits(mine) => match &other.repr {
                Repr::Bits(theirs) => mine.intersect_with(theirs),
                Repr::Sorted(theirs) => {
                    let filtered: BitSet = theirs.iter().filter(|v| mine.contains(*v)).collect();
                    *mine = filtered;
                }
            },
        }
        self.rebalance();
    }

    /// Replace the set with its complement over `[0, n)`.
    pub fn complement_up_to(&mut self, n: usize) {
        let mut bits = BitSet::new();
        self.union_into_bits(&mut bits);
        bits.complement_up_to(n);
        self.repr = Repr::Bits(bits);
        self.rebalance();
    }

    /// Convert to the representation the heuristic prefers.
    fn rebalance(&mut self) {
        let Some(max) = self.max() else {
            if !self.is_sparse() {
                self.repr = Repr::Sorted(SortedSet::new());
            }
            return;
        };
        let end = max + 1;

        match &self.repr {
            Repr::Sorted(s) => {
                // Round up plus one so boundary sizes do not flip back.
                let buckets_required = end.div_ceil(BITS_PER_BUCKET) + 1;
                if s.len() > 2 * buckets_required {
                    let mut bits = BitSet::new();
                    bits.insert_batch(s.iter());
                    self.repr = Repr::Bits(bits);
                }
            }
            Repr::Bits(b) => {
                let buckets_required = end.div_ceil(BITS_PER_BUCKET);
                if 2 * buckets_required > b.len() {
                    let mut sorted = SortedSet::new();
                    sorted.append_sorted(b.iter());
                    self.repr = Repr::Sorted(sorted);
                }
            }
        }
    }
}

impl Default for EfficientSet {
    fn default() -> Self {
        EfficientSet::new()
    }
}

impl FromIterator<usize> for EfficientSet {
    fn from_iter<T: IntoIterator<Item = usize>>(iter: T) -> Self {
        let mut set = EfficientSet::new();
        set.insert_batch(iter);
        set
    }
}

/// Increasing-order iterator over an [`EfficientSet`].
pub enum EfficientIter<'a> {
    /// Sparse backing.
    Sorted(std::slice::Iter<'a, usize>),
    /// Dense backing.
    Bits(crate::BitIter<'a>),
}

impl Iterator for EfficientIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        match self {
            EfficientIter::Sorted(iter) => iter.next().copied(),
            EfficientIter::Bits(iter) => iter.next(),
        }
    }
}

impl<'a> IntoIterator for &'a EfficientSet {
    type Item = usize;
    type IntoIter = EfficientIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn starts_sparse_and_densifies() {
        let mut set = EfficientSet::new();
        assert!(set.is_sparse());

        // 40 elements in [0, 64): one bucket needed, far past 2*(1+1).
        set.insert_batch(0..40);
        assert!(!set.is_sparse());
        assert_eq!(set.len(), 40);
    }

    #[test]
    fn sparsifies_when_range_outgrows_count() {
        let mut set: EfficientSet = (0..40).collect();
        assert!(!set.is_sparse());

        // A huge element makes the range expensive for the dense form.
        set.insert(40_000);
        assert!(set.is_sparse());
        assert_eq!(set.len(), 41);
    }

    #[test]
    fn boundary_churn_does_not_oscillate() {
        // Sit near the heuristic boundary and churn one element.
        let mut set: EfficientSet = (0..6).map(|i| i * 17).collect();
        let before_sparse = set.is_sparse();
        for _ in 0..10 {
            set.erase(0);
            set.insert(0);
            assert_eq!(set.is_sparse(), before_sparse);
        }
    }

    #[test]
    fn len_matches_iteration_across_conversions() {
        let mut set = EfficientSet::new();
        for v in 0..100 {
            set.insert(v);
            assert_eq!(set.len(), set.iter().count());
        }
        for v in (0..100).step_by(2) {
            set.erase(v);
            assert_eq!(set.len(), set.iter().count());
        }
    }

    #[test]
    fn set_operations() {
        let mut a: EfficientSet = [1, 5, 9].into_iter().collect();
        let b: EfficientSet = [5, 9, 11].into_iter().collect();
        a.union_with(&b);
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![1, 5, 9, 11]);

        a.intersect_with(&[9, 11, 200].into_iter().collect());
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![9, 11]);

        a.complement_up_to(4);
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn nth_and_random_follow_active_repr() {
        let set: EfficientSet = (0..10).map(|i| i * 64).collect();
        assert_eq!(set.nth(5), Some(320));

        let mut rs = RandomStream::from_seed("eff");
        let v = set.random_element(&mut rs).expect("non-empty");
        assert!(set.contains(v));
    }
}
