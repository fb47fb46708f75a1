//! Weighted discrete sampling.
//!
//! A single draw scans the cumulative mass linearly; repeated draws build an
//! alias table (Vose, "A linear algorithm for generating random numbers with
//! a given distribution") and sample in O(1).

use crate::RandomStream;

/// Draw one index weighted by `weights`.
///
/// Weights need not be normalised. Returns `None` when the total mass is
/// zero, not finite, or the slice is empty.
pub fn weighted_sample_index(weights: &[f64], rs: &mut RandomStream) -> Option<usize> {
    let total: f64 = weights.iter().copied().filter(|w| w.is_finite() && *w > 0.0).sum();
    if total <= 0.0 || !total.is_finite() {
        return None;
    }

    let r = rs.rand() * total;
    let mut mass = 0.0;
    let mut last_positive = 0;
    for (index, &w) in weights.iter().enumerate() {
        if !(w.is_finite() && w > 0.0) {
            continue;
        }
        mass += w;
        last_positive = index;
        if r <= mass {
            return Some(index);
        }
    }

    // Numerical precision left the draw past the accumulated mass; return
    // the last index that carried any.
    Some(last_positive)
}

/// Pre-computed alias table for O(1) weighted draws.
pub struct AliasTable {
    /// Probability of keeping the bucket itself rather than its alias,
    /// scaled so a uniform distribution is all-ones.
    probability: Vec<f64>,
    /// Bucket each underfull slot borrows its remaining mass from.
    alias: Vec<usize>,
}

impl AliasTable {
    /// Build the table. Returns `None` when no weight is positive and
    /// finite.
    pub fn new(weights: &[f64]) -> Option<Self> {
        let n = weights.len();
        let total: f64 = weights.iter().copied().filter(|w| w.is_finite() && *w > 0.0).sum();
        if n == 0 || total <= 0.0 || !total.is_finite() {
            return None;
        }

        let mut scaled: Vec<f64> = weights
            .iter()
            .map(|&w| {
                if w.is_finite() && w > 0.0 {
                    w / total
                } else {
                    0.0
                }
            })
            .collect();

        let uniform = 1.0 / n as f64;
        let mut small: Vec<usize> = Vec::new();
        let mut large: Vec<usize> = Vec::new();
        for (index, &p) in scaled.iter().enumerate() {
            if p >= uniform {
                large.push(index);
            } else {
                small.push(index);
            }
        }

        let mut probability = vec![0.0; n];
        let mut alias: Vec<usize> = (0..n).collect();

        while let (Some(&less), Some(&more)) = (small.last(), large.last()) {
            small.pop();
            large.pop();

            probability[less] = scaled[less] * n as f64;
            alias[less] = more;

            scaled[more] = scaled[more] + scaled[less] - uniform;
            if scaled[more] >= uniform {
                large.push(more);
            } else {
                small.push(more);
            }
        }

        // Remaining entries absorb any leftover mass from rounding.
        for index in small.into_iter().chain(large) {
            probability[index] = 1.0;
        }

        Some(AliasTable { probability, alias })
    }

    /// Number of buckets.
    pub fn len(&self) -> usize {
        self.probability.len()
    }

    /// True when the table has no buckets.
    pub fn is_empty(&self) -> bool {
        self.probability.is_empty()
    }

    /// Draw one index according to the weights the table was built from.
    pub fn sample(&self, rs: &mut RandomStream) -> usize {
        let bucket = rs.rand_u32() as usize % self.probability.len();
        if rs.rand() < self.probability[bucket] {
            bucket
        } else {
            self.alias[bucket]
        }
    }
}
