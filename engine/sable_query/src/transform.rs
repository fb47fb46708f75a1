//! Distance transforms: weights, probabilities, surprisals, and distance
//! contributions.

use sable_entity::Entity;
use sable_intern::StringId;

/// Aggregator used for the expected value inside a distance contribution.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ContributionMean {
    /// Generalized mean with `p = -1`.
    Harmonic,
    /// Generalized mean with `p = 0`; the default.
    Geometric,
    /// Generalized mean with `p = 1`.
    Arithmetic,
    /// Combine in probability space via the union of probability masses.
    Probability,
}

impl Default for ContributionMean {
    fn default() -> Self {
        ContributionMean::Geometric
    }
}

/// Parameters for transforming raw distances.
#[derive(Clone, Debug)]
pub struct DistanceTransform {
    /// Interpret distances as surprisals and convert to probabilities.
    pub surprisal_to_probability: bool,
    /// Exponent applied to each distance when not in surprisal mode; `-1`
    /// yields inverse-distance weights, `0` flattens to 1.
    pub distance_weight_exponent: f64,
    /// Label carrying per-entity weights, if any.
    pub weight_label: Option<StringId>,
    /// Expected-value aggregator for distance contributions.
    pub contribution_mean: ContributionMean,
}

impl Default for DistanceTransform {
    fn default() -> Self {
        DistanceTransform {
            surprisal_to_probability: false,
            distance_weight_exponent: 1.0,
            weight_label: None,
            contribution_mean: ContributionMean::default(),
        }
    }
}

impl DistanceTransform {
    /// The weight of the child at `index`, when a weight label is set and
    /// the child carries a number there.
    pub fn entity_weight(&self, container: &Entity, index: usize) -> Option<f64> {
        let label = self.weight_label?;
        let child = container.child(index)?;
        let value = child.number_at_label(label)?;
        if value.is_nan() {
            Some(0.0)
        } else {
            Some(value)
        }
    }

    /// Transform `(entity, distance)` pairs in place.
    ///
    /// In surprisal mode each distance becomes a probability
    /// `exp(-distance)`, weighted through the complement-product identity
    /// `P(any) = 1 - prod(1 - P_i)^w`. Otherwise distances are raised to
    /// the weight exponent (zero distances map to infinity for negative
    /// exponents) and scaled by entity weights.
    pub fn transform_distances(
        &self,
        container: &Entity,
        pairs: &mut [(usize, f64)],
        sort_results: bool,
    ) {
        if self.surprisal_to_probability {
            for (index, distance) in pairs.iter_mut() {
                let probability = (-*distance).exp();
                *distance = match self.entity_weight(container, *index) {
                    Some(weight) if weight != 1.0 => {
                        if weight == 0.0 {
                            0.0
                        } else {
                            1.0 - (1.0 - probability).powf(weight)
                        }
                    }
                    _ => probability,
                };
            }
        } else {
            let exponent = self.distance_weight_exponent;
            for (index, distance) in pairs.iter_mut() {
                let mut value = if (exponent - 1.0).abs() < f64::EPSILON {
                    *distance
                } else if exponent == 0.0 {
                    1.0
                } else if exponent < 0.0 && *distance == 0.0 {
                    f64::INFINITY
                } else {
                    distance.powf(exponent)
                };
                if let Some(weight) = self.entity_weight(container, *index) {
                    value = if weight == 0.0 { 0.0 } else { value * weight };
                }
                *distance = value;
            }
        }

        if sort_results {
            // Distances sort ascending; inverse weights and probabilities
            // sort descending.
            let descending = self.surprisal_to_probability || self.distance_weight_exponent <= 0.0;
            pairs.sort_by(|a, b| {
                let ordering = a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal);
                if descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
        }
    }

    /// Expected value of the (untransformed) distances in `pairs`.
    ///
    /// In surprisal mode, combines probability masses and returns the
    /// surprisal of "any neighbour is the same"; when every mass underflows
    /// to zero, the smallest observed surprisal is returned instead of NaN.
    pub fn expected_value(&self, container: &Entity, pairs: &[(usize, f64)]) -> f64 {
        if pairs.is_empty() {
            return f64::NAN;
        }

        if self.surprisal_to_probability || self.contribution_mean == ContributionMean::Probability
        {
            let mut none_same = 1.0;
            let mut smallest_surprisal = f64::INFINITY;
            for &(index, distance) in pairs {
                smallest_surprisal = smallest_surprisal.min(distance);
                let probability = (-distance).exp();
                let mut not_same = 1.0 - probability;
                if let Some(weight) = self.entity_weight(container, index) {
                    if weight == 0.0 {
                        continue;
                    }
                    if weight != 1.0 {
                        not_same = not_same.powf(weight);
                    }
                }
                none_same *= not_same;
            }
            let any_same = 1.0 - none_same;
            if any_same <= 0.0 {
                // Every mass underflowed; fall back to the nearest
                // neighbour's surprisal.
                return smallest_surprisal;
            }
            return -any_same.ln();
        }

        let p = match self.contribution_mean {
            ContributionMean::Harmonic => -1.0,
            ContributionMean::Geometric => 0.0,
            ContributionMean::Arithmetic => 1.0,
            ContributionMean::Probability => unreachable!("handled above"),
        };
        crate::stats::generalized_mean(
            pairs.iter().map(|&(index, distance)| {
                (distance, self.entity_weight(container, index).unwrap_or(1.0))
            }),
            p,
            0.0,
            false,
            false,
        )
    }

    /// Distance contribution of `entity`: the expected transformed distance
    /// of its neighbours, with zero-distance duplicates sharing the
    /// contribution in proportion to weight.
    pub fn distance_contribution(
        &self,
        container: &Entity,
        entity: usize,
        neighbours: &[(usize, f64)],
    ) -> f64 {
        let first_nonzero = neighbours
            .iter()
            .position(|&(_, distance)| distance != 0.0)
            .unwrap_or(neighbours.len());

        if self.weight_label.is_none() {
            let duplicates = 1 + first_nonzero;
            let expected = self.expected_value(container, &neighbours[first_nonzero..]);
            if expected.is_nan() {
                return 0.0;
            }
            return expected / duplicates as f64;
        }

        let mut duplicate_weight = 0.0;
        for &(index, _) in &neighbours[..first_nonzero] {
            duplicate_weight += self.entity_weight(container, index).unwrap_or(1.0);
        }
        let expected = self.expected_value(container, &neighbours[first_nonzero..]);
        if expected.is_nan() {
            return 0.0;
        }
        let entity_weight = self.entity_weight(container, entity).unwrap_or(1.0);
        if entity_weight == 0.0 {
            return 0.0;
        }
        expected * entity_weight / (duplicate_weight + entity_weight)
    }
}

/// Adaptive neighbourhood sizing for KNN with a probability-mass cutoff.
#[derive(Clone, Debug)]
pub struct AdaptiveBandwidth {
    /// Always keep at least this many neighbours.
    pub min_k: usize,
    /// Never keep more than this many (before the extras).
    pub max_k: usize,
    /// Stop once the next neighbour's marginal share of the total mass
    /// falls below this.
    pub marginal_threshold: f64,
    /// Extra neighbours retained past the cutoff for noise smoothing.
    pub extra: usize,
}

impl AdaptiveBandwidth {
    /// Number of neighbours to keep from `sorted`, which must be ascending
    /// by distance.
    pub fn cutoff(&self, sorted: &[(usize, f64)]) -> usize {
        let hard_cap = sorted.len();
        let mut keep = self.min_k.min(hard_cap);
        let mut total_mass: f64 = sorted[..keep].iter().map(|&(_, d)| (-d).exp()).sum();

        while keep < self.max_k.min(hard_cap) {
            let next_mass = (-sorted[keep].1).exp();
            if total_mass > 0.0 && next_mass / (total_mass + next_mass) < self.marginal_threshold {
                break;
            }
            total_mass += next_mass;
            keep += 1;
        }

        (keep + self.extra).min(hard_cap)
    }
}

/// KL(P || Q) in nats, skipping terms with non-finite or zero Q.
pub fn kullback_leibler_divergence(p: &[f64], q: &[f64]) -> f64 {
    let mut sum = 0.0;
    for (&pi, &qi) in p.iter().zip(q) {
        if qi != 0.0 && !qi.is_nan() && pi != 0.0 {
            sum += pi * (pi / qi).ln();
        }
    }
    sum
}

/// Partial KL over only the indices present in `changed`, assuming P and Q
/// agree elsewhere.
pub fn partial_kl_divergence(p: &[f64], changed: &[(usize, f64)]) -> f64 {
    let mut sum = 0.0;
    for &(index, qi) in changed {
        let pi = p[index];
        if qi != 0.0 && !qi.is_nan() && pi != 0.0 {
            sum += pi * (pi / qi).ln();
        }
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sable_ir::default_pool;

    fn weighted_container(weights: &[f64]) -> (Entity, DistanceTransform) {
        let pool = default_pool();
        let mut container = Entity::new("c", pool.clone());
        for (index, weight) in weights.iter().enumerate() {
            let mut child = Entity::new(&format!("e{index}"), pool.clone());
            child
                .set_root_from_source(&format!("(list #w {weight})"), None)
                .expect("root");
            container.add_child(child, None).expect("add");
        }
        let transform = DistanceTransform {
            weight_label: Some(pool.get_id("w")),
            ..DistanceTransform::default()
        };
        (container, transform)
    }

    #[test]
    fn inverse_exponent_maps_zero_to_infinity() {
        let pool = default_pool();
        let container = Entity::new("c", pool);
        let transform = DistanceTransform {
            distance_weight_exponent: -1.0,
            ..DistanceTransform::default()
        };
        let mut pairs = vec![(0, 0.0), (1, 2.0)];
        transform.transform_distances(&container, &mut pairs, true);
        // Sorted descending for inverse weights: infinity first.
        assert_eq!(pairs[0].1, f64::INFINITY);
        assert_eq!(pairs[1].1, 0.5);
    }

    #[test]
    fn entity_weights_scale_distances() {
        let (container, transform) = weighted_container(&[2.0, 1.0]);
        let mut pairs = vec![(0, 3.0), (1, 3.0)];
        transform.transform_distances(&container, &mut pairs, false);
        assert_eq!(pairs[0].1, 6.0);
        assert_eq!(pairs[1].1, 3.0);
    }

    #[test]
    fn expected_value_geometric_default() {
        let pool = default_pool();
        let container = Entity::new("c", pool);
        let transform = DistanceTransform::default();
        let value = transform.expected_value(&container, &[(0, 2.0), (1, 8.0)]);
        assert!((value - 4.0).abs() < 1e-12, "geometric mean of 2 and 8 is 4, got {value}");
    }

    #[test]
    fn underflowed_probabilities_fall_back_to_smallest_surprisal() {
        let pool = default_pool();
        let container = Entity::new("c", pool);
        let transform = DistanceTransform {
            surprisal_to_probability: true,
            ..DistanceTransform::default()
        };
        // Distances so large every probability is numerically zero.
        let value = transform.expected_value(&container, &[(0, 800.0), (1, 900.0)]);
        assert_eq!(value, 800.0);
    }

    #[test]
    fn contribution_splits_among_duplicates_by_weight() {
        // Two identical entities with weights 1 and 2; a third neighbour at
        // distance 4 provides the mass being split.
        let (container, transform) = weighted_container(&[1.0, 2.0, 1.0]);

        // From entity 0: entity 1 is the zero-distance duplicate.
        let dc0 = transform.distance_contribution(&container, 0, &[(1, 0.0), (2, 4.0)]);
        // From entity 1: entity 0 is the duplicate.
        let dc1 = transform.distance_contribution(&container, 1, &[(0, 0.0), (2, 4.0)]);

        // Split is 1:2 in favour of the heavier entity.
        assert!((dc1 / dc0 - 2.0).abs() < 1e-12, "dc0 {dc0}, dc1 {dc1}");
    }

    #[test]
    fn adaptive_bandwidth_walks_until_marginal_mass_fades() {
        let bandwidth = AdaptiveBandwidth {
            min_k: 1,
            max_k: 5,
            marginal_threshold: 0.1,
            extra: 0,
        };
        // First two neighbours are close; the third is far enough that its
        // marginal mass share drops below 10%.
        let sorted = [(0, 0.1), (1, 0.2), (2, 6.0), (3, 6.5)];
        assert_eq!(bandwidth.cutoff(&sorted), 2);

        let generous = AdaptiveBandwidth {
            min_k: 1,
            max_k: 5,
            marginal_threshold: 0.0,
            extra: 1,
        };
        assert_eq!(generous.cutoff(&sorted), 4);
    }

    #[test]
    fn kl_divergence_basics() {
        let p = [0.5, 0.5];
        let q = [0.9, 0.1];
        assert!(kullback_leibler_divergence(&p, &p).abs() < 1e-12);
        assert!(kullback_leibler_divergence(&p, &q) > 0.0);

        let partial = partial_kl_divergence(&p, &[(1, 0.1)]);
        assert!((partial - 0.5 * (0.5f64 / 0.1).ln()).abs() < 1e-12);
    }
}
