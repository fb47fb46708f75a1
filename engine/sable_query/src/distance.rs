//! Generalized Minkowski distance over heterogeneous feature types.

use crate::column::ColumnData;
use crate::value::ColumnValue;
use sable_ir::{NodeId, NodeKind, NodeManager};

/// How one feature measures difference.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FeatureType {
    /// Exact match or not: 0 or 1.
    Nominal,
    /// Absolute numeric difference.
    ContinuousNumeric,
    /// Numeric difference on a cycle with a known period.
    ContinuousNumericCyclic,
    /// Edit distance between strings.
    ContinuousString,
    /// Structural edit distance between code trees.
    ContinuousCode,
}

/// Policy for comparisons involving null or absent values.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NullPolicy {
    /// Treat as maximally different.
    KnownDifferent,
    /// Treat as identical.
    KnownSame,
    /// Feature-type-specific middle ground: half the maximum difference.
    Interpolated,
}

/// Configuration of one feature in a distance computation.
#[derive(Clone, Debug)]
pub struct FeatureParam {
    /// Label the feature reads.
    pub label: sable_intern::StringId,
    /// Measurement type.
    pub feature_type: FeatureType,
    /// Multiplier applied to this feature's distance term.
    pub weight: f64,
    /// Cycle period for [`FeatureType::ContinuousNumericCyclic`].
    pub cycle_period: f64,
    /// Policy for null-vs-null.
    pub null_vs_null: NullPolicy,
    /// Policy for null-vs-value and not-exist-vs-anything.
    pub null_vs_value: NullPolicy,
    /// Optional match probability attenuating nominal mismatches.
    pub nominal_probability: Option<f64>,
}

impl FeatureParam {
    /// Nominal feature with weight 1 and known-different null handling.
    pub fn nominal(label: sable_intern::StringId) -> Self {
        FeatureParam {
            label,
            feature_type: FeatureType::Nominal,
            weight: 1.0,
            cycle_period: 0.0,
            null_vs_null: NullPolicy::KnownSame,
            null_vs_value: NullPolicy::KnownDifferent,
            nominal_probability: None,
        }
    }

    /// Continuous numeric feature with weight 1.
    pub fn continuous(label: sable_intern::StringId) -> Self {
        FeatureParam {
            feature_type: FeatureType::ContinuousNumeric,
            ..FeatureParam::nominal(label)
        }
    }
}

/// Parameters of a whole distance computation.
#[derive(Clone, Debug)]
pub struct DistanceParams {
    /// Per-feature configuration.
    pub features: Vec<FeatureParam>,
    /// Minkowski exponent; `p >= 1` by convention, infinity is Chebyshev.
    pub p: f64,
}

impl DistanceParams {
    /// Euclidean parameters over the given features.
    pub fn euclidean(features: Vec<FeatureParam>) -> Self {
        DistanceParams { features, p: 2.0 }
    }
}

/// The column backing one feature, used as the oracle for maximum
/// differences when a policy needs "max".
pub struct FeatureOracle<'a> {
    /// The feature's column, when built.
    pub column: Option<&'a ColumnData>,
}

/// Distance contributed by one feature between a query value and a target
/// value, before weighting.
pub fn feature_distance(
    param: &FeatureParam,
    query: &ColumnValue,
    query_manager: &NodeManager,
    target: &ColumnValue,
    target_manager: &NodeManager,
    oracle: &FeatureOracle<'_>,
) -> f64 {
    use ColumnValue::{Code, NotExist, Null, Number, String as StrVal};

    // Null and absence resolve through the per-feature policies first.
    let query_known = !matches!(query, Null | NotExist);
    let target_known = !matches!(target, Null | NotExist);
    if !query_known || !target_known {
        let policy = if !query_known && !target_known {
            // Absence on either side is never "the same value".
            if matches!(query, NotExist) || matches!(target, NotExist) {
                param.null_vs_value
            } else {
                param.null_vs_null
            }
        } else {
            param.null_vs_value
        };
        return match policy {
            NullPolicy::KnownSame => 0.0,
            NullPolicy::KnownDifferent => max_difference(param, query, oracle),
            NullPolicy::Interpolated => max_difference(param, query, oracle) / 2.0,
        };
    }

    match param.feature_type {
        FeatureType::Nominal => {
            let equal = match (query, target) {
                (Number(a), Number(b)) => a.to_bits() == b.to_bits(),
                (StrVal(a), StrVal(b)) => a == b,
                (Code { node: a, .. }, Code { node: b, .. }) => {
                    cross_manager_equal(query_manager, *a, target_manager, *b)
                }
                _ => false,
            };
            if equal {
                0.0
            } else {
                param.nominal_probability.map_or(1.0, |p| 1.0 - p)
            }
        }
        FeatureType::ContinuousNumeric => match (query, target) {
            (Number(a), Number(b)) => (a - b).abs(),
            _ => max_difference(param, query, oracle),
        },
        FeatureType::ContinuousNumericCyclic => match (query, target) {
            (Number(a), Number(b)) => {
                let difference = (a - b).abs() % param.cycle_period;
                difference.min(param.cycle_period - difference)
            }
            _ => max_difference(param, query, oracle),
        },
        FeatureType::ContinuousString => match (query, target) {
            (StrVal(a), StrVal(b)) => {
                let pool = query_manager.pool();
                let text_a = pool.get(*a);
                let text_b = pool.get(*b);
                edit_distance(&text_a, &text_b) as f64
            }
            _ => max_difference(param, query, oracle),
        },
        FeatureType::ContinuousCode => match (query, target) {
            (Code { node: a, size: size_a }, Code { node: b, size: size_b }) => {
                let common = commonality(query_manager, *a, target_manager, *b);
                ((size_a + size_b) as f64 - 2.0 * common as f64).max(0.0)
            }
            _ => max_difference(param, query, oracle),
        },
    }
}

/// The largest distance this feature can produce against `query`.
fn max_difference(param: &FeatureParam, query: &ColumnValue, oracle: &FeatureOracle<'_>) -> f64 {
    match param.feature_type {
        FeatureType::Nominal => 1.0,
        FeatureType::ContinuousNumericCyclic => param.cycle_period / 2.0,
        _ => oracle
            .column
            .map_or(f64::INFINITY, |column| column.max_difference_from(query)),
    }
}

/// Minkowski aggregation of weighted per-feature distances.
///
/// `p = 1` is Manhattan, `p = 2` Euclidean; `p = infinity` takes the
/// Chebyshev limit.
pub fn aggregate_distance(terms: impl Iterator<Item = (f64, f64)>, p: f64) -> f64 {
    if p.is_infinite() {
        let mut worst: f64 = 0.0;
        for (distance, weight) in terms {
            worst = worst.max(weight * distance);
        }
        return worst;
    }
    if (p - 1.0).abs() < f64::EPSILON {
        return terms.map(|(d, w)| w * d).sum();
    }
    if (p - 2.0).abs() < f64::EPSILON {
        let sum: f64 = terms.map(|(d, w)| w * d * d).sum();
        return sum.sqrt();
    }
    let sum: f64 = terms.map(|(d, w)| w * d.powf(p)).sum();
    sum.powf(1.0 / p)
}

/// Levenshtein distance over characters.
pub fn edit_distance(a: &str, b: &str) -> usize {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    if a_chars.is_empty() {
        return b_chars.len();
    }
    if b_chars.is_empty() {
        return a_chars.len();
    }

    let mut previous: Vec<usize> = (0..=b_chars.len()).collect();
    let mut current = vec![0usize; b_chars.len() + 1];
    for (i, &ca) in a_chars.iter().enumerate() {
        current[0] = i + 1;
        for (j, &cb) in b_chars.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution
                .min(previous[j + 1] + 1)
                .min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b_chars.len()]
}

/// Count of structurally matching nodes between two trees in possibly
/// different managers. Shared prefixes of ordered children and matching
/// assoc keys count; the node itself counts when kind and immediate payload
/// agree.
pub fn commonality(
    manager_a: &NodeManager,
    a: NodeId,
    manager_b: &NodeManager,
    b: NodeId,
) -> usize {
    let node_a = manager_a.get(a);
    let node_b = manager_b.get(b);
    if node_a.kind() != node_b.kind() {
        return 0;
    }

    let own = match node_a.kind() {
        NodeKind::Number => usize::from(
            node_a.number_value().map(f64::to_bits) == node_b.number_value().map(f64::to_bits),
        ),
        NodeKind::Bool => usize::from(node_a.bool_value() == node_b.bool_value()),
        NodeKind::String | NodeKind::Symbol => {
            // Managers may use different pools, so compare text.
            let text_a = manager_a.pool().get(node_a.string_id().unwrap_or_default());
            let text_b = manager_b.pool().get(node_b.string_id().unwrap_or_default());
            usize::from(text_a == text_b)
        }
        _ => 1,
    };
    if own == 0 {
        return 0;
    }

    let mut total = own;
    if let (Some(map_a), Some(map_b)) = (node_a.assoc(), node_b.assoc()) {
        for (&key, &child_a) in map_a {
            let key_text = manager_a.pool().get(key);
            let matching = map_b
                .iter()
                .find(|(&other, _)| manager_b.pool().get(other) == key_text);
            if let Some((_, &child_b)) = matching {
                total += commonality(manager_a, child_a, manager_b, child_b);
            }
        }
    } else {
        for (&child_a, &child_b) in node_a.children().iter().zip(node_b.children()) {
            total += commonality(manager_a, child_a, manager_b, child_b);
        }
    }
    total
}

fn cross_manager_equal(
    manager_a: &NodeManager,
    a: NodeId,
    manager_b: &NodeManager,
    b: NodeId,
) -> bool {
    let size_a = manager_a.deep_size(a);
    let size_b = manager_b.deep_size(b);
    size_a == size_b && commonality(manager_a, a, manager_b, b) == size_a
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sable_ir::default_pool;

    #[test]
    fn minkowski_limits() {
        let terms = [(3.0, 1.0), (4.0, 1.0)];
        assert_eq!(aggregate_distance(terms.iter().copied(), 1.0), 7.0);
        assert_eq!(aggregate_distance(terms.iter().copied(), 2.0), 5.0);
        assert_eq!(aggregate_distance(terms.iter().copied(), f64::INFINITY), 4.0);
    }

    #[test]
    fn cyclic_distance_wraps() {
        let pool = default_pool();
        let manager = NodeManager::new(pool);
        let param = FeatureParam {
            feature_type: FeatureType::ContinuousNumericCyclic,
            cycle_period: 24.0,
            ..FeatureParam::nominal(sable_intern::StringId::EMPTY)
        };
        let oracle = FeatureOracle { column: None };
        let d = feature_distance(
            &param,
            &ColumnValue::Number(23.0),
            &manager,
            &ColumnValue::Number(1.0),
            &manager,
            &oracle,
        );
        assert_eq!(d, 2.0);
    }

    #[test]
    fn nominal_matches_and_attenuation() {
        let pool = default_pool();
        let manager = NodeManager::new(pool);
        let mut param = FeatureParam::nominal(sable_intern::StringId::EMPTY);
        let oracle = FeatureOracle { column: None };

        let same = feature_distance(
            &param,
            &ColumnValue::Number(2.0),
            &manager,
            &ColumnValue::Number(2.0),
            &manager,
            &oracle,
        );
        assert_eq!(same, 0.0);

        param.nominal_probability = Some(0.75);
        let differing = feature_distance(
            &param,
            &ColumnValue::Number(2.0),
            &manager,
            &ColumnValue::Number(3.0),
            &manager,
            &oracle,
        );
        assert_eq!(differing, 0.25);
    }

    #[test]
    fn null_policies() {
        let pool = default_pool();
        let manager = NodeManager::new(pool);
        let oracle = FeatureOracle { column: None };
        let mut param = FeatureParam::nominal(sable_intern::StringId::EMPTY);

        // null-vs-null defaults to known-same.
        assert_eq!(
            feature_distance(&param, &ColumnValue::Null, &manager, &ColumnValue::Null, &manager, &oracle),
            0.0
        );
        // null-vs-value defaults to known-different: nominal max is 1.
        assert_eq!(
            feature_distance(
                &param,
                &ColumnValue::Null,
                &manager,
                &ColumnValue::Number(4.0),
                &manager,
                &oracle
            ),
            1.0
        );
        // not-exist uses the null-vs-value policy even against null.
        param.null_vs_value = NullPolicy::Interpolated;
        assert_eq!(
            feature_distance(
                &param,
                &ColumnValue::NotExist,
                &manager,
                &ColumnValue::Null,
                &manager,
                &oracle
            ),
            0.5
        );
    }

    #[test]
    fn string_edit_distance() {
        assert_eq!(edit_distance("kitten", "sitting"), 3);
        assert_eq!(edit_distance("", "abc"), 3);
        assert_eq!(edit_distance("same", "same"), 0);
    }

    #[test]
    fn code_distance_is_structural() {
        let pool = default_pool();
        let mut manager = NodeManager::new(pool);
        let a = {
            let one = manager.alloc_number(1.0);
            let two = manager.alloc_number(2.0);
            manager.alloc_list([one, two])
        };
        let b = {
            let one = manager.alloc_number(1.0);
            let nine = manager.alloc_number(9.0);
            manager.alloc_list([one, nine])
        };

        let param = FeatureParam {
            feature_type: FeatureType::ContinuousCode,
            ..FeatureParam::nominal(sable_intern::StringId::EMPTY)
        };
        let oracle = FeatureOracle { column: None };
        let qa = ColumnValue::Code { node: a.id, size: 3 };
        let qb = ColumnValue::Code { node: b.id, size: 3 };

        let self_distance =
            feature_distance(&param, &qa, &manager, &qa, &manager, &oracle);
        assert_eq!(self_distance, 0.0);

        // One differing leaf: 3 + 3 - 2*2 = 2.
        let one_leaf = feature_distance(&param, &qa, &manager, &qb, &manager, &oracle);
        assert_eq!(one_leaf, 2.0);
    }
}
