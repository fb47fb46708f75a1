//! Statistical aggregates over entity values.
//!
//! Every function takes `(value, weight)` pairs; unweighted callers pass a
//! weight of 1. A zero weight always wins over an infinite or NaN value.
//! Aggregates over empty input return NaN.

use rustc_hash::FxHashMap;
use sable_intern::StringId;

/// Weighted sum.
pub fn sum(values: impl Iterator<Item = (f64, f64)>) -> f64 {
    let mut total = 0.0;
    for (value, weight) in values {
        if weight != 0.0 {
            total += weight * value;
        }
    }
    total
}

/// Weighted mode of numbers. NaN values are a bucket of their own,
/// compared by bit identity.
pub fn mode_number(values: impl Iterator<Item = (f64, f64)>) -> f64 {
    let mut masses: FxHashMap<u64, (f64, f64)> = FxHashMap::default();
    for (value, weight) in values {
        let entry = masses.entry(value.to_bits()).or_insert((value, 0.0));
        entry.1 += weight;
    }
    let mut mode = f64::NAN;
    let mut mode_weight = 0.0;
    for (value, weight) in masses.into_values() {
        if weight > mode_weight {
            mode = value;
            mode_weight = weight;
        }
    }
    mode
}

/// Weighted mode of string IDs, None when nothing has positive mass.
pub fn mode_string(values: impl Iterator<Item = (StringId, f64)>) -> Option<StringId> {
    let mut masses: FxHashMap<StringId, f64> = FxHashMap::default();
    for (value, weight) in values {
        *masses.entry(value).or_insert(0.0) += weight;
    }
    let mut mode = None;
    let mut mode_weight = 0.0;
    for (value, weight) in masses {
        if weight > mode_weight {
            mode = Some(value);
            mode_weight = weight;
        }
    }
    mode
}

/// Weighted quantile with linear interpolation between cumulative-density
/// midpoints.
///
/// With equal (or absent) weights the normalisation matches the common
/// convention of popular math packages; for genuinely weighted samples the
/// plain total-weight normalisation is used.
pub fn quantile(values: impl Iterator<Item = (f64, f64)>, q: f64) -> f64 {
    if q.is_nan() || !(0.0..=1.0).contains(&q) {
        return f64::NAN;
    }

    let mut value_weights: Vec<(f64, f64)> = Vec::new();
    let mut total_weight = 0.0;
    let mut equal_weights = true;
    let mut weight_check = f64::NAN;
    for (value, weight) in values {
        if value.is_nan() || weight.is_nan() {
            continue;
        }
        value_weights.push((value, weight));
        total_weight += weight;
        if weight_check.is_nan() {
            weight_check = weight;
        } else if weight_check != weight {
            equal_weights = false;
        }
    }

    if value_weights.is_empty() || total_weight == 0.0 {
        return f64::NAN;
    }
    value_weights.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    if value_weights.len() == 1 || q == 0.0 {
        return value_weights[0].0;
    }
    if q == 1.0 {
        return value_weights[value_weights.len() - 1].0;
    }

    let first_term = 0.5 * value_weights[0].1;
    let last_term = total_weight
        - 0.5 * value_weights[0].1
        - 0.5 * value_weights[value_weights.len() - 1].1;

    let mut accumulated = 0.0;
    let mut previous_cdf = 0.0;
    for (position, &(value, weight)) in value_weights.iter().enumerate() {
        accumulated += weight;
        let mut cdf = accumulated - 0.5 * weight;
        if equal_weights {
            cdf = (cdf - first_term) / last_term;
        } else {
            cdf /= total_weight;
        }

        if position == 0 {
            previous_cdf = cdf;
            if q <= cdf {
                return value;
            }
            continue;
        }

        if q == previous_cdf {
            return value_weights[position - 1].0;
        }
        if q == cdf {
            return value;
        }
        if previous_cdf < q && q < cdf {
            let previous_value = value_weights[position - 1].0;
            return previous_value + (value - previous_value) * (q - previous_cdf) / (cdf - previous_cdf);
        }
        previous_cdf = cdf;
    }

    value_weights[value_weights.len() - 1].0
}

/// Weighted generalized mean with parameter `p` about `center`.
///
/// `calculate_moment` skips the final `1/p` root; `absolute_value` takes
/// absolute differences for the first-order mean.
pub fn generalized_mean(
    values: impl Iterator<Item = (f64, f64)>,
    p: f64,
    center: f64,
    calculate_moment: bool,
    absolute_value: bool,
) -> f64 {
    let mut accumulated = 0.0;
    let mut weight_sum = 0.0;
    let mut any = false;

    for (value, weight) in values {
        if weight == 0.0 {
            continue;
        }
        any = true;
        let diff = value - center;
        weight_sum += weight;
        if p == 0.0 {
            // Geometric: accumulate in log space.
            accumulated += weight * diff.ln();
        } else if (p - 1.0).abs() < f64::EPSILON {
            accumulated += weight * if absolute_value { diff.abs() } else { diff };
        } else if (p - 2.0).abs() < f64::EPSILON {
            accumulated += weight * diff * diff;
        } else if (p + 1.0).abs() < f64::EPSILON {
            accumulated += weight / diff;
        } else {
            accumulated += weight * diff.powf(p);
        }
    }

    if !any || weight_sum == 0.0 {
        return f64::NAN;
    }

    if p == 0.0 {
        let log_mean = accumulated / weight_sum;
        return if calculate_moment { accumulated.exp() } else { log_mean.exp() };
    }

    let mean = accumulated / weight_sum;
    if calculate_moment {
        return mean;
    }
    if (p - 1.0).abs() < f64::EPSILON {
        mean
    } else if (p - 2.0).abs() < f64::EPSILON {
        mean.sqrt()
    } else if (p + 1.0).abs() < f64::EPSILON {
        1.0 / mean
    } else {
        mean.powf(1.0 / p)
    }
}

/// Smallest or largest gap between adjacent distinct sorted values.
///
/// With `find_min` the smallest nonzero gap is returned unless
/// `include_zero` admits duplicates. `cycle_length`, when finite, adds the
/// wrap-around gap between the extremes.
pub fn extreme_difference(
    values: impl Iterator<Item = f64>,
    find_min: bool,
    include_zero: bool,
    cycle_length: Option<f64>,
) -> f64 {
    let mut sorted: Vec<f64> = values.filter(|v| !v.is_nan()).collect();
    if sorted.len() < 2 {
        return f64::NAN;
    }
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let mut extreme = if find_min { f64::INFINITY } else { 0.0 };
    for pair in sorted.windows(2) {
        let gap = pair[1] - pair[0];
        if gap == 0.0 && !include_zero {
            continue;
        }
        extreme = if find_min { extreme.min(gap) } else { extreme.max(gap) };
    }

    if let Some(cycle) = cycle_length {
        let wrap = sorted[0] + (cycle - sorted[sorted.len() - 1]).max(0.0);
        if (wrap != 0.0 || include_zero) && wrap.is_finite() {
            extreme = if find_min { extreme.min(wrap) } else { extreme.max(wrap) };
        }
    }

    if extreme.is_infinite() {
        f64::NAN
    } else {
        extreme
    }
}

/// Total weight carried by each distinct numeric value, NaN bucketed by bit
/// identity.
pub fn value_masses_number(values: impl Iterator<Item = (f64, f64)>) -> Vec<(f64, f64)> {
    let mut masses: FxHashMap<u64, (f64, f64)> = FxHashMap::default();
    for (value, weight) in values {
        let entry = masses.entry(value.to_bits()).or_insert((value, 0.0));
        entry.1 += weight;
    }
    let mut out: Vec<(f64, f64)> = masses.into_values().collect();
    out.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Greater));
    out
}

/// Total weight carried by each distinct string value.
pub fn value_masses_string(
    values: impl Iterator<Item = (StringId, f64)>,
) -> Vec<(StringId, f64)> {
    let mut masses: FxHashMap<StringId, f64> = FxHashMap::default();
    for (value, weight) in values {
        *masses.entry(value).or_insert(0.0) += weight;
    }
    let mut out: Vec<(StringId, f64)> = masses.into_iter().collect();
    out.sort_by_key(|&(id, _)| id);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn unweighted(values: &[f64]) -> impl Iterator<Item = (f64, f64)> + '_ {
        values.iter().map(|&v| (v, 1.0))
    }

    #[test]
    fn sum_ignores_zero_weighted_infinities() {
        assert_eq!(sum([(f64::INFINITY, 0.0), (3.0, 2.0)].into_iter()), 6.0);
    }

    #[test]
    fn mode_prefers_heaviest_value() {
        assert_eq!(mode_number(unweighted(&[1.0, 2.0, 2.0, 3.0])), 2.0);
        assert_eq!(
            mode_number([(5.0, 1.0), (7.0, 10.0)].into_iter()),
            7.0
        );
        // Aggregates over empty input are NaN.
        assert!(mode_number(std::iter::empty()).is_nan());
    }

    #[test]
    fn quantile_median_and_interpolation() {
        assert_eq!(quantile(unweighted(&[1.0, 2.0, 3.0]), 0.5), 2.0);
        assert_eq!(quantile(unweighted(&[1.0, 3.0]), 0.5), 2.0);
        assert_eq!(quantile(unweighted(&[4.0]), 0.9), 4.0);
        assert_eq!(quantile(unweighted(&[1.0, 2.0, 3.0]), 0.0), 1.0);
        assert_eq!(quantile(unweighted(&[1.0, 2.0, 3.0]), 1.0), 3.0);
        assert!(quantile(unweighted(&[]), 0.5).is_nan());
        assert!(quantile(unweighted(&[1.0]), f64::NAN).is_nan());
    }

    #[test]
    fn weighted_quantile_shifts_toward_mass() {
        let median = quantile([(1.0, 1.0), (10.0, 9.0)].into_iter(), 0.5);
        assert!(median > 5.0, "median {median} should lean toward the heavy value");
    }

    #[test]
    fn generalized_means() {
        let values = [2.0, 8.0];
        assert_eq!(generalized_mean(unweighted(&values), 1.0, 0.0, false, false), 5.0);
        assert!((generalized_mean(unweighted(&values), 0.0, 0.0, false, false) - 4.0).abs() < 1e-12);
        assert!((generalized_mean(unweighted(&values), -1.0, 0.0, false, false) - 3.2).abs() < 1e-12);
        let rms = generalized_mean(unweighted(&values), 2.0, 0.0, false, false);
        assert!((rms - 34.0f64.sqrt()).abs() < 1e-12);
        assert!(generalized_mean(unweighted(&[]), 1.0, 0.0, false, false).is_nan());
    }

    #[test]
    fn moment_and_center() {
        let second_moment =
            generalized_mean(unweighted(&[1.0, 3.0]), 2.0, 2.0, true, false);
        assert_eq!(second_moment, 1.0);
        let absolute = generalized_mean(unweighted(&[1.0, 3.0]), 1.0, 2.0, false, true);
        assert_eq!(absolute, 1.0);
    }

    #[test]
    fn extreme_differences() {
        let values = [1.0, 2.0, 2.0, 5.0, 9.0];
        assert_eq!(
            extreme_difference(values.iter().copied(), true, false, None),
            1.0
        );
        assert_eq!(
            extreme_difference(values.iter().copied(), false, false, None),
            4.0
        );
        // Include-zero admits the duplicate gap.
        assert_eq!(
            extreme_difference(values.iter().copied(), true, true, None),
            0.0
        );
        // Cyclic wrap: 1 + (10 - 9).
        assert_eq!(
            extreme_difference(values.iter().copied(), false, false, Some(10.0)),
            4.0
        );
        assert_eq!(
            extreme_difference([8.0, 9.0].iter().copied(), false, false, Some(20.0)),
            19.0
        );
        assert!(extreme_difference([3.0].iter().copied(), true, false, None).is_nan());
    }

    #[test]
    fn value_masses_accumulate_weight() {
        let masses = value_masses_number([(1.0, 1.0), (2.0, 0.5), (1.0, 2.0)].into_iter());
        assert_eq!(masses, vec![(1.0, 3.0), (2.0, 0.5)]);
    }
}
