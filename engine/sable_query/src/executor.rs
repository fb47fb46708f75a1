//! Query executor: evaluates condition chains against a container.
//!
//! Conditions chain left to right. Filters narrow the working set; an
//! aggregate or terminal condition ends the chain with its result; a chain
//! that runs out of conditions yields the working set's entity indices in
//! natural order of their names.
//!
//! Dispatch: when every condition has an indexed path the chain runs
//! against the container's query caches; otherwise it falls back to brute
//! force over the children. The `compute-entity-*` conditions always
//! require the cache path.

use crate::caches::{CacheRegistry, QueryCaches};
use crate::condition::{DistanceQuery, QueryCondition, QueryResult};
use crate::knn::{self, DistanceEngine, KnnCache};
use crate::stats;
use crate::value::{column_value, ColumnValue, ValueType};
use sable_entity::Entity;
use sable_intern::{natural_compare, StringId};
use sable_rand::{weighted_sample_index, AliasTable, RandomStream};
use sable_sets::BitSet;
use std::cmp::Ordering;

/// Candidate-set size from which per-entity KNN computations fan out
/// across the worker pool.
const CONCURRENT_KNN_THRESHOLD: usize = 16;

/// Evaluate `conditions` against `container`, choosing the cached or
/// brute-force path by the dispatch rule.
///
/// The columns the chain touches are built under a brief write lock; the
/// query itself runs under the downgraded read lock, so concurrent readers
/// of the same container proceed in parallel.
pub fn execute_with_registry(
    container: &Entity,
    registry: &CacheRegistry,
    conditions: &[QueryCondition],
    rng: &mut RandomStream,
) -> QueryResult {
    // compute-entity-* conditions have no brute-force form, so their
    // presence forces the cache path regardless of the rest of the chain.
    let must_use_cache = conditions.iter().any(QueryCondition::requires_cache);
    if must_use_cache || conditions.iter().all(QueryCondition::cache_supported) {
        let caches = registry.for_container(container);
        let mut write = caches.write();
        ensure_indexed_columns(container, &mut write, conditions);
        let read = parking_lot::RwLockWriteGuard::downgrade(write);
        execute_inner(container, Some(&*read), conditions, rng)
    } else {
        tracing::debug!("condition chain not indexable, using brute force");
        execute_inner(container, None, conditions, rng)
    }
}

fn ensure_indexed_columns(
    container: &Entity,
    caches: &mut QueryCaches,
    conditions: &[QueryCondition],
) {
    let mut labels = Vec::new();
    for condition in conditions {
        condition.indexed_labels(&mut labels);
    }
    labels.sort_unstable();
    labels.dedup();
    for label in labels {
        caches.ensure_column(container, label);
    }
}

/// Evaluate `conditions` with an explicit cache choice: `Some` runs the
/// indexed path, `None` brute force.
///
/// Passing `None` together with a `compute-entity-*` condition is a caller
/// defect: those conditions exist only on the cache path. Debug builds
/// fail loudly; release builds warn and yield null.
pub fn execute(
    container: &Entity,
    caches: Option<&mut QueryCaches>,
    conditions: &[QueryCondition],
    rng: &mut RandomStream,
) -> QueryResult {
    match caches {
        Some(caches) => {
            ensure_indexed_columns(container, caches, conditions);
            execute_inner(container, Some(&*caches), conditions, rng)
        }
        None => {
            let needs_cache = conditions.iter().any(QueryCondition::requires_cache);
            debug_assert!(
                !needs_cache,
                "compute-entity-* conditions require the cache path"
            );
            if needs_cache {
                tracing::warn!("compute-entity-* condition without caches yields null");
                return QueryResult::Null;
            }
            execute_inner(container, None, conditions, rng)
        }
    }
}

fn execute_inner(
    container: &Entity,
    caches: Option<&QueryCaches>,
    conditions: &[QueryCondition],
    rng: &mut RandomStream,
) -> QueryResult {
    let mut working: BitSet = (0..container.child_count()).collect();
    let last_position = conditions.len().saturating_sub(1);

    for (position, condition) in conditions.iter().enumerate() {
        let is_last = position == last_position;
        match condition {
            QueryCondition::InEntityList(names) => {
                let listed = ids_from_names(container, names);
                working.intersect_with(&listed);
            }
            QueryCondition::NotInEntityList(names) => {
                let listed = ids_from_names(container, names);
                working.subtract(&listed);
            }
            QueryCondition::Exists(labels) => {
                for &label in labels {
                    let present = label_present(container, caches, label);
                    working.intersect_with(&present);
                }
            }
            QueryCondition::NotExists(labels) => {
                for &label in labels {
                    let present = label_present(container, caches, label);
                    working.subtract(&present);
                }
            }
            QueryCondition::Equals(label, value) => {
                let matched =
                    matching_values(container, caches, *label, value, &working);
                working = matched;
            }
            QueryCondition::NotEquals(label, value) => {
                let matched =
                    matching_values(container, caches, *label, value, &working);
                working.subtract(&matched);
            }
            QueryCondition::Between { label, low, high } => {
                let matched = matching_range(
                    container,
                    caches,
                    *label,
                    low,
                    high,
                    true,
                    &working,
                );
                working = matched;
            }
            QueryCondition::NotBetween { label, low, high } => {
                let matched = matching_range(
                    container,
                    caches,
                    *label,
                    low,
                    high,
                    false,
                    &working,
                );
                working = matched;
            }
            QueryCondition::Among { label, values } => {
                let mut matched = BitSet::new();
                for value in values {
                    let hits =
                        matching_values(container, caches, *label, value, &working);
                    matched.union_with(&hits);
                }
                working = matched;
            }
            QueryCondition::NotAmong { label, values } => {
                for value in values {
                    let hits =
                        matching_values(container, caches, *label, value, &working);
                    working.subtract(&hits);
                }
            }
            QueryCondition::Max { label, count } | QueryCondition::Min { label, count } => {
                let want_max = matches!(condition, QueryCondition::Max { .. });
                working = extreme_entities(
                    container,
                    caches,
                    *label,
                    *count,
                    want_max,
                    &working,
                );
            }

            QueryCondition::Sum { label, weight_label } => {
                return QueryResult::Number(stats::sum(number_values(
                    container,
                    &working,
                    *label,
                    *weight_label,
                )));
            }
            QueryCondition::Mode { label, weight_label } => {
                return mode_result(container, &working, *label, *weight_label);
            }
            QueryCondition::Quantile {
                label,
                q,
                weight_label,
            } => {
                return QueryResult::Number(stats::quantile(
                    number_values(container, &working, *label, *weight_label),
                    *q,
                ));
            }
            QueryCondition::GeneralizedMean {
                label,
                p,
                center,
                calculate_moment,
                absolute_value,
                weight_label,
            } => {
                return QueryResult::Number(stats::generalized_mean(
                    number_values(container, &working, *label, *weight_label),
                    *p,
                    *center,
                    *calculate_moment,
                    *absolute_value,
                ));
            }
            QueryCondition::MinDifference {
                label,
                cycle_length,
                include_zero,
            } => {
                let values = number_values(container, &working, *label, None).map(|(v, _)| v);
                return QueryResult::Number(stats::extreme_difference(
                    values,
                    true,
                    *include_zero,
                    *cycle_length,
                ));
            }
            QueryCondition::MaxDifference {
                label,
                cycle_length,
            } => {
                let values = number_values(container, &working, *label, None).map(|(v, _)| v);
                return QueryResult::Number(stats::extreme_difference(
                    values,
                    false,
                    false,
                    *cycle_length,
                ));
            }
            QueryCondition::ValueMasses { label, weight_label } => {
                return value_masses_result(container, &working, *label, *weight_label);
            }

            QueryCondition::WithinDistance {
                query,
                max_distance,
                sort_by_distance,
            } => {
                let pairs = distance_pairs(container, caches, query, &working);
                let mut kept: Vec<(usize, f64)> = pairs
                    .into_iter()
                    .filter(|&(_, d)| d <= *max_distance)
                    .collect();
                if *sort_by_distance {
                    let mut transformed = kept;
                    query
                        .transform
                        .transform_distances(container, &mut transformed, true);
                    if is_last {
                        return QueryResult::IdsWithValues(transformed);
                    }
                    working = transformed.iter().map(|&(index, _)| index).collect();
                } else {
                    kept.sort_by_key(|&(index, _)| index);
                    working = kept.iter().map(|&(index, _)| index).collect();
                }
            }
            QueryCondition::NearestDistance { query, k } => {
                let mut pairs = distance_pairs(container, caches, query, &working);
                pairs.sort_by(|a, b| {
                    a.1.partial_cmp(&b.1)
                        .unwrap_or(Ordering::Equal)
                        .then(a.0.cmp(&b.0))
                });
                let keep = match &query.bandwidth {
                    Some(bandwidth) if !pairs.is_empty() => bandwidth.cutoff(&pairs).max(1),
                    _ => *k,
                }
                .min(pairs.len());
                pairs.truncate(keep);
                query
                    .transform
                    .transform_distances(container, &mut pairs, true);
                if is_last {
                    return QueryResult::IdsWithValues(pairs);
                }
                working = pairs.iter().map(|&(index, _)| index).collect();
            }

            QueryCondition::Sample { count, seed } => {
                let mut stream = condition_stream(seed.as_deref(), rng);
                let candidates: Vec<usize> = working.iter().collect();
                if candidates.is_empty() || *count == 0 {
                    working.clear();
                    continue;
                }
                let sampled: Vec<usize> = (0..*count)
                    .map(|_| candidates[stream.rand_index(candidates.len())])
                    .collect();
                if is_last {
                    return QueryResult::Ids(sampled);
                }
                working = sampled.into_iter().collect();
            }
            QueryCondition::WeightedSample { label, count, seed } => {
                let mut stream = condition_stream(seed.as_deref(), rng);
                let candidates: Vec<usize> = working.iter().collect();
                let weights: Vec<f64> = candidates
                    .iter()
                    .map(|&index| {
                        container
                            .child(index)
                            .and_then(|child| child.number_at_label(*label))
                            .map_or(0.0, |w| if w.is_nan() { 0.0 } else { w })
                    })
                    .collect();

                let sampled: Vec<usize> = if *count == 1 {
                    weighted_sample_index(&weights, &mut stream)
                        .map(|position| candidates[position])
                        .into_iter()
                        .collect()
                } else {
                    match AliasTable::new(&weights) {
                        Some(table) => (0..*count)
                            .map(|_| candidates[table.sample(&mut stream)])
                            .collect(),
                        // Zero total weight samples nothing.
                        None => Vec::new(),
                    }
                };
                if is_last {
                    return QueryResult::Ids(sampled);
                }
                working = sampled.into_iter().collect();
            }
            QueryCondition::Select {
                count,
                offset,
                seed,
            } => {
                let mut ids = natural_order_ids(container, &working);
                let start = offset.unwrap_or(0).min(ids.len());
                let keep = (*count).min(ids.len() - start);
                if keep == 0 {
                    working.clear();
                    continue;
                }
                if let Some(seed) = seed {
                    let mut stream = RandomStream::from_seed(seed);
                    if offset.is_some() {
                        // Shuffle everything so the same seed yields the
                        // same window no matter the offset: the draw count
                        // must not depend on it.
                        for position in 0..ids.len() {
                            let other = stream.rand_index(ids.len());
                            ids.swap(position, other);
                        }
                    } else {
                        for position in 0..keep {
                            let other = stream.rand_index(ids.len());
                            ids.swap(position, other);
                        }
                    }
                }
                let window: Vec<usize> = ids[start..start + keep].to_vec();
                if is_last {
                    return QueryResult::Ids(window);
                }
                working = window.into_iter().collect();
            }

            QueryCondition::Count => {
                return QueryResult::Count(working.len());
            }

            QueryCondition::ComputeDistanceContributions { query, k }
            | QueryCondition::ComputeConvictions { query, k }
            | QueryCondition::ComputeKlDivergences { query, k }
            | QueryCondition::ComputeGroupKlDivergence { query, k } => {
                let Some(caches) = caches else {
                    // These computations only exist on the cache path.
                    return QueryResult::Null;
                };
                return compute_entity_result(container, caches, condition, query, *k, &working);
            }
        }
    }

    QueryResult::Ids(natural_order_ids(container, &working))
}

// -- Working-set helpers --

fn ids_from_names(container: &Entity, names: &[StringId]) -> BitSet {
    names
        .iter()
        .filter_map(|&name| container.child_index(name))
        .collect()
}

/// Entity indices in natural order of their names.
fn natural_order_ids(container: &Entity, working: &BitSet) -> Vec<usize> {
    let mut named: Vec<(String, usize)> = working
        .iter()
        .filter_map(|index| {
            container
                .child(index)
                .map(|child| (child.name().to_owned(), index))
        })
        .collect();
    named.sort_by(|a, b| natural_compare(&a.0, &b.0));
    named.into_iter().map(|(_, index)| index).collect()
}

fn label_present(
    container: &Entity,
    caches: Option<&QueryCaches>,
    label: StringId,
) -> BitSet {
    match caches.and_then(|c| c.column(label)) {
        Some(column) => {
            let mut present = BitSet::new();
            column.number_indices.union_into_bits(&mut present);
            column.string_indices.union_into_bits(&mut present);
            column.code_indices.union_into_bits(&mut present);
            column.null_indices.union_into_bits(&mut present);
            present
        }
        None => (0..container.child_count())
            .filter(|&index| {
                container
                    .child(index)
                    .is_some_and(|child| child.lookup_label(label).is_some())
            })
            .collect(),
    }
}

fn matching_values(
    container: &Entity,
    caches: Option<&QueryCaches>,
    label: StringId,
    wanted: &ColumnValue,
    working: &BitSet,
) -> BitSet {
    let mut matched = match caches.and_then(|c| c.column(label)) {
        Some(column) => {
            let mut out = BitSet::new();
            column.find_equal(wanted, &mut out);
            if let ColumnValue::Code { .. } = wanted {
                // The size bucket over-approximates; keep structural
                // matches only.
                let candidates: Vec<usize> = out.iter().collect();
                out.clear();
                for index in candidates {
                    if entity_value_equals(container, index, label, wanted) {
                        out.insert(index);
                    }
                }
            }
            out
        }
        None => (0..container.child_count())
            .filter(|&index| entity_value_equals(container, index, label, wanted))
            .collect(),
    };
    matched.intersect_with(working);
    matched
}

fn entity_value_equals(
    container: &Entity,
    index: usize,
    label: StringId,
    wanted: &ColumnValue,
) -> bool {
    let Some(child) = container.child(index) else {
        return false;
    };
    let held = column_value(child, label);
    match (&held, wanted) {
        (ColumnValue::Null, ColumnValue::Null) => true,
        (ColumnValue::NotExist, ColumnValue::NotExist) => true,
        (ColumnValue::Number(a), ColumnValue::Number(b)) => {
            if a.is_nan() || b.is_nan() {
                a.is_nan() && b.is_nan()
            } else {
                a == b
            }
        }
        (ColumnValue::String(a), ColumnValue::String(b)) => a == b,
        (ColumnValue::Code { node: held_node, .. }, ColumnValue::Code { node: wanted_node, .. }) => {
            // Identity fast path, then structural comparison across
            // managers.
            if held_node == wanted_node && std::ptr::eq(child.manager(), container.manager()) {
                return true;
            }
            let wanted_size = container.manager().deep_size(*wanted_node);
            child.manager().deep_size(*held_node) == wanted_size
                && crate::distance::commonality(
                    container.manager(),
                    *wanted_node,
                    child.manager(),
                    *held_node,
                ) == wanted_size
        }
        _ => false,
    }
}

fn matching_range(
    container: &Entity,
    caches: Option<&QueryCaches>,
    label: StringId,
    low: &ColumnValue,
    high: &ColumnValue,
    between: bool,
    working: &BitSet,
) -> BitSet {
    let mut matched = match caches.and_then(|c| c.column(label)) {
        Some(column) => {
            let mut out = BitSet::new();
            column.find_within_range(low, high, between, &mut out);
            out
        }
        None => (0..container.child_count())
            .filter(|&index| {
                let Some(child) = container.child(index) else {
                    return false;
                };
                value_in_range(container, &column_value(child, label), low, high, between)
            })
            .collect(),
    };
    matched.intersect_with(working);
    matched
}

fn value_in_range(
    container: &Entity,
    value: &ColumnValue,
    low: &ColumnValue,
    high: &ColumnValue,
    between: bool,
) -> bool {
    match (value, low, high) {
        (ColumnValue::Number(v), ColumnValue::Number(lo), ColumnValue::Number(hi)) => {
            if lo.is_nan() && hi.is_nan() {
                return v.is_nan() == between;
            }
            if v.is_nan() {
                // NaN values match when either endpoint is NaN.
                return (lo.is_nan() || hi.is_nan()) == between;
            }
            let lo = if lo.is_nan() { f64::NEG_INFINITY } else { *lo };
            let hi = if hi.is_nan() { f64::INFINITY } else { *hi };
            (*v >= lo && *v <= hi) == between
        }
        (ColumnValue::String(v), ColumnValue::String(lo), ColumnValue::String(hi)) => {
            let pool = container.manager().pool();
            let text = pool.get(*v);
            let above = *lo == StringId::NOT_A_STRING
                || natural_compare(&pool.get(*lo), &text) != Ordering::Greater;
            let below = *hi == StringId::NOT_A_STRING
                || natural_compare(&text, &pool.get(*hi)) != Ordering::Greater;
            (above && below) == between
        }
        _ => false,
    }
}

fn extreme_entities(
    container: &Entity,
    caches: Option<&QueryCaches>,
    label: StringId,
    count: usize,
    want_max: bool,
    working: &BitSet,
) -> BitSet {
    match caches.and_then(|c| c.column(label)) {
        Some(column) => {
            let value_type = if column.number_entries().is_empty() {
                ValueType::String
            } else {
                ValueType::Number
            };
            let mut out = BitSet::new();
            column.find_min_max(value_type, count, want_max, Some(working), &mut out);
            out
        }
        None => {
            let mut numbered: Vec<(f64, usize)> = working
                .iter()
                .filter_map(|index| {
                    container
                        .child(index)
                        .and_then(|child| column_value(child, label).as_number())
                        .filter(|v| !v.is_nan())
                        .map(|v| (v, index))
                })
                .collect();
            numbered.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));
            if want_max {
                numbered.reverse();
            }
            numbered
                .into_iter()
                .take(count)
                .map(|(_, index)| index)
                .collect()
        }
    }
}

// -- Aggregate helpers --

fn entity_weight(container: &Entity, index: usize, weight_label: Option<StringId>) -> f64 {
    let Some(label) = weight_label else {
        return 1.0;
    };
    container
        .child(index)
        .and_then(|child| child.number_at_label(label))
        .map_or(1.0, |w| if w.is_nan() { 0.0 } else { w })
}

fn number_values<'a>(
    container: &'a Entity,
    working: &'a BitSet,
    label: StringId,
    weight_label: Option<StringId>,
) -> impl Iterator<Item = (f64, f64)> + 'a {
    working.iter().filter_map(move |index| {
        let child = container.child(index)?;
        let value = column_value(child, label).as_number()?;
        Some((value, entity_weight(container, index, weight_label)))
    })
}

fn string_values<'a>(
    container: &'a Entity,
    working: &'a BitSet,
    label: StringId,
    weight_label: Option<StringId>,
) -> impl Iterator<Item = (StringId, f64)> + 'a {
    working.iter().filter_map(move |index| {
        let child = container.child(index)?;
        let value = column_value(child, label).as_string()?;
        Some((value, entity_weight(container, index, weight_label)))
    })
}

fn mode_result(
    container: &Entity,
    working: &BitSet,
    label: StringId,
    weight_label: Option<StringId>,
) -> QueryResult {
    let has_numbers = number_values(container, working, label, weight_label)
        .next()
        .is_some();
    if has_numbers {
        QueryResult::Number(stats::mode_number(number_values(
            container,
            working,
            label,
            weight_label,
        )))
    } else {
        match stats::mode_string(string_values(container, working, label, weight_label)) {
            Some(mode) => QueryResult::String(mode),
            None => QueryResult::Null,
        }
    }
}

fn value_masses_result(
    container: &Entity,
    working: &BitSet,
    label: StringId,
    weight_label: Option<StringId>,
) -> QueryResult {
    let has_numbers = number_values(container, working, label, weight_label)
        .next()
        .is_some();
    if has_numbers {
        QueryResult::NumberMasses(stats::value_masses_number(number_values(
            container,
            working,
            label,
            weight_label,
        )))
    } else {
        QueryResult::StringMasses(stats::value_masses_string(string_values(
            container,
            working,
            label,
            weight_label,
        )))
    }
}

// -- Distance helpers --

fn distance_pairs(
    container: &Entity,
    caches: Option<&QueryCaches>,
    query: &DistanceQuery,
    working: &BitSet,
) -> Vec<(usize, f64)> {
    let engine = match caches {
        Some(caches) => DistanceEngine::new(container, caches, &query.params),
        None => DistanceEngine::without_columns(container, &query.params),
    };
    engine.within(
        &query.values,
        container.manager(),
        working,
        f64::INFINITY,
        false,
    )
}

fn condition_stream(seed: Option<&str>, rng: &mut RandomStream) -> RandomStream {
    match seed {
        Some(seed) => RandomStream::from_seed(seed),
        None => rng.fork_via_rand(),
    }
}

fn compute_entity_result(
    container: &Entity,
    caches: &QueryCaches,
    condition: &QueryCondition,
    query: &DistanceQuery,
    k: usize,
    working: &BitSet,
) -> QueryResult {
    let engine = DistanceEngine::new(container, caches, &query.params);
    let concurrent = working.len() >= CONCURRENT_KNN_THRESHOLD;

    match condition {
        QueryCondition::ComputeDistanceContributions { .. } => {
            let cache = KnnCache::build(&engine, working, k, concurrent);
            let mut pairs =
                knn::distance_contributions(container, &query.transform, &cache, working);
            pairs.sort_by_key(|&(index, _)| index);
            QueryResult::IdsWithValues(pairs)
        }
        QueryCondition::ComputeConvictions { .. } => {
            let cache = KnnCache::build(&engine, working, k, concurrent);
            let mut pairs = knn::convictions(container, &query.transform, &cache, working);
            pairs.sort_by_key(|&(index, _)| index);
            QueryResult::IdsWithValues(pairs)
        }
        QueryCondition::ComputeKlDivergences { .. } => {
            let cache = KnnCache::build(&engine, working, k, concurrent);
            let mut pairs = knn::kl_divergences(container, &query.transform, &cache, working);
            pairs.sort_by_key(|&(index, _)| index);
            QueryResult::IdsWithValues(pairs)
        }
        QueryCondition::ComputeGroupKlDivergence { .. } => {
            // The group is the working set; the model is every child.
            let everyone: BitSet = (0..container.child_count()).collect();
            let cache = KnnCache::build(&engine, &everyone, k, concurrent);
            QueryResult::Number(knn::group_kl_divergence(
                container,
                &query.transform,
                &cache,
                &everyone,
                working,
            ))
        }
        _ => QueryResult::Null,
    }
}
