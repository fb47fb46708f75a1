//! K-nearest-neighbour search and the per-entity computations built on it.

use crate::caches::QueryCaches;
use crate::column::ColumnData;
use crate::distance::{aggregate_distance, feature_distance, DistanceParams, FeatureOracle};
use crate::transform::{partial_kl_divergence, DistanceTransform};
use crate::value::{column_value, ColumnValue};
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use sable_entity::Entity;
use sable_ir::NodeManager;
use sable_rand::RandomStream;
use sable_sets::BitSet;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Heap entry for KNN selection: a max-heap of the k best, ties broken by a
/// random tag drawn at insertion so selection has no lexical bias yet stays
/// deterministic under a seed.
struct HeapItem {
    distance: f64,
    tag: u32,
    index: usize,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .partial_cmp(&other.distance)
            .unwrap_or(Ordering::Equal)
            .then(self.tag.cmp(&other.tag))
    }
}

/// Distance computation bound to one container and one set of feature
/// columns.
pub struct DistanceEngine<'a> {
    container: &'a Entity,
    params: &'a DistanceParams,
    columns: Vec<Option<&'a ColumnData>>,
}

impl<'a> DistanceEngine<'a> {
    /// Bind `params` to `container`, reading feature columns from `caches`
    /// where built. Call [`QueryCaches::ensure_column`] for every feature
    /// label first when the cache path is in use.
    pub fn new(container: &'a Entity, caches: &'a QueryCaches, params: &'a DistanceParams) -> Self {
        let columns = params
            .features
            .iter()
            .map(|feature| caches.column(feature.label))
            .collect();
        DistanceEngine {
            container,
            params,
            columns,
        }
    }

    /// Engine with no column oracles, for the brute-force path.
    pub fn without_columns(container: &'a Entity, params: &'a DistanceParams) -> Self {
        DistanceEngine {
            container,
            params,
            columns: vec![None; params.features.len()],
        }
    }

    /// Distance from a query point to the child at `target_index`.
    ///
    /// `query` is parallel to the feature list; its code values live in
    /// `query_manager`.
    pub fn distance_to(
        &self,
        query: &[ColumnValue],
        query_manager: &NodeManager,
        target_index: usize,
    ) -> f64 {
        let Some(child) = self.container.child(target_index) else {
            return f64::INFINITY;
        };
        let terms = self
            .params
            .features
            .iter()
            .zip(query)
            .zip(&self.columns)
            .map(|((feature, query_value), column)| {
                let target_value = column_value(child, feature.label);
                let oracle = FeatureOracle { column: *column };
                let distance = feature_distance(
                    feature,
                    query_value,
                    query_manager,
                    &target_value,
                    child.manager(),
                    &oracle,
                );
                (distance, feature.weight)
            });
        let total = aggregate_distance(terms, self.params.p);
        if total.is_nan() {
            f64::INFINITY
        } else {
            total
        }
    }

    /// The feature values of the child at `index`, usable as a query point.
    pub fn entity_query_point(&self, index: usize) -> Vec<ColumnValue> {
        let Some(child) = self.container.child(index) else {
            return vec![ColumnValue::NotExist; self.params.features.len()];
        };
        self.params
            .features
            .iter()
            .map(|feature| column_value(child, feature.label))
            .collect()
    }

    /// Manager owning the code values of the child at `index`.
    fn child_manager(&self, index: usize) -> &NodeManager {
        self.container
            .child(index)
            .map_or(self.container.manager(), Entity::manager)
    }

    /// The `k` candidates nearest to the query point, ascending by distance
    /// with ties presented in entity order. When `k` exceeds the candidate
    /// count the whole set is returned sorted by distance.
    pub fn nearest(
        &self,
        query: &[ColumnValue],
        query_manager: &NodeManager,
        candidates: &BitSet,
        k: usize,
        exclude: Option<usize>,
        rng: &mut RandomStream,
    ) -> Vec<(usize, f64)> {
        if k == 0 {
            return Vec::new();
        }
        let mut heap: BinaryHeap<HeapItem> = BinaryHeap::with_capacity(k + 1);
        for index in candidates.iter() {
            if exclude == Some(index) {
                continue;
            }
            let distance = self.distance_to(query, query_manager, index);
            let item = HeapItem {
                distance,
                tag: rng.rand_u32(),
                index,
            };
            if heap.len() < k {
                heap.push(item);
            } else if let Some(worst) = heap.peek() {
                if item.cmp(worst) == Ordering::Less {
                    heap.pop();
                    heap.push(item);
                }
            }
        }
        let mut results: Vec<(usize, f64)> =
            heap.into_iter().map(|item| (item.index, item.distance)).collect();
        results.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        results
    }

    /// Every candidate within `max_distance` of the query point.
    pub fn within(
        &self,
        query: &[ColumnValue],
        query_manager: &NodeManager,
        candidates: &BitSet,
        max_distance: f64,
        sort_by_distance: bool,
    ) -> Vec<(usize, f64)> {
        let mut results: Vec<(usize, f64)> = candidates
            .iter()
            .filter_map(|index| {
                let distance = self.distance_to(query, query_manager, index);
                (distance <= max_distance).then_some((index, distance))
            })
            .collect();
        if sort_by_distance {
            results.sort_by(|a, b| {
                a.1.partial_cmp(&b.1)
                    .unwrap_or(Ordering::Equal)
                    .then(a.0.cmp(&b.0))
            });
        }
        results
    }
}

/// Per-entity nearest-neighbour lists, the substrate of the
/// `compute-entity-*` queries.
pub struct KnnCache {
    neighbours: FxHashMap<usize, Vec<(usize, f64)>>,
}

impl KnnCache {
    /// Neighbour list of `entity`, empty when not cached.
    pub fn neighbours(&self, entity: usize) -> &[(usize, f64)] {
        self.neighbours.get(&entity).map_or(&[], Vec::as_slice)
    }

    /// Build the cache: for every entity in `candidates`, its `k` nearest
    /// among the other candidates.
    ///
    /// Entities fan out across the worker pool when `concurrent` is set;
    /// each entity's tie-break stream is forked from the container name and
    /// its own, so results do not depend on scheduling.
    pub fn build(
        engine: &DistanceEngine<'_>,
        candidates: &BitSet,
        k: usize,
        concurrent: bool,
    ) -> Self {
        let indices: Vec<usize> = candidates.iter().collect();
        let compute = |&index: &usize| {
            let query = engine.entity_query_point(index);
            let mut rng = RandomStream::from_seed(&format!(
                "{}::{index}",
                engine.container.name()
            ));
            let list = engine.nearest(
                &query,
                engine.child_manager(index),
                candidates,
                k,
                Some(index),
                &mut rng,
            );
            (index, list)
        };

        let neighbours: FxHashMap<usize, Vec<(usize, f64)>> = if concurrent && indices.len() > 1 {
            indices.par_iter().map(compute).collect()
        } else {
            indices.iter().map(compute).collect()
        };
        tracing::debug!(entities = neighbours.len(), k, "knn cache built");
        KnnCache { neighbours }
    }
}

/// Distance contribution of every entity in `candidates`.
pub fn distance_contributions(
    container: &Entity,
    transform: &DistanceTransform,
    cache: &KnnCache,
    candidates: &BitSet,
) -> Vec<(usize, f64)> {
    candidates
        .iter()
        .map(|index| {
            (
                index,
                transform.distance_contribution(container, index, cache.neighbours(index)),
            )
        })
        .collect()
}

/// Conviction of every entity: the mean distance contribution over the set
/// divided by the entity's own.
pub fn convictions(
    container: &Entity,
    transform: &DistanceTransform,
    cache: &KnnCache,
    candidates: &BitSet,
) -> Vec<(usize, f64)> {
    let contributions = distance_contributions(container, transform, cache, candidates);
    let mean = contributions.iter().map(|&(_, dc)| dc).sum::<f64>()
        / contributions.len().max(1) as f64;
    contributions
        .into_iter()
        .map(|(index, dc)| {
            let conviction = if dc == 0.0 { f64::INFINITY } else { mean / dc };
            (index, conviction)
        })
        .collect()
}

/// KL divergence of each entity's removal.
///
/// For entity `e`, every entity whose neighbour list contains `e` gets its
/// contribution recomputed without `e`; the divergence is the partial KL
/// between the base contribution distribution and the updated one.
pub fn kl_divergences(
    container: &Entity,
    transform: &DistanceTransform,
    cache: &KnnCache,
    candidates: &BitSet,
) -> Vec<(usize, f64)> {
    let base = distance_contributions(container, transform, cache, candidates);
    let total: f64 = base.iter().map(|&(_, dc)| dc).sum();
    if total == 0.0 {
        return base.iter().map(|&(index, _)| (index, 0.0)).collect();
    }
    let probabilities: FxHashMap<usize, f64> =
        base.iter().map(|&(index, dc)| (index, dc / total)).collect();
    let positions: FxHashMap<usize, usize> = base
        .iter()
        .enumerate()
        .map(|(position, &(index, _))| (index, position))
        .collect();
    let p: Vec<f64> = base.iter().map(|&(index, _)| probabilities[&index]).collect();

    base.iter()
        .map(|&(removed, _)| {
            let mut changed: Vec<(usize, f64)> = Vec::new();
            for &(other, _) in &base {
                if other == removed {
                    continue;
                }
                let list = cache.neighbours(other);
                if !list.iter().any(|&(neighbour, _)| neighbour == removed) {
                    continue;
                }
                let filtered: Vec<(usize, f64)> = list
                    .iter()
                    .copied()
                    .filter(|&(neighbour, _)| neighbour != removed)
                    .collect();
                let updated = transform.distance_contribution(container, other, &filtered);
                changed.push((positions[&other], updated / total));
            }
            (removed, partial_kl_divergence(&p, &changed))
        })
        .collect()
}

/// Single KL divergence for removing the whole `group` from the model.
pub fn group_kl_divergence(
    container: &Entity,
    transform: &DistanceTransform,
    cache: &KnnCache,
    candidates: &BitSet,
    group: &BitSet,
) -> f64 {
    let base = distance_contributions(container, transform, cache, candidates);
    let total: f64 = base.iter().map(|&(_, dc)| dc).sum();
    if total == 0.0 {
        return 0.0;
    }
    let positions: FxHashMap<usize, usize> = base
        .iter()
        .enumerate()
        .map(|(position, &(index, _))| (index, position))
        .collect();
    let p: Vec<f64> = base.iter().map(|&(_, dc)| dc / total).collect();

    let mut changed: Vec<(usize, f64)> = Vec::new();
    for &(other, _) in &base {
        if group.contains(other) {
            continue;
        }
        let list = cache.neighbours(other);
        if !list.iter().any(|&(neighbour, _)| group.contains(neighbour)) {
            continue;
        }
        let filtered: Vec<(usize, f64)> = list
            .iter()
            .copied()
            .filter(|&(neighbour, _)| !group.contains(neighbour))
            .collect();
        let updated = transform.distance_contribution(container, other, &filtered);
        changed.push((positions[&other], updated / total));
    }
    partial_kl_divergence(&p, &changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::FeatureParam;
    use pretty_assertions::assert_eq;
    use sable_ir::default_pool;

    fn numeric_container(values: &[f64]) -> Entity {
        let pool = default_pool();
        let mut container = Entity::new("knn", pool.clone());
        for (index, value) in values.iter().enumerate() {
            let mut child = Entity::new(&format!("e{index}"), pool.clone());
            child
                .set_root_from_source(&format!("(list #x {value})"), None)
                .expect("root");
            container.add_child(child, None).expect("add");
        }
        container
    }

    fn params(container: &Entity) -> DistanceParams {
        let x = container.manager().pool().get_id("x");
        DistanceParams::euclidean(vec![FeatureParam::continuous(x)])
    }

    fn all(container: &Entity) -> BitSet {
        (0..container.child_count()).collect()
    }

    #[test]
    fn three_nearest_to_an_external_point() {
        // Points 0,1,4,9,16 queried at 3 with p=2.
        let container = numeric_container(&[0.0, 1.0, 4.0, 9.0, 16.0]);
        let p = params(&container);
        let engine = DistanceEngine::without_columns(&container, &p);
        let mut rng = RandomStream::from_seed("test");

        let results = engine.nearest(
            &[ColumnValue::Number(3.0)],
            container.manager(),
            &all(&container),
            3,
            None,
            &mut rng,
        );
        assert_eq!(results, vec![(2, 1.0), (1, 2.0), (0, 3.0)]);
    }

    #[test]
    fn oversized_k_returns_whole_set_sorted() {
        let container = numeric_container(&[5.0, 1.0, 3.0]);
        let p = params(&container);
        let engine = DistanceEngine::without_columns(&container, &p);
        let mut rng = RandomStream::from_seed("test");
        let results = engine.nearest(
            &[ColumnValue::Number(0.0)],
            container.manager(),
            &all(&container),
            10,
            None,
            &mut rng,
        );
        assert_eq!(results, vec![(1, 1.0), (2, 3.0), (0, 5.0)]);
    }

    #[test]
    fn all_zero_distances_order_by_entity_id() {
        let container = numeric_container(&[7.0, 7.0, 7.0]);
        let p = params(&container);
        let engine = DistanceEngine::without_columns(&container, &p);
        let mut rng = RandomStream::from_seed("ties");
        let results = engine.nearest(
            &[ColumnValue::Number(7.0)],
            container.manager(),
            &all(&container),
            3,
            None,
            &mut rng,
        );
        assert_eq!(results, vec![(0, 0.0), (1, 0.0), (2, 0.0)]);
    }

    #[test]
    fn within_filters_by_radius() {
        let container = numeric_container(&[0.0, 2.0, 5.0, 9.0]);
        let p = params(&container);
        let engine = DistanceEngine::without_columns(&container, &p);
        let results = engine.within(
            &[ColumnValue::Number(1.0)],
            container.manager(),
            &all(&container),
            4.0,
            true,
        );
        assert_eq!(results, vec![(0, 1.0), (1, 1.0), (2, 4.0)]);
    }

    #[test]
    fn knn_cache_and_contributions() {
        let container = numeric_container(&[0.0, 1.0, 10.0]);
        let p = params(&container);
        let engine = DistanceEngine::without_columns(&container, &p);
        let cache = KnnCache::build(&engine, &all(&container), 2, false);

        assert_eq!(cache.neighbours(0), &[(1, 1.0), (2, 10.0)]);
        assert_eq!(cache.neighbours(2)[0], (1, 9.0));

        let transform = DistanceTransform::default();
        let contributions =
            distance_contributions(&container, &transform, &cache, &all(&container));
        assert_eq!(contributions.len(), 3);
        // The outlier contributes the largest distances.
        let dc: FxHashMap<usize, f64> = contributions.into_iter().collect();
        assert!(dc[&2] > dc[&0]);

        let convictions = convictions(&container, &transform, &cache, &all(&container));
        let conviction: FxHashMap<usize, f64> = convictions.into_iter().collect();
        // Outliers have conviction below 1, typical entities above.
        assert!(conviction[&2] < 1.0);
        assert!(conviction[&0] > 1.0);
    }

    #[test]
    fn removal_divergence_is_nonnegative_and_larger_for_informative_entities() {
        let container = numeric_container(&[0.0, 0.5, 1.0, 20.0]);
        let p = params(&container);
        let engine = DistanceEngine::without_columns(&container, &p);
        let cache = KnnCache::build(&engine, &all(&container), 3, false);
        let transform = DistanceTransform::default();

        let divergences = kl_divergences(&container, &transform, &cache, &all(&container));
        for &(_, kl) in &divergences {
            assert!(kl.is_finite());
        }

        let group: BitSet = [3].into_iter().collect();
        let group_kl =
            group_kl_divergence(&container, &transform, &cache, &all(&container), &group);
        assert!(group_kl.is_finite());
    }
}
