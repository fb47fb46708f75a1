//! Query conditions: the chain elements the executor evaluates.

use crate::distance::DistanceParams;
use crate::transform::{AdaptiveBandwidth, DistanceTransform};
use crate::value::ColumnValue;
use sable_intern::StringId;

/// A generalized-distance query: feature configuration, a query point, and
/// the transform applied to resulting distances.
#[derive(Clone, Debug)]
pub struct DistanceQuery {
    /// Feature configuration and Minkowski exponent.
    pub params: DistanceParams,
    /// Query point, parallel to the features. Code values resolve in the
    /// container's manager. Empty for per-entity computations, where each
    /// entity is its own query point.
    pub values: Vec<ColumnValue>,
    /// Distance transform and entity weighting.
    pub transform: DistanceTransform,
    /// Optional adaptive neighbourhood sizing.
    pub bandwidth: Option<AdaptiveBandwidth>,
}

/// One element of a query-condition chain. Conditions apply left to right;
/// each narrows, re-ranks, reduces, or replaces the working set.
#[derive(Clone, Debug)]
pub enum QueryCondition {
    /// Intersect with the named entities.
    InEntityList(Vec<StringId>),
    /// Subtract the named entities.
    NotInEntityList(Vec<StringId>),
    /// Keep entities carrying every listed label.
    Exists(Vec<StringId>),
    /// Keep entities carrying none of the listed labels.
    NotExists(Vec<StringId>),
    /// Keep entities whose value at the label equals the given one.
    Equals(StringId, ColumnValue),
    /// Keep entities whose value at the label differs from the given one.
    NotEquals(StringId, ColumnValue),
    /// Keep entities whose value lies in `[low, high]`.
    Between {
        /// Label queried.
        label: StringId,
        /// Lower endpoint; NaN widens to −∞ and admits NaN values.
        low: ColumnValue,
        /// Upper endpoint; NaN widens to +∞ and admits NaN values.
        high: ColumnValue,
    },
    /// Keep entities whose value lies outside `[low, high]`.
    NotBetween {
        /// Label queried.
        label: StringId,
        /// Lower endpoint.
        low: ColumnValue,
        /// Upper endpoint.
        high: ColumnValue,
    },
    /// Keep entities whose value is among the listed ones.
    Among {
        /// Label queried.
        label: StringId,
        /// Literal membership set.
        values: Vec<ColumnValue>,
    },
    /// Keep entities whose value is not among the listed ones.
    NotAmong {
        /// Label queried.
        label: StringId,
        /// Literal membership set.
        values: Vec<ColumnValue>,
    },
    /// Keep the `count` entities with the largest values at the label.
    Max {
        /// Label queried.
        label: StringId,
        /// How many to keep.
        count: usize,
    },
    /// Keep the `count` entities with the smallest values at the label.
    Min {
        /// Label queried.
        label: StringId,
        /// How many to keep.
        count: usize,
    },
    /// Terminal: weighted sum of values at the label.
    Sum {
        /// Label summed.
        label: StringId,
        /// Optional weight label.
        weight_label: Option<StringId>,
    },
    /// Terminal: weighted mode of values at the label.
    Mode {
        /// Label queried.
        label: StringId,
        /// Optional weight label.
        weight_label: Option<StringId>,
    },
    /// Terminal: weighted quantile of numeric values.
    Quantile {
        /// Label queried.
        label: StringId,
        /// Quantile in `[0, 1]`.
        q: f64,
        /// Optional weight label.
        weight_label: Option<StringId>,
    },
    /// Terminal: weighted generalized mean of numeric values.
    GeneralizedMean {
        /// Label queried.
        label: StringId,
        /// Mean parameter.
        p: f64,
        /// Center subtracted from each value.
        center: f64,
        /// Skip the final `1/p` root.
        calculate_moment: bool,
        /// Take absolute differences for `p = 1`.
        absolute_value: bool,
        /// Optional weight label.
        weight_label: Option<StringId>,
    },
    /// Terminal: smallest gap between adjacent distinct values.
    MinDifference {
        /// Label queried.
        label: StringId,
        /// Cycle length for wrap-around gaps.
        cycle_length: Option<f64>,
        /// Admit zero gaps from duplicate values.
        include_zero: bool,
    },
    /// Terminal: largest gap between adjacent distinct values.
    MaxDifference {
        /// Label queried.
        label: StringId,
        /// Cycle length for wrap-around gaps.
        cycle_length: Option<f64>,
    },
    /// Terminal: total weight per distinct value.
    ValueMasses {
        /// Label queried.
        label: StringId,
        /// Optional weight label.
        weight_label: Option<StringId>,
    },
    /// Keep entities within `max_distance` of the query point, optionally
    /// re-ranked by distance.
    WithinDistance {
        /// Distance configuration and query point.
        query: DistanceQuery,
        /// Inclusive distance bound.
        max_distance: f64,
        /// Return pairs ranked by distance instead of an ID set.
        sort_by_distance: bool,
    },
    /// Rank by distance to the query point and truncate to `k`.
    NearestDistance {
        /// Distance configuration and query point.
        query: DistanceQuery,
        /// Neighbour count.
        k: usize,
    },
    /// Uniform sample of `count` entities, with replacement.
    Sample {
        /// Sample size.
        count: usize,
        /// Seed overriding the executor's stream.
        seed: Option<String>,
    },
    /// Weighted sample of `count` entities, with replacement.
    WeightedSample {
        /// Label carrying the weights.
        label: StringId,
        /// Sample size.
        count: usize,
        /// Seed overriding the executor's stream.
        seed: Option<String>,
    },
    /// Deterministic window: `count` entities, optionally starting at an
    /// offset, with an optional shuffle.
    ///
    /// When an offset is present the whole candidate vector is shuffled —
    /// burning one draw per element — so the same seed yields the same
    /// window no matter the offset. Without one, only the returned prefix
    /// is shuffled.
    Select {
        /// Window size.
        count: usize,
        /// Entities skipped before the window; `Some(0)` still selects the
        /// resumable full-shuffle behaviour.
        offset: Option<usize>,
        /// Seed for the shuffle; None keeps ID order.
        seed: Option<String>,
    },
    /// Terminal: cardinality of the working set.
    Count,
    /// Terminal: distance contribution per entity.
    ComputeDistanceContributions {
        /// Distance configuration; the query point is each entity itself.
        query: DistanceQuery,
        /// Neighbourhood size.
        k: usize,
    },
    /// Terminal: conviction per entity.
    ComputeConvictions {
        /// Distance configuration.
        query: DistanceQuery,
        /// Neighbourhood size.
        k: usize,
    },
    /// Terminal: KL divergence of each entity's removal.
    ComputeKlDivergences {
        /// Distance configuration.
        query: DistanceQuery,
        /// Neighbourhood size.
        k: usize,
    },
    /// Terminal: KL divergence of removing the current working set from the
    /// whole container.
    ComputeGroupKlDivergence {
        /// Distance configuration.
        query: DistanceQuery,
        /// Neighbourhood size.
        k: usize,
    },
}

impl QueryCondition {
    /// True when the condition has an indexed path through the query cache.
    ///
    /// Code-valued comparisons have no indexed form — the column only
    /// buckets code by size — so chains containing them run brute force.
    pub fn cache_supported(&self) -> bool {
        fn indexable(value: &ColumnValue) -> bool {
            !matches!(value, ColumnValue::Code { .. })
        }
        match self {
            QueryCondition::Equals(_, value) | QueryCondition::NotEquals(_, value) => {
                indexable(value)
            }
            QueryCondition::Between { low, high, .. }
            | QueryCondition::NotBetween { low, high, .. } => indexable(low) && indexable(high),
            QueryCondition::Among { values, .. } | QueryCondition::NotAmong { values, .. } => {
                values.iter().all(indexable)
            }
            _ => true,
        }
    }

    /// Labels whose columns the indexed path consults, appended to `out`.
    /// Building these up front lets the query itself run under a read lock.
    pub fn indexed_labels(&self, out: &mut Vec<StringId>) {
        match self {
            QueryCondition::Exists(labels) | QueryCondition::NotExists(labels) => {
                out.extend_from_slice(labels);
            }
            QueryCondition::Equals(label, _)
            | QueryCondition::NotEquals(label, _)
            | QueryCondition::Between { label, .. }
            | QueryCondition::NotBetween { label, .. }
            | QueryCondition::Among { label, .. }
            | QueryCondition::NotAmong { label, .. }
            | QueryCondition::Max { label, .. }
            | QueryCondition::Min { label, .. } => out.push(*label),
            QueryCondition::WithinDistance { query, .. }
            | QueryCondition::NearestDistance { query, .. }
            | QueryCondition::ComputeDistanceContributions { query, .. }
            | QueryCondition::ComputeConvictions { query, .. }
            | QueryCondition::ComputeKlDivergences { query, .. }
            | QueryCondition::ComputeGroupKlDivergence { query, .. } => {
                out.extend(query.params.features.iter().map(|f| f.label));
            }
            _ => {}
        }
    }

    /// True for the `compute-entity-*` conditions, which require the cache
    /// path.
    pub fn requires_cache(&self) -> bool {
        matches!(
            self,
            QueryCondition::ComputeDistanceContributions { .. }
                | QueryCondition::ComputeConvictions { .. }
                | QueryCondition::ComputeKlDivergences { .. }
                | QueryCondition::ComputeGroupKlDivergence { .. }
        )
    }
}

/// Result of a condition chain.
#[derive(Clone, Debug, PartialEq)]
pub enum QueryResult {
    /// Entity indices in natural order of their names.
    Ids(Vec<usize>),
    /// Entity indices paired with a per-entity scalar (distance or
    /// computed value).
    IdsWithValues(Vec<(usize, f64)>),
    /// A single numeric value; NaN for aggregates over empty sets.
    Number(f64),
    /// A single string value.
    String(StringId),
    /// Null: the query produced nothing.
    Null,
    /// Weight mass per distinct numeric value.
    NumberMasses(Vec<(f64, f64)>),
    /// Weight mass per distinct string value.
    StringMasses(Vec<(StringId, f64)>),
    /// Cardinality of the working set.
    Count(usize),
}
