//! Entity query engine.
//!
//! Queries over a container entity's children run as chains of
//! [`QueryCondition`]s: exact and range predicates served by per-label
//! [`ColumnData`] indices, statistical aggregates, stochastic narrowing,
//! and generalized-distance search with nearest-neighbour retrieval and the
//! `compute-entity-*` family built on it.
//!
//! Reads and mutation notifications synchronise per container through the
//! [`CacheRegistry`]'s reader-writer locks; column reads inside a query
//! take no locks of their own because the surrounding cache lock excludes
//! mutation.

mod caches;
mod column;
mod condition;
mod distance;
mod executor;
mod knn;
mod stats;
mod transform;
mod value;

pub use caches::{CacheRegistry, QueryCaches};
pub use column::{ColumnData, ValueEntry};
pub use condition::{DistanceQuery, QueryCondition, QueryResult};
pub use distance::{
    aggregate_distance, commonality, edit_distance, feature_distance, DistanceParams,
    FeatureOracle, FeatureParam, FeatureType, NullPolicy,
};
pub use executor::{execute, execute_with_registry};
pub use knn::{
    convictions, distance_contributions, group_kl_divergence, kl_divergences, DistanceEngine,
    KnnCache,
};
pub use stats::{
    extreme_difference, generalized_mean, mode_number, mode_string, quantile, sum,
    value_masses_number, value_masses_string,
};
pub use transform::{
    kullback_leibler_divergence, partial_kl_divergence, AdaptiveBandwidth, ContributionMean,
    DistanceTransform,
};
pub use value::{column_value, ColumnValue, ValueType};
