//! Keyed aggregation on top of the map-reduce pipeline.
//!
//! A [`MapAggregator<U, X>`] runs a pipeline of `(U, X)` pairs and reduces
//! every key independently, returning a sorted `BTreeMap<U, S>`. Further
//! `aggregate_by*` calls combine the current key with a new one into a
//! [`CombinedIndex`].
//!
//! Keys declared for zero-fill always appear in the result, holding
//! `identity()` when nothing matched. With nested keys the completion runs
//! level by level: the outer keys are completed first, then every outer key
//! is paired with its present inner keys plus the inner declared keys.

mod index;

pub use index::{CombinedIndex, nest};

use crate::digest::QuantileAccumulator;
use crate::error::{EngineError, EngineResult};
use crate::pipeline::stage::Stage;
use crate::pipeline::{MapReducer, MeanState, Timestamped, WeightedValue};
use crate::splitter::{RegionSplitter, Splittable};
use crate::time::Timestamp;
use crate::types::{EntityVersion, OsmType};
use geo_types::MultiPolygon;
use index::{KeyCompleter, base_completer, nested_completer};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

/// A map-reduce query whose result is grouped by a key of type `U`.
pub struct MapAggregator<U, X> {
    reducer: MapReducer<(U, X)>,
    completer: KeyCompleter<U>,
}

impl<U, X> Clone for MapAggregator<U, X> {
    fn clone(&self) -> Self {
        Self {
            reducer: self.reducer.clone(),
            completer: self.completer.clone(),
        }
    }
}

impl<U, X> MapAggregator<U, X>
where
    U: Ord + Clone + Send + Sync + 'static,
    X: Send + 'static,
{
    pub(crate) fn new(reducer: MapReducer<(U, X)>, zerofill: BTreeSet<U>) -> Self {
        Self {
            reducer,
            completer: base_completer(zerofill),
        }
    }

    fn with_reducer<V, Y>(
        reducer: MapReducer<(V, Y)>,
        completer: KeyCompleter<V>,
    ) -> MapAggregator<V, Y> {
        MapAggregator { reducer, completer }
    }

    fn with_settings(&self, reducer: MapReducer<(U, X)>) -> Self {
        Self {
            reducer,
            completer: self.completer.clone(),
        }
    }

    // Settings

    pub fn osm_types(&self, types: impl IntoIterator<Item = OsmType>) -> Self {
        self.with_settings(self.reducer.osm_types(types))
    }

    pub fn where_key(&self, key: &str) -> Self {
        self.with_settings(self.reducer.where_key(key))
    }

    pub fn where_tag(&self, key: &str, value: &str) -> Self {
        self.with_settings(self.reducer.where_tag(key, value))
    }

    pub fn where_tag_in(&self, key: &str, values: &[&str]) -> Self {
        self.with_settings(self.reducer.where_tag_in(key, values))
    }

    pub fn where_value_matches(&self, key: &str, pattern: &str) -> EngineResult<Self> {
        Ok(self.with_settings(self.reducer.where_value_matches(key, pattern)?))
    }

    pub fn where_tags_any(&self, tags: &[(&str, &str)]) -> Self {
        self.with_settings(self.reducer.where_tags_any(tags))
    }

    pub fn where_entity(
        &self,
        predicate: impl Fn(&EntityVersion) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.with_settings(self.reducer.where_entity(predicate))
    }

    pub fn include_legacy_multipolygons(&self, include: bool) -> Self {
        self.with_settings(self.reducer.include_legacy_multipolygons(include))
    }

    pub fn timeout(&self, timeout: Duration) -> Self {
        self.with_settings(self.reducer.timeout(timeout))
    }

    pub fn parallel(&self, parallel: bool) -> Self {
        self.with_settings(self.reducer.parallel(parallel))
    }

    // Transforms

    /// Transform every value, keeping its key.
    pub fn map<Y: Send + 'static>(
        &self,
        f: impl Fn(X) -> Y + Send + Sync + 'static,
    ) -> MapAggregator<U, Y> {
        let reducer = self
            .reducer
            .map(move |(key, x): (U, X)| (key, f(x)));
        Self::with_reducer(reducer, self.completer.clone())
    }

    /// Transform every value into zero or more values under the same key.
    pub fn flat_map<Y, I>(&self, f: impl Fn(X) -> I + Send + Sync + 'static) -> MapAggregator<U, Y>
    where
        Y: Send + 'static,
        I: IntoIterator<Item = Y>,
    {
        let reducer = self.reducer.flat_map(move |(key, x): (U, X)| {
            f(x).into_iter()
                .map(|y| (key.clone(), y))
                .collect::<Vec<_>>()
        });
        Self::with_reducer(reducer, self.completer.clone())
    }

    /// Keep values passing a predicate. Zero-fill keys still appear.
    pub fn filter(&self, predicate: impl Fn(&X) -> bool + Send + Sync + 'static) -> Self {
        let reducer = self.reducer.filter(move |(_, x): &(U, X)| predicate(x));
        self.with_settings(reducer)
    }

    // Index composition

    /// Add a key dimension computed from each value.
    pub fn aggregate_by<V>(
        &self,
        indexer: impl Fn(&X) -> V + Send + Sync + 'static,
    ) -> MapAggregator<CombinedIndex<U, V>, X>
    where
        V: Ord + Clone + Send + Sync + 'static,
    {
        self.aggregate_by_zerofill(indexer, [])
    }

    /// Add a key dimension with its own zero-fill keys.
    pub fn aggregate_by_zerofill<V>(
        &self,
        indexer: impl Fn(&X) -> V + Send + Sync + 'static,
        zerofill: impl IntoIterator<Item = V>,
    ) -> MapAggregator<CombinedIndex<U, V>, X>
    where
        V: Ord + Clone + Send + Sync + 'static,
    {
        let reducer = self
            .reducer
            .with_internal_stage(Stage::map(move |(key, x): (U, X)| {
                let inner = indexer(&x);
                (CombinedIndex::new(key, inner), x)
            }));
        let completer = nested_completer(self.completer.clone(), zerofill.into_iter().collect());
        Self::with_reducer(reducer, completer)
    }

    /// Add a timestamp dimension, snapping each value's timestamp down to
    /// the requested timestamps.
    pub fn aggregate_by_timestamp_with(
        &self,
        indexer: impl Fn(&X) -> Timestamp + Send + Sync + 'static,
    ) -> MapAggregator<CombinedIndex<U, Timestamp>, X> {
        let timestamps = self.reducer.requested_timestamps().clone();
        let zerofill: BTreeSet<Timestamp> = timestamps.iter().collect();
        let reducer = self
            .reducer
            .with_internal_stage(Stage::flat_map(move |(key, x): (U, X)| {
                timestamps
                    .floor(indexer(&x))
                    .map(|t| (CombinedIndex::new(key, t), x))
            }));
        let completer = nested_completer(self.completer.clone(), zerofill);
        Self::with_reducer(reducer, completer)
    }

    /// Add a dimension of requested timestamps.
    pub fn aggregate_by_timestamp(&self) -> MapAggregator<CombinedIndex<U, Timestamp>, X>
    where
        X: Timestamped,
    {
        self.aggregate_by_timestamp_with(<X as Timestamped>::timestamp)
    }

    /// Add a region dimension by splitting values into named regions.
    ///
    /// Only allowed before any transform.
    pub fn aggregate_by_geometry<K, P>(
        &self,
        regions: impl IntoIterator<Item = (K, P)>,
    ) -> EngineResult<MapAggregator<CombinedIndex<U, K>, X>>
    where
        X: Splittable,
        K: Ord + Clone + Send + Sync + 'static,
        P: Into<MultiPolygon<f64>>,
    {
        if self.reducer.has_transforms() {
            return Err(EngineError::invalid_configuration(
                "aggregate_by_geometry() must be called before any map, flat_map or filter",
            ));
        }
        let splitter = Arc::new(RegionSplitter::new(
            regions,
            self.reducer.geometry_builder(),
        )?);
        let zerofill: BTreeSet<K> = splitter.keys().cloned().collect();
        let reducer = self
            .reducer
            .with_internal_stage(Stage::flat_map(move |(key, x): (U, X)| {
                splitter
                    .split(x)
                    .into_iter()
                    .map(|(region, part)| (CombinedIndex::new(key.clone(), region), part))
                    .collect::<Vec<_>>()
            }));
        let completer = nested_completer(self.completer.clone(), zerofill);
        Ok(Self::with_reducer(reducer, completer))
    }

    // Reduction

    /// Reduce every key independently, then zero-fill.
    pub fn reduce<S, I, A, C>(
        &self,
        identity: I,
        accumulator: A,
        combiner: C,
    ) -> EngineResult<BTreeMap<U, S>>
    where
        S: Send,
        I: Fn() -> S + Send + Sync,
        A: Fn(S, X) -> S + Send + Sync,
        C: Fn(S, S) -> S + Send + Sync,
    {
        let mut result = self.reducer.reduce(
            BTreeMap::new,
            |mut groups: BTreeMap<U, S>, (key, x)| {
                let partial = groups.remove(&key).unwrap_or_else(&identity);
                groups.insert(key, accumulator(partial, x));
                groups
            },
            |mut a, b| {
                for (key, partial) in b {
                    let merged = match a.remove(&key) {
                        Some(existing) => combiner(existing, partial),
                        None => partial,
                    };
                    a.insert(key, merged);
                }
                a
            },
        )?;

        let keys = (self.completer)(result.keys().cloned().collect());
        for key in keys {
            result.entry(key).or_insert_with(&identity);
        }
        Ok(result)
    }

    /// Per-key reduce with one associative operation.
    pub fn reduce_with<I, F>(&self, identity: I, op: F) -> EngineResult<BTreeMap<U, X>>
    where
        I: Fn() -> X + Send + Sync,
        F: Fn(X, X) -> X + Send + Sync,
    {
        self.reduce(identity, &op, &op)
    }

    pub fn count(&self) -> EngineResult<BTreeMap<U, u64>> {
        self.reduce(|| 0, |n, _| n + 1, |a, b| a + b)
    }

    pub fn sum(&self) -> EngineResult<BTreeMap<U, X>>
    where
        X: std::ops::Add<Output = X> + Default,
    {
        self.reduce(X::default, |a, b| a + b, |a, b| a + b)
    }

    /// Per-key mean; NaN for zero-filled keys.
    pub fn average(&self) -> EngineResult<BTreeMap<U, f64>>
    where
        X: Into<f64>,
    {
        self.weighted_average(|x| WeightedValue::new(x.into(), 1.0))
    }

    pub fn weighted_average(
        &self,
        f: impl Fn(X) -> WeightedValue + Send + Sync,
    ) -> EngineResult<BTreeMap<U, f64>> {
        let states = self.reduce(
            MeanState::default,
            |state, x| MeanState::add(state, f(x)),
            MeanState::combine,
        )?;
        Ok(states
            .into_iter()
            .map(|(key, state)| (key, state.mean()))
            .collect())
    }

    pub fn unique_values(&self) -> EngineResult<BTreeMap<U, BTreeSet<X>>>
    where
        X: Ord,
    {
        self.reduce(
            BTreeSet::new,
            |mut set, x| {
                set.insert(x);
                set
            },
            |mut a, mut b| {
                a.append(&mut b);
                a
            },
        )
    }

    pub fn count_unique(&self) -> EngineResult<BTreeMap<U, usize>>
    where
        X: Ord,
    {
        Ok(self
            .unique_values()?
            .into_iter()
            .map(|(key, set)| (key, set.len()))
            .collect())
    }

    pub fn collect(&self) -> EngineResult<BTreeMap<U, Vec<X>>> {
        self.reduce(
            Vec::new,
            |mut items, x| {
                items.push(x);
                items
            },
            |mut a, mut b| {
                a.append(&mut b);
                a
            },
        )
    }

    /// Per-key quantile digests.
    pub fn digest(&self) -> EngineResult<BTreeMap<U, QuantileAccumulator>>
    where
        X: Into<f64>,
    {
        self.reduce(
            QuantileAccumulator::new,
            |acc, x| QuantileAccumulator::add(acc, x.into()),
            QuantileAccumulator::combine,
        )
    }

    pub fn estimated_quantile(&self, q: f64) -> EngineResult<BTreeMap<U, f64>>
    where
        X: Into<f64>,
    {
        Ok(self
            .digest()?
            .into_iter()
            .map(|(key, digest)| (key, digest.quantile(q)))
            .collect())
    }

    pub fn estimated_quantiles(&self, qs: &[f64]) -> EngineResult<BTreeMap<U, Vec<f64>>>
    where
        X: Into<f64>,
    {
        Ok(self
            .digest()?
            .into_iter()
            .map(|(key, digest)| (key, digest.quantiles(qs)))
            .collect())
    }

    pub fn estimated_median(&self) -> EngineResult<BTreeMap<U, f64>>
    where
        X: Into<f64>,
    {
        self.estimated_quantile(0.5)
    }
}
