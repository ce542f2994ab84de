//! The map-reduce pipeline.
//!
//! A [`MapReducer<X>`] is an immutable query descriptor whose elements are
//! of type `X`. Every configuration or transform call returns a new
//! descriptor; nothing is executed until a terminal reduce.
//!
//! ```text
//!   backend cells ──▶ CellIterator ──▶ stages (map / flat_map / filter) ──▶ accumulator
//!                      (filters,        strict left fold per element         │
//!                       floor lookup,                                        ▼
//!                       clipping)                          per-cell partials ──▶ combiner
//! ```
//!
//! Cells are independent partitions: each one is folded from
//! `identity()` with the accumulator, and the per-cell partials are merged
//! with the combiner, in parallel when the query spans enough cells. The
//! result is therefore only well defined when the combiner is associative
//! and `combiner(identity(), x) == x`.

mod reducers;
pub(crate) mod stage;

pub use reducers::{MeanState, Timestamped, WeightedValue};

use crate::aggregator::MapAggregator;
use crate::bbox::{BoundingBox, QueryArea};
use crate::config::EngineConfig;
use crate::digest::QuantileAccumulator;
use crate::error::{EngineError, EngineResult};
use crate::filter::{EntityPredicate, TagFilter, TypeFilter, VersionPredicate};
use crate::geometry::{GeometryBuilder, GeometryContext};
use crate::history::CellIterator;
use crate::splitter::{RegionSplitter, Splittable};
use crate::storage::{Cell, CellProvider, EntityResolver};
use crate::tags::{TagInterpreter, TagTranslator};
use crate::time::{Timestamp, Timestamps};
use crate::types::{EntityVersion, OsmType, VersionedEntity};
use geo_types::MultiPolygon;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use stage::{AnyItem, Stage};
use std::collections::BTreeSet;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// What the pipeline's source emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum View {
    /// One [`Snapshot`](crate::Snapshot) per entity and requested timestamp.
    Snapshot,
    /// One [`Contribution`](crate::Contribution) per change between the
    /// first and last requested timestamp.
    Contribution,
}

/// How source elements reach the transform chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Grouping {
    /// Each element individually.
    None,
    /// All elements of one entity as an ordered list.
    ByEntity,
}

/// Collaborators shared by every query of an engine.
#[derive(Clone)]
pub(crate) struct Backend {
    pub cells: Arc<dyn CellProvider>,
    pub resolver: Arc<dyn EntityResolver>,
    pub translator: Arc<dyn TagTranslator>,
    pub interpreter: Arc<dyn TagInterpreter>,
    pub geometry: Arc<dyn GeometryBuilder>,
}

/// Cooperative deadline of one reduction.
#[derive(Debug, Clone, Copy)]
struct Deadline {
    started: Instant,
    limit: Option<Duration>,
}

impl Deadline {
    fn start(limit: Option<Duration>) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    fn check(&self) -> EngineResult<()> {
        match self.limit {
            Some(limit) if self.started.elapsed() >= limit => Err(EngineError::Timeout {
                elapsed_ms: self.started.elapsed().as_millis(),
            }),
            _ => Ok(()),
        }
    }
}

/// An immutable, chainable map-reduce query over elements of type `X`.
pub struct MapReducer<X> {
    backend: Backend,
    config: EngineConfig,
    view: View,
    area: QueryArea,
    timestamps: Timestamps,
    types: TypeFilter,
    entity_filters: Vec<EntityPredicate>,
    version_filters: Vec<VersionPredicate>,
    stages: Vec<Stage>,
    /// User map / flat_map / filter calls among `stages`.
    transforms: usize,
    grouping: Grouping,
    marker: PhantomData<fn() -> X>,
}

impl<X> Clone for MapReducer<X> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            config: self.config.clone(),
            view: self.view,
            area: self.area.clone(),
            timestamps: self.timestamps.clone(),
            types: self.types,
            entity_filters: self.entity_filters.clone(),
            version_filters: self.version_filters.clone(),
            stages: self.stages.clone(),
            transforms: self.transforms,
            grouping: self.grouping,
            marker: PhantomData,
        }
    }
}

impl<X> MapReducer<X> {
    pub(crate) fn new(backend: Backend, config: EngineConfig, view: View) -> Self {
        Self {
            backend,
            config,
            view,
            area: QueryArea::BBox(BoundingBox::world()),
            timestamps: Timestamps::default(),
            types: TypeFilter::all(),
            entity_filters: Vec::new(),
            version_filters: Vec::new(),
            stages: Vec::new(),
            transforms: 0,
            grouping: Grouping::None,
            marker: PhantomData,
        }
    }

    fn retype<Y>(&self, stages: Vec<Stage>, transforms: usize, grouping: Grouping) -> MapReducer<Y> {
        MapReducer {
            backend: self.backend.clone(),
            config: self.config.clone(),
            view: self.view,
            area: self.area.clone(),
            timestamps: self.timestamps.clone(),
            types: self.types,
            entity_filters: self.entity_filters.clone(),
            version_filters: self.version_filters.clone(),
            stages,
            transforms,
            grouping,
            marker: PhantomData,
        }
    }

    fn with_stage<Y>(&self, stage: Stage, user: bool) -> MapReducer<Y> {
        let mut stages = self.stages.clone();
        stages.push(stage);
        self.retype(stages, self.transforms + usize::from(user), self.grouping)
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn grouping(&self) -> Grouping {
        self.grouping
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn geometry_builder(&self) -> Arc<dyn GeometryBuilder> {
        self.backend.geometry.clone()
    }

    pub(crate) fn has_transforms(&self) -> bool {
        self.transforms > 0
    }

    pub(crate) fn requested_timestamps(&self) -> &Timestamps {
        &self.timestamps
    }

    // Settings

    /// Restrict to an area of interest.
    pub fn area(&self, area: impl Into<QueryArea>) -> Self {
        Self {
            area: area.into(),
            ..self.clone()
        }
    }

    /// Restrict to a polygonal area of interest.
    pub fn area_polygon(&self, polygon: impl Into<MultiPolygon<f64>>) -> EngineResult<Self> {
        let area = QueryArea::polygon(polygon)
            .ok_or_else(|| EngineError::invalid_configuration("area polygon is empty"))?;
        Ok(self.area(area))
    }

    /// Set the requested timestamps.
    pub fn timestamps(&self, timestamps: Timestamps) -> Self {
        Self {
            timestamps,
            ..self.clone()
        }
    }

    /// Restrict to some entity types.
    pub fn osm_types(&self, types: impl IntoIterator<Item = OsmType>) -> Self {
        Self {
            types: TypeFilter::only(types),
            ..self.clone()
        }
    }

    /// Keep entities tagged with `key`.
    pub fn where_key(&self, key: &str) -> Self {
        self.with_tag_filter(TagFilter::key(self.backend.translator.as_ref(), key))
    }

    /// Keep entities tagged `key=value`.
    pub fn where_tag(&self, key: &str, value: &str) -> Self {
        self.with_tag_filter(TagFilter::tag(self.backend.translator.as_ref(), key, value))
    }

    /// Keep entities whose `key` has one of `values`.
    pub fn where_tag_in(&self, key: &str, values: &[&str]) -> Self {
        self.with_tag_filter(TagFilter::tag_in(
            self.backend.translator.as_ref(),
            key,
            values,
        ))
    }

    /// Keep entities whose `key` has a value matching a regex.
    pub fn where_value_matches(&self, key: &str, pattern: &str) -> EngineResult<Self> {
        let filter = TagFilter::value_matches(self.backend.translator.as_ref(), key, pattern)?;
        Ok(self.with_tag_filter(filter))
    }

    /// Keep entities carrying any of the listed tags.
    pub fn where_tags_any(&self, tags: &[(&str, &str)]) -> Self {
        self.with_tag_filter(TagFilter::any_of(self.backend.translator.as_ref(), tags))
    }

    /// Keep entities whose active version passes a predicate.
    pub fn where_entity(
        &self,
        predicate: impl Fn(&EntityVersion) -> bool + Send + Sync + 'static,
    ) -> Self {
        let mut version_filters = self.version_filters.clone();
        version_filters.push(Arc::new(predicate));
        Self {
            version_filters,
            ..self.clone()
        }
    }

    fn with_tag_filter(&self, filter: TagFilter) -> Self {
        let filter = Arc::new(filter);
        let mut entity_filters = self.entity_filters.clone();
        let pre = filter.clone();
        entity_filters.push(Arc::new(move |entity: &VersionedEntity| pre.may_match_entity(entity)));
        let mut version_filters = self.version_filters.clone();
        version_filters.push(Arc::new(move |version: &EntityVersion| filter.matches_version(version)));
        Self {
            entity_filters,
            version_filters,
            ..self.clone()
        }
    }

    /// Match tag filters of old-style multipolygons against their outer way.
    pub fn include_legacy_multipolygons(&self, include: bool) -> Self {
        Self {
            config: self.config.clone().include_legacy_multipolygons(include),
            ..self.clone()
        }
    }

    /// Abort the reduction with [`EngineError::Timeout`] after `timeout`.
    pub fn timeout(&self, timeout: Duration) -> Self {
        Self {
            config: self.config.clone().timeout(timeout),
            ..self.clone()
        }
    }

    /// Enable or disable parallel reduction.
    pub fn parallel(&self, parallel: bool) -> Self {
        Self {
            config: self.config.clone().parallel(parallel),
            ..self.clone()
        }
    }

    fn cell_iterator(&self) -> CellIterator {
        let context = Arc::new(GeometryContext::new(
            self.backend.geometry.clone(),
            self.backend.resolver.clone(),
            self.backend.interpreter.clone(),
        ));
        let mut iterator = CellIterator::new(self.area.clone(), self.timestamps.clone(), context)
            .with_types(self.types)
            .with_legacy_multipolygons(self.config.include_legacy_multipolygons);
        if !self.entity_filters.is_empty() {
            let filters = self.entity_filters.clone();
            iterator = iterator.with_entity_filter(Arc::new(move |entity: &VersionedEntity| filters.iter().all(|f| f(entity))));
        }
        if !self.version_filters.is_empty() {
            let filters = self.version_filters.clone();
            iterator = iterator.with_version_filter(Arc::new(move |version: &EntityVersion| filters.iter().all(|f| f(version))));
        }
        iterator
    }

    /// Source elements of one cell, boxed for the stage chain.
    fn source<'a>(
        &self,
        iterator: &'a CellIterator,
        cell: &'a Cell,
        deadline: &'a Deadline,
    ) -> Box<dyn Iterator<Item = EngineResult<AnyItem>> + 'a> {
        match (self.view, self.grouping) {
            (View::Snapshot, Grouping::None) => Box::new(
                iterator
                    .iterate_by_timestamps(cell)
                    .flat_map(|group| group.snapshots)
                    .map(|snapshot| Ok::<_, EngineError>(Box::new(snapshot) as AnyItem)),
            ),
            (View::Snapshot, Grouping::ByEntity) => Box::new(
                iterator.iterate_by_timestamps(cell).map(move |group| -> EngineResult<AnyItem> {
                    deadline.check()?;
                    Ok(Box::new(group.snapshots) as AnyItem)
                }),
            ),
            (View::Contribution, Grouping::None) => Box::new(
                iterator
                    .iterate_by_contribution(cell)
                    .flatten()
                    .map(|contribution| Ok::<_, EngineError>(Box::new(contribution) as AnyItem)),
            ),
            (View::Contribution, Grouping::ByEntity) => Box::new(
                iterator.iterate_by_contribution(cell).map(move |group| -> EngineResult<AnyItem> {
                    deadline.check()?;
                    Ok(Box::new(group) as AnyItem)
                }),
            ),
        }
    }
}

impl<X: Send + 'static> MapReducer<X> {
    // Transforms

    /// Transform every element.
    pub fn map<Y: Send + 'static>(&self, f: impl Fn(X) -> Y + Send + Sync + 'static) -> MapReducer<Y> {
        self.with_stage(Stage::map(f), true)
    }

    /// Transform every element into zero or more elements.
    pub fn flat_map<Y, I>(&self, f: impl Fn(X) -> I + Send + Sync + 'static) -> MapReducer<Y>
    where
        Y: Send + 'static,
        I: IntoIterator<Item = Y>,
    {
        self.with_stage(Stage::flat_map(f), true)
    }

    /// Keep elements passing a predicate.
    pub fn filter(&self, predicate: impl Fn(&X) -> bool + Send + Sync + 'static) -> MapReducer<X> {
        self.with_stage(Stage::filter(predicate), true)
    }

    /// Hand all elements of one entity to the transforms as a single list.
    ///
    /// Must be called at most once and before any transform.
    pub fn group_by_entity(&self) -> EngineResult<MapReducer<Vec<X>>> {
        if self.grouping == Grouping::ByEntity {
            return Err(EngineError::invalid_configuration(
                "group_by_entity() can only be called once",
            ));
        }
        if !self.stages.is_empty() {
            return Err(EngineError::invalid_configuration(
                "group_by_entity() must be called before any map, flat_map or filter",
            ));
        }
        Ok(self.retype(Vec::new(), 0, Grouping::ByEntity))
    }

    pub(crate) fn with_internal_stage<Y>(&self, stage: Stage) -> MapReducer<Y> {
        self.with_stage(stage, false)
    }

    // Aggregation

    /// Group results by a key computed from each element.
    pub fn aggregate_by<U>(&self, indexer: impl Fn(&X) -> U + Send + Sync + 'static) -> MapAggregator<U, X>
    where
        U: Ord + Clone + Send + Sync + 'static,
    {
        self.aggregate_by_zerofill(indexer, [])
    }

    /// Group results by a key, making every listed key appear in the
    /// result even without matching elements.
    pub fn aggregate_by_zerofill<U>(
        &self,
        indexer: impl Fn(&X) -> U + Send + Sync + 'static,
        zerofill: impl IntoIterator<Item = U>,
    ) -> MapAggregator<U, X>
    where
        U: Ord + Clone + Send + Sync + 'static,
    {
        let reducer = self.with_internal_stage(Stage::map(move |x: X| (indexer(&x), x)));
        MapAggregator::new(reducer, zerofill.into_iter().collect())
    }

    /// Group results by a timestamp computed from each element, snapped
    /// down to the requested timestamps. Elements before the first one are
    /// dropped; every requested timestamp appears in the result.
    pub fn aggregate_by_timestamp_with(
        &self,
        indexer: impl Fn(&X) -> Timestamp + Send + Sync + 'static,
    ) -> MapAggregator<Timestamp, X> {
        let timestamps = self.timestamps.clone();
        let zerofill: BTreeSet<Timestamp> = timestamps.iter().collect();
        let reducer = self.with_internal_stage(Stage::flat_map(move |x: X| {
            timestamps.floor(indexer(&x)).map(|t| (t, x))
        }));
        MapAggregator::new(reducer, zerofill)
    }

    /// Group results by the requested timestamp each element belongs to.
    pub fn aggregate_by_timestamp(&self) -> MapAggregator<Timestamp, X>
    where
        X: Timestamped,
    {
        self.aggregate_by_timestamp_with(<X as Timestamped>::timestamp)
    }

    /// Split elements into named regions and group results by region.
    ///
    /// Splitting changes cardinality, so this is only allowed before any
    /// transform.
    pub fn aggregate_by_geometry<K, P>(
        &self,
        regions: impl IntoIterator<Item = (K, P)>,
    ) -> EngineResult<MapAggregator<K, X>>
    where
        X: Splittable,
        K: Ord + Clone + Send + Sync + 'static,
        P: Into<MultiPolygon<f64>>,
    {
        if self.has_transforms() {
            return Err(EngineError::invalid_configuration(
                "aggregate_by_geometry() must be called before any map, flat_map or filter",
            ));
        }
        let splitter = Arc::new(RegionSplitter::new(regions, self.geometry_builder())?);
        let zerofill: BTreeSet<K> = splitter.keys().cloned().collect();
        let reducer = self.with_internal_stage(Stage::flat_map(move |x: X| splitter.split(x)));
        Ok(MapAggregator::new(reducer, zerofill))
    }

    // Reduction

    /// Fold every element into a single value.
    ///
    /// `accumulator` folds one element into a partial result; `combiner`
    /// merges two partial results and must be associative with `identity()`
    /// as its neutral element.
    pub fn reduce<S, I, A, C>(&self, identity: I, accumulator: A, combiner: C) -> EngineResult<S>
    where
        S: Send,
        I: Fn() -> S + Send + Sync,
        A: Fn(S, X) -> S + Send + Sync,
        C: Fn(S, S) -> S + Send + Sync,
    {
        let cells = self.backend.cells.cells(&self.area.envelope())?;
        let iterator = self.cell_iterator();
        let deadline = Deadline::start(self.config.timeout);
        let parallel = self.config.parallel && cells.len() >= self.config.parallel_threshold;
        debug!(
            cells = cells.len(),
            parallel,
            view = ?self.view,
            grouping = ?self.grouping,
            stages = self.stages.len(),
            "Starting reduction"
        );

        let fold_cell = |cell: &Cell| -> EngineResult<S> {
            deadline.check()?;
            let mut partial = identity();
            for item in self.source(&iterator, cell, &deadline) {
                for out in stage::apply(&self.stages, item?)? {
                    partial = accumulator(partial, stage::downcast::<X>(out)?);
                }
            }
            debug!(cell = cell.id, entities = cell.len(), "Reduced cell");
            Ok(partial)
        };

        if parallel {
            cells
                .par_iter()
                .map(fold_cell)
                .try_reduce(&identity, |a, b| Ok(combiner(a, b)))
        } else {
            let mut result = identity();
            for cell in &cells {
                result = combiner(result, fold_cell(cell)?);
            }
            Ok(result)
        }
    }

    /// Reduce with one associative operation serving as both accumulator
    /// and combiner.
    pub fn reduce_with<I, F>(&self, identity: I, op: F) -> EngineResult<X>
    where
        I: Fn() -> X + Send + Sync,
        F: Fn(X, X) -> X + Send + Sync,
    {
        self.reduce(identity, &op, &op)
    }

    /// Number of elements.
    pub fn count(&self) -> EngineResult<u64> {
        self.reduce(|| 0, |n, _| n + 1, |a, b| a + b)
    }

    /// Sum of the elements.
    pub fn sum(&self) -> EngineResult<X>
    where
        X: std::ops::Add<Output = X> + Default,
    {
        self.reduce(X::default, |a, b| a + b, |a, b| a + b)
    }

    /// Arithmetic mean; NaN without elements.
    pub fn average(&self) -> EngineResult<f64>
    where
        X: Into<f64>,
    {
        self.weighted_average(|x| WeightedValue::new(x.into(), 1.0))
    }

    /// Weighted mean of values derived from each element.
    pub fn weighted_average(
        &self,
        f: impl Fn(X) -> WeightedValue + Send + Sync,
    ) -> EngineResult<f64> {
        let state = self.reduce(
            MeanState::default,
            |state, x| MeanState::add(state, f(x)),
            MeanState::combine,
        )?;
        Ok(state.mean())
    }

    /// Distinct elements.
    pub fn unique_values(&self) -> EngineResult<BTreeSet<X>>
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

    /// Number of distinct elements.
    pub fn count_unique(&self) -> EngineResult<usize>
    where
        X: Ord,
    {
        Ok(self.unique_values()?.len())
    }

    /// All elements, in cell order.
    pub fn collect(&self) -> EngineResult<Vec<X>> {
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

    /// Quantile digest of the elements.
    pub fn digest(&self) -> EngineResult<QuantileAccumulator>
    where
        X: Into<f64>,
    {
        self.reduce(
            QuantileAccumulator::new,
            |acc, x| QuantileAccumulator::add(acc, x.into()),
            QuantileAccumulator::combine,
        )
    }

    /// Estimated value at quantile `q` in `[0, 1]`.
    pub fn estimated_quantile(&self, q: f64) -> EngineResult<f64>
    where
        X: Into<f64>,
    {
        Ok(self.digest()?.quantile(q))
    }

    /// Estimated values at several quantiles.
    pub fn estimated_quantiles(&self, qs: &[f64]) -> EngineResult<Vec<f64>>
    where
        X: Into<f64>,
    {
        Ok(self.digest()?.quantiles(qs))
    }

    pub fn estimated_median(&self) -> EngineResult<f64>
    where
        X: Into<f64>,
    {
        self.estimated_quantile(0.5)
    }
}
