//! Replay of entity histories against a query area and timestamp set.
//!
//! A [`CellIterator`] walks the entities of one [`Cell`] and reconstructs
//! either discrete states ([`Snapshot`]s, one per requested timestamp) or
//! the transitions between states ([`Contribution`]s) inside the requested
//! time range.
//!
//! Per entity the iterator:
//!
//! 1. rejects entities whose overall bbox misses the area
//! 2. classifies the rest as fully inside or partially overlapping
//! 3. resolves the active version at each timestamp by floor lookup,
//!    skipping timestamps before the first version and deleted versions
//! 4. evaluates the version filter (for old-style multipolygons, on the
//!    first outer way instead of the relation)
//! 5. attaches the geometry: unclipped when fully inside, clipped to the
//!    area otherwise
//!
//! A geometry failure or an empty geometry drops only the affected
//! (entity, timestamp) record, whatever the containment. It is logged and
//! iteration continues.

mod contribution;
mod snapshot;

pub use contribution::{Contribution, ContributionState, ContributionType, ContributionTypes};
pub use snapshot::{Containment, EntitySnapshots, Snapshot};

use crate::bbox::QueryArea;
use crate::filter::{EntityPredicate, TypeFilter, VersionPredicate};
use crate::geometry::{GeometryContext, LazyGeometry, is_empty_geometry};
use crate::storage::Cell;
use crate::time::{Timestamp, Timestamps};
use crate::types::{EntityVersion, OsmType, VersionedEntity};
use geo_types::Geometry;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{trace, warn};

/// Iterates the entities of cells for one query.
///
/// Immutable once built; a single iterator is shared by every worker of a
/// parallel reduction.
#[derive(Clone)]
pub struct CellIterator {
    area: QueryArea,
    timestamps: Timestamps,
    types: TypeFilter,
    entity_filter: Option<EntityPredicate>,
    version_filter: Option<VersionPredicate>,
    include_legacy_multipolygons: bool,
    geometry: Arc<GeometryContext>,
}

/// Observed state of an entity at one instant of the contribution walk.
struct State {
    version: usize,
    geometry: Geometry<f64>,
}

impl CellIterator {
    pub fn new(area: QueryArea, timestamps: Timestamps, geometry: Arc<GeometryContext>) -> Self {
        Self {
            area,
            timestamps,
            types: TypeFilter::all(),
            entity_filter: None,
            version_filter: None,
            include_legacy_multipolygons: false,
            geometry,
        }
    }

    /// Restrict to some entity types.
    pub fn with_types(mut self, types: TypeFilter) -> Self {
        self.types = types;
        self
    }

    /// Cheap test on the whole history, applied before any materialisation.
    pub fn with_entity_filter(mut self, filter: EntityPredicate) -> Self {
        self.entity_filter = Some(filter);
        self
    }

    /// Test on the active version at each timestamp.
    pub fn with_version_filter(mut self, filter: VersionPredicate) -> Self {
        self.version_filter = Some(filter);
        self
    }

    /// Evaluate the version filter of old-style multipolygons on their outer
    /// way.
    pub fn with_legacy_multipolygons(mut self, include: bool) -> Self {
        self.include_legacy_multipolygons = include;
        self
    }

    pub fn area(&self) -> &QueryArea {
        &self.area
    }

    pub fn timestamps(&self) -> &Timestamps {
        &self.timestamps
    }

    /// Snapshots of every entity of the cell, one item per entity with at
    /// least one snapshot.
    pub fn iterate_by_timestamps<'a>(
        &'a self,
        cell: &'a Cell,
    ) -> impl Iterator<Item = EntitySnapshots> + 'a {
        cell.entities
            .iter()
            .filter_map(move |entity| self.snapshots_of(entity))
    }

    /// Contributions of every entity of the cell, grouped by entity and
    /// ordered by timestamp within each group.
    pub fn iterate_by_contribution<'a>(
        &'a self,
        cell: &'a Cell,
    ) -> impl Iterator<Item = Vec<Contribution>> + 'a {
        cell.entities
            .iter()
            .map(move |entity| self.contributions_of(entity))
            .filter(|contributions| !contributions.is_empty())
    }

    /// Snapshots of one entity at the requested timestamps.
    pub fn snapshots_of(&self, entity: &Arc<VersionedEntity>) -> Option<EntitySnapshots> {
        let containment = self.containment(entity)?;

        let mut snapshots = Vec::new();
        for timestamp in self.timestamps.iter() {
            let Some(idx) = entity.version_index_at(timestamp) else {
                continue;
            };
            let version = &entity.versions()[idx];
            if !version.visible || !self.accepts(entity, version, timestamp) {
                continue;
            }

            let unclipped = Arc::new(LazyGeometry::deferred_build(
                self.geometry.clone(),
                entity.clone(),
                idx,
                timestamp,
            ));
            let geometry = match containment {
                Containment::Inside => {
                    // Memoised, so later reads reuse this build.
                    if unclipped.get().is_none() {
                        continue;
                    }
                    unclipped.clone()
                }
                Containment::Partial => {
                    let Some(clipped) = self.clipped(entity, version, timestamp) else {
                        continue;
                    };
                    Arc::new(LazyGeometry::ready(clipped))
                }
            };
            snapshots.push(Snapshot::new(
                timestamp,
                entity.clone(),
                idx,
                geometry,
                unclipped,
                containment,
            ));
        }

        if snapshots.is_empty() {
            return None;
        }
        Some(EntitySnapshots {
            entity: entity.clone(),
            snapshots,
        })
    }

    /// Contributions of one entity inside `(first, last]` of the requested
    /// timestamps.
    pub fn contributions_of(&self, entity: &Arc<VersionedEntity>) -> Vec<Contribution> {
        let Some(containment) = self.containment(entity) else {
            return Vec::new();
        };
        let start = self.timestamps.first();
        let end = self.timestamps.last();

        let mut contributions = Vec::new();
        let mut before = self.state_at(entity, start, containment);
        for (timestamp, changeset) in self.event_times(entity, start, end) {
            let after = self.state_at(entity, timestamp, containment);
            let types = classify(entity, before.as_ref(), after.as_ref());
            if !types.is_empty() {
                contributions.push(Contribution::new(
                    timestamp,
                    changeset,
                    entity.clone(),
                    before.as_ref().map(to_contribution_state),
                    after.as_ref().map(to_contribution_state),
                    types,
                ));
            }
            before = after;
        }
        contributions
    }

    fn containment(&self, entity: &VersionedEntity) -> Option<Containment> {
        if !self.types.contains(entity.osm_type()) {
            return None;
        }
        let legacy_candidate =
            self.include_legacy_multipolygons && entity.osm_type() == OsmType::Relation;
        if let Some(filter) = &self.entity_filter {
            if !legacy_candidate && !filter(entity) {
                trace!(entity = %entity.key(), "Entity rejected by pre-filter");
                return None;
            }
        }

        match entity.bbox() {
            // Unknown extent: treat as overlapping and clip.
            None => Some(Containment::Partial),
            Some(bbox) if !self.area.intersects_bbox(&bbox) => None,
            Some(bbox) if self.area.contains_bbox(&bbox) => Some(Containment::Inside),
            Some(_) => Some(Containment::Partial),
        }
    }

    fn accepts(&self, entity: &VersionedEntity, version: &EntityVersion, timestamp: Timestamp) -> bool {
        let Some(filter) = &self.version_filter else {
            return true;
        };
        if self.include_legacy_multipolygons
            && entity.osm_type() == OsmType::Relation
            && self.geometry.tags.is_legacy_multipolygon(version)
        {
            // The first outer way with a visible version decides.
            let outer = version
                .members()
                .iter()
                .filter(|m| self.geometry.tags.is_outer_member(m))
                .filter_map(|m| self.geometry.resolver.resolve(m.key()))
                .find_map(|way| way.visible_at(timestamp).cloned());
            return outer.is_some_and(|way_version| filter(&way_version));
        }
        filter(version)
    }

    /// Geometry clipped to the area; `None` when empty or not buildable.
    fn clipped(
        &self,
        entity: &VersionedEntity,
        version: &EntityVersion,
        timestamp: Timestamp,
    ) -> Option<Geometry<f64>> {
        match self
            .geometry
            .build_clipped(entity, version, timestamp, &self.area)
        {
            Ok(geometry) if is_empty_geometry(&geometry) => {
                trace!(entity = %entity.key(), timestamp = %timestamp, "Clipped geometry is empty");
                None
            }
            Ok(geometry) => Some(geometry),
            Err(e) => {
                warn!(entity = %entity.key(), timestamp = %timestamp, error = %e, "Dropping record with invalid geometry");
                None
            }
        }
    }

    fn state_at(
        &self,
        entity: &VersionedEntity,
        timestamp: Timestamp,
        containment: Containment,
    ) -> Option<State> {
        let idx = entity.version_index_at(timestamp)?;
        let version = &entity.versions()[idx];
        if !version.visible || !self.accepts(entity, version, timestamp) {
            return None;
        }
        let geometry = match containment {
            Containment::Inside => match self.geometry.build(entity, version, timestamp) {
                Ok(geometry) => Some(geometry).filter(|g| !is_empty_geometry(g)),
                Err(e) => {
                    warn!(entity = %entity.key(), timestamp = %timestamp, error = %e, "Dropping state with invalid geometry");
                    None
                }
            },
            Containment::Partial => self.clipped(entity, version, timestamp),
        }?;
        Some(State {
            version: idx,
            geometry,
        })
    }

    /// Instants in `(start, end]` at which the entity or one of its
    /// members was edited, with the changeset of the edit.
    fn event_times(
        &self,
        entity: &VersionedEntity,
        start: Timestamp,
        end: Timestamp,
    ) -> BTreeMap<Timestamp, i64> {
        let mut events = BTreeMap::new();
        let in_range = |t: Timestamp| t > start && t <= end;
        let add_member_edits = |member: &VersionedEntity, events: &mut BTreeMap<Timestamp, i64>| {
            for v in member.versions().iter().filter(|v| in_range(v.timestamp)) {
                events.entry(v.timestamp).or_insert(v.changeset);
            }
        };

        let mut member_keys: Vec<_> = entity
            .versions()
            .iter()
            .flat_map(EntityVersion::members)
            .map(|m| m.key())
            .collect();
        member_keys.sort_unstable();
        member_keys.dedup();
        for key in member_keys {
            let Some(member) = self.geometry.resolver.resolve(key) else {
                continue;
            };
            add_member_edits(&member, &mut events);
            // Relation member ways also change shape through their nodes.
            if entity.osm_type() == OsmType::Relation && member.osm_type() == OsmType::Way {
                let mut node_keys: Vec<_> = member
                    .versions()
                    .iter()
                    .flat_map(EntityVersion::members)
                    .map(|m| m.key())
                    .collect();
                node_keys.sort_unstable();
                node_keys.dedup();
                for node in node_keys.into_iter().filter_map(|k| self.geometry.resolver.resolve(k)) {
                    add_member_edits(&node, &mut events);
                }
            }
        }

        // The entity's own edits take precedence over simultaneous member edits.
        for v in entity.versions().iter().filter(|v| in_range(v.timestamp)) {
            events.insert(v.timestamp, v.changeset);
        }
        events
    }
}

fn to_contribution_state(state: &State) -> ContributionState {
    ContributionState {
        version: state.version,
        geometry: Arc::new(LazyGeometry::ready(state.geometry.clone())),
    }
}

fn classify(entity: &VersionedEntity, before: Option<&State>, after: Option<&State>) -> ContributionTypes {
    match (before, after) {
        (None, None) => ContributionTypes::empty(),
        (None, Some(_)) => ContributionTypes::empty().with(ContributionType::Creation),
        (Some(_), None) => ContributionTypes::empty().with(ContributionType::Deletion),
        (Some(before), Some(after)) => {
            let mut types = ContributionTypes::empty();
            let versions = entity.versions();
            if versions[before.version].tags() != versions[after.version].tags() {
                types = types.with(ContributionType::TagChange);
            }
            if before.geometry != after.geometry {
                types = types.with(ContributionType::GeometryChange);
            }
            types
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bbox::BoundingBox;
    use crate::geometry::GeoGeometryBuilder;
    use crate::storage::MemoryStore;
    use crate::tags::{DefaultTagInterpreter, TagDictionary, TagTranslator};
    use crate::types::{MemberRef, Payload, Tag};

    fn ts(seconds: i64) -> Timestamp {
        Timestamp::from_epoch_seconds(seconds)
    }

    fn iterator(store: Arc<MemoryStore>, dict: &TagDictionary, area: BoundingBox, times: &[i64]) -> CellIterator {
        let context = Arc::new(GeometryContext::new(
            Arc::new(GeoGeometryBuilder::new()),
            store,
            Arc::new(DefaultTagInterpreter::new(dict)),
        ));
        let timestamps = Timestamps::list(times.iter().copied().map(ts)).unwrap();
        CellIterator::new(area.into(), timestamps, context)
    }

    fn moving_node() -> VersionedEntity {
        VersionedEntity::new(
            OsmType::Node,
            1,
            vec![
                EntityVersion::new(ts(100), 1, Payload::Node { lon: 1.0, lat: 1.0 }),
                EntityVersion::new(ts(200), 2, Payload::Node { lon: 2.0, lat: 2.0 }),
                EntityVersion::deleted(ts(300), 3),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_snapshots_follow_floor_and_visibility() {
        let store = Arc::new(MemoryStore::default());
        let node = store.insert(moving_node());
        let it = iterator(store, &TagDictionary::new(), BoundingBox::world(), &[50, 150, 250, 350]);

        let result = it.snapshots_of(&node).unwrap();
        let found: Vec<(i64, u32)> = result
            .snapshots
            .iter()
            .map(|s| (s.timestamp().epoch_seconds(), s.version().version))
            .collect();
        assert_eq!(found, vec![(150, 1), (250, 2)]);
        assert!(result.snapshots.iter().all(|s| s.containment() == Containment::Inside));
    }

    #[test]
    fn test_entity_outside_area_is_skipped() {
        let store = Arc::new(MemoryStore::default());
        let node = store.insert(moving_node());
        let it = iterator(store, &TagDictionary::new(), BoundingBox::new(10.0, 10.0, 11.0, 11.0), &[150]);
        assert!(it.snapshots_of(&node).is_none());
    }

    #[test]
    fn test_partial_entity_is_clipped_per_timestamp() {
        let store = Arc::new(MemoryStore::default());
        // Bbox of the history overlaps the area, but the node sits outside it
        // at 250.
        let node = store.insert(moving_node());
        let it = iterator(store, &TagDictionary::new(), BoundingBox::new(0.0, 0.0, 1.5, 1.5), &[150, 250]);

        let result = it.snapshots_of(&node).unwrap();
        assert_eq!(result.snapshots.len(), 1);
        assert_eq!(result.snapshots[0].containment(), Containment::Partial);
        assert!(result.snapshots[0].geometry().is_some());
    }

    #[test]
    fn test_unbuildable_geometry_dropped_regardless_of_containment() {
        let store = Arc::new(MemoryStore::default());
        // Member nodes were never loaded; the extent comes from the backend.
        let way = store.insert(
            VersionedEntity::new(
                OsmType::Way,
                5,
                vec![EntityVersion::new(
                    ts(10),
                    1,
                    Payload::Way {
                        nodes: vec![MemberRef::node(98), MemberRef::node(99)],
                    },
                )],
            )
            .unwrap()
            .with_bbox(BoundingBox::new(1.0, 1.0, 2.0, 2.0)),
        );
        let dict = TagDictionary::new();

        let inside = iterator(store.clone(), &dict, BoundingBox::world(), &[20]);
        assert!(inside.snapshots_of(&way).is_none());
        let range = iterator(store.clone(), &dict, BoundingBox::world(), &[0, 20]);
        assert!(range.contributions_of(&way).is_empty());

        let partial = iterator(store, &dict, BoundingBox::new(0.0, 0.0, 1.5, 1.5), &[20]);
        assert!(partial.snapshots_of(&way).is_none());
    }

    #[test]
    fn test_legacy_multipolygon_uses_outer_way_tags() {
        let mut dict = TagDictionary::new();
        let building = dict.intern_tag("building", "yes");
        let mp = dict.intern_tag("type", "multipolygon");
        let outer = dict.intern_role("outer");

        let store = Arc::new(MemoryStore::default());
        for (id, lon, lat) in [(1, 0.0, 0.0), (2, 1.0, 0.0), (3, 1.0, 1.0), (4, 0.0, 1.0)] {
            store.insert(
                VersionedEntity::new(
                    OsmType::Node,
                    id,
                    vec![EntityVersion::new(ts(1), 1, Payload::Node { lon, lat })],
                )
                .unwrap(),
            );
        }
        store.insert(
            VersionedEntity::new(
                OsmType::Way,
                10,
                vec![
                    EntityVersion::new(
                        ts(2),
                        1,
                        Payload::Way {
                            nodes: [1, 2, 3, 4, 1].into_iter().map(MemberRef::node).collect(),
                        },
                    )
                    .with_tags([building]),
                ],
            )
            .unwrap(),
        );
        let relation = store.insert(
            VersionedEntity::new(
                OsmType::Relation,
                20,
                vec![
                    EntityVersion::new(
                        ts(3),
                        1,
                        Payload::Relation {
                            members: vec![MemberRef::new(OsmType::Way, 10, outer)],
                        },
                    )
                    .with_tags([mp]),
                ],
            )
            .unwrap(),
        );

        let key = dict.key_id("building").unwrap();
        let filter: VersionPredicate = Arc::new(move |v: &EntityVersion| v.has_key(key));
        let base = iterator(store, &dict, BoundingBox::world(), &[10]).with_version_filter(filter);

        assert!(base.snapshots_of(&relation).is_none());
        let legacy = base.with_legacy_multipolygons(true);
        let result = legacy.snapshots_of(&relation).unwrap();
        assert_eq!(result.snapshots.len(), 1);
        assert!(matches!(result.snapshots[0].geometry(), Some(Geometry::Polygon(_))));
    }

    #[test]
    fn test_contributions_classified() {
        let store = Arc::new(MemoryStore::default());
        let node = VersionedEntity::new(
            OsmType::Node,
            1,
            vec![
                EntityVersion::new(ts(100), 1, Payload::Node { lon: 1.0, lat: 1.0 }),
                EntityVersion::new(ts(200), 2, Payload::Node { lon: 1.0, lat: 1.0 })
                    .with_tags([Tag::new(0, 0)]),
                EntityVersion::new(ts(300), 3, Payload::Node { lon: 2.0, lat: 1.0 })
                    .with_tags([Tag::new(0, 0)]),
                EntityVersion::deleted(ts(400), 4),
            ],
        )
        .unwrap();
        let node = store.insert(node);
        let it = iterator(store, &TagDictionary::new(), BoundingBox::world(), &[0, 1_000]);

        let contributions = it.contributions_of(&node);
        let kinds: Vec<Vec<ContributionType>> =
            contributions.iter().map(|c| c.types().iter().collect()).collect();
        assert_eq!(
            kinds,
            vec![
                vec![ContributionType::Creation],
                vec![ContributionType::TagChange],
                vec![ContributionType::GeometryChange],
                vec![ContributionType::Deletion],
            ]
        );
        assert!(contributions[3].geometry_after().is_none());
        assert!(contributions[3].geometry_before().is_some());
    }
}
