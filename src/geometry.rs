//! Geometry capability and lazily computed geometries.
//!
//! The engine treats geometry construction and polygon boolean operations
//! as an external capability behind the [`GeometryBuilder`] trait. The
//! default [`GeoGeometryBuilder`] implements it with the `geo` crate:
//!
//! - node → `Point`
//! - way → `LineString`, or `Polygon` when closed and tagged as an area
//! - multipolygon relation → `MultiPolygon` assembled from member rings
//! - other relations → `GeometryCollection` of member geometries
//!
//! Members are resolved at the same timestamp as the entity version being
//! built. Results are wrapped in [`LazyGeometry`], which defers the work until
//! first access and memoises it.

use crate::bbox::QueryArea;
use crate::error::{EngineError, EngineResult};
use crate::storage::EntityResolver;
use crate::tags::TagInterpreter;
use crate::time::Timestamp;
use crate::types::{EntityVersion, MemberRef, OsmType, Payload, VersionedEntity};
use geo::relate::IntersectionMatrix;
use geo::{BooleanOps, Contains, CoordsIter, Relate};
use geo_types::{
    Coord, Geometry, GeometryCollection, LineString, MultiLineString, MultiPoint, MultiPolygon,
    Point, Polygon,
};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, OnceLock};
use tracing::warn;

/// Borrowed collaborators needed while building one geometry.
#[derive(Clone, Copy)]
pub struct BuildContext<'a> {
    pub resolver: &'a dyn EntityResolver,
    pub tags: &'a dyn TagInterpreter,
}

/// Geometry construction and topology operations.
///
/// Implementations must be pure: the same inputs always yield the same
/// geometry, since results are computed lazily and possibly on another
/// worker thread.
pub trait GeometryBuilder: Send + Sync {
    /// Build the full geometry of `version` as of `timestamp`.
    fn build(
        &self,
        entity: &VersionedEntity,
        version: &EntityVersion,
        timestamp: Timestamp,
        ctx: BuildContext<'_>,
    ) -> EngineResult<Geometry<f64>>;

    /// Build the geometry clipped to the query area.
    fn build_clipped(
        &self,
        entity: &VersionedEntity,
        version: &EntityVersion,
        timestamp: Timestamp,
        area: &QueryArea,
        ctx: BuildContext<'_>,
    ) -> EngineResult<Geometry<f64>> {
        let full = self.build(entity, version, timestamp, ctx)?;
        self.intersection(&full, &area.to_multi_polygon())
    }

    /// Whether a geometry touches an area.
    fn intersects(&self, geometry: &Geometry<f64>, area: &MultiPolygon<f64>) -> EngineResult<bool>;

    /// The part of a geometry inside an area.
    fn intersection(
        &self,
        geometry: &Geometry<f64>,
        area: &MultiPolygon<f64>,
    ) -> EngineResult<Geometry<f64>>;
}

/// Owned collaborators shared by every geometry of one query.
pub struct GeometryContext {
    pub builder: Arc<dyn GeometryBuilder>,
    pub resolver: Arc<dyn EntityResolver>,
    pub tags: Arc<dyn TagInterpreter>,
}

impl GeometryContext {
    pub fn new(
        builder: Arc<dyn GeometryBuilder>,
        resolver: Arc<dyn EntityResolver>,
        tags: Arc<dyn TagInterpreter>,
    ) -> Self {
        Self {
            builder,
            resolver,
            tags,
        }
    }

    fn borrowed(&self) -> BuildContext<'_> {
        BuildContext {
            resolver: self.resolver.as_ref(),
            tags: self.tags.as_ref(),
        }
    }

    /// Build the full geometry of a version.
    pub fn build(
        &self,
        entity: &VersionedEntity,
        version: &EntityVersion,
        timestamp: Timestamp,
    ) -> EngineResult<Geometry<f64>> {
        self.builder
            .build(entity, version, timestamp, self.borrowed())
    }

    /// Build the geometry of a version clipped to an area.
    pub fn build_clipped(
        &self,
        entity: &VersionedEntity,
        version: &EntityVersion,
        timestamp: Timestamp,
        area: &QueryArea,
    ) -> EngineResult<Geometry<f64>> {
        self.builder
            .build_clipped(entity, version, timestamp, area, self.borrowed())
    }
}

impl fmt::Debug for GeometryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeometryContext").finish_non_exhaustive()
    }
}

/// Relate an area to a geometry of any variant.
pub(crate) fn relate_geometry(
    area: &MultiPolygon<f64>,
    geometry: &Geometry<f64>,
) -> IntersectionMatrix {
    match geometry {
        Geometry::Point(g) => area.relate(g),
        Geometry::Line(g) => area.relate(g),
        Geometry::LineString(g) => area.relate(g),
        Geometry::Polygon(g) => area.relate(g),
        Geometry::MultiPoint(g) => area.relate(g),
        Geometry::MultiLineString(g) => area.relate(g),
        Geometry::MultiPolygon(g) => area.relate(g),
        Geometry::GeometryCollection(g) => area.relate(g),
        Geometry::Rect(g) => area.relate(g),
        Geometry::Triangle(g) => area.relate(g),
    }
}

/// An empty geometry.
pub fn empty_geometry() -> Geometry<f64> {
    Geometry::GeometryCollection(GeometryCollection(Vec::new()))
}

/// Whether a geometry has no coordinates at all.
pub fn is_empty_geometry(geometry: &Geometry<f64>) -> bool {
    match geometry {
        Geometry::Point(_) | Geometry::Line(_) | Geometry::Rect(_) | Geometry::Triangle(_) => false,
        Geometry::LineString(ls) => ls.0.is_empty(),
        Geometry::Polygon(p) => p.exterior().0.is_empty(),
        Geometry::MultiPoint(mp) => mp.0.is_empty(),
        Geometry::MultiLineString(mls) => mls.0.iter().all(|ls| ls.0.is_empty()),
        Geometry::MultiPolygon(mp) => mp.0.iter().all(|p| p.exterior().0.is_empty()),
        Geometry::GeometryCollection(gc) => gc.0.iter().all(is_empty_geometry),
    }
}

enum GeometrySource {
    Ready,
    Build {
        context: Arc<GeometryContext>,
        entity: Arc<VersionedEntity>,
        version: usize,
        timestamp: Timestamp,
    },
    Clip {
        builder: Arc<dyn GeometryBuilder>,
        base: Arc<LazyGeometry>,
        area: Arc<MultiPolygon<f64>>,
    },
}

/// A geometry computed on first access and memoised.
///
/// Failures and empty results both read as `None`; failures are logged
/// once when the computation runs.
pub struct LazyGeometry {
    cell: OnceLock<Option<Geometry<f64>>>,
    source: GeometrySource,
}

impl LazyGeometry {
    /// An already computed geometry.
    pub fn ready(geometry: Geometry<f64>) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(Some(geometry).filter(|g| !is_empty_geometry(g)));
        Self {
            cell,
            source: GeometrySource::Ready,
        }
    }

    /// The unclipped geometry of one version, built on demand.
    pub fn deferred_build(
        context: Arc<GeometryContext>,
        entity: Arc<VersionedEntity>,
        version: usize,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            cell: OnceLock::new(),
            source: GeometrySource::Build {
                context,
                entity,
                version,
                timestamp,
            },
        }
    }

    /// The intersection of another lazy geometry with an area, computed on
    /// demand.
    pub fn deferred_clip(
        builder: Arc<dyn GeometryBuilder>,
        base: Arc<LazyGeometry>,
        area: Arc<MultiPolygon<f64>>,
    ) -> Self {
        Self {
            cell: OnceLock::new(),
            source: GeometrySource::Clip {
                builder,
                base,
                area,
            },
        }
    }

    /// The geometry, computing it on first access.
    pub fn get(&self) -> Option<&Geometry<f64>> {
        self.cell.get_or_init(|| self.compute()).as_ref()
    }

    fn compute(&self) -> Option<Geometry<f64>> {
        let result = match &self.source {
            GeometrySource::Ready => return None,
            GeometrySource::Build {
                context,
                entity,
                version,
                timestamp,
            } => {
                let version = entity.versions().get(*version)?;
                context.build(entity, version, *timestamp).map_err(|e| {
                    warn!(entity = %entity.key(), timestamp = %timestamp, error = %e, "Dropping unbuildable geometry");
                })
            }
            GeometrySource::Clip {
                builder,
                base,
                area,
            } => {
                let base = base.get()?;
                builder.intersection(base, area).map_err(|e| {
                    warn!(error = %e, "Dropping geometry after failed intersection");
                })
            }
        };
        result.ok().filter(|g| !is_empty_geometry(g))
    }
}

impl fmt::Debug for LazyGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cell.get() {
            Some(geometry) => f.debug_tuple("LazyGeometry").field(geometry).finish(),
            None => f.write_str("LazyGeometry(<pending>)"),
        }
    }
}

/// Geometry capability backed by the `geo` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeoGeometryBuilder;

impl GeoGeometryBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Coordinates of the visible member nodes of a way version.
    fn way_coords(
        &self,
        version: &EntityVersion,
        timestamp: Timestamp,
        ctx: BuildContext<'_>,
    ) -> Vec<Coord<f64>> {
        version
            .members()
            .iter()
            .filter_map(|m| ctx.resolver.resolve(m.key()))
            .filter_map(|node| node.visible_at(timestamp).and_then(EntityVersion::coordinates))
            .map(|(lon, lat)| Coord { x: lon, y: lat })
            .collect()
    }

    fn build_way(
        &self,
        version: &EntityVersion,
        timestamp: Timestamp,
        ctx: BuildContext<'_>,
    ) -> EngineResult<Geometry<f64>> {
        let coords = self.way_coords(version, timestamp, ctx);
        match coords.len() {
            0 => Err(EngineError::Geometry(
                "way has no visible member nodes".to_string(),
            )),
            1 => Ok(Point(coords[0]).into()),
            n => {
                let closed = coords[0] == coords[n - 1];
                let line = LineString::new(coords);
                if closed && n >= 4 && ctx.tags.is_area(version) {
                    Ok(Polygon::new(line, Vec::new()).into())
                } else {
                    Ok(line.into())
                }
            }
        }
    }

    /// Visible version of a member way at `timestamp`.
    fn member_way(
        member: &MemberRef,
        timestamp: Timestamp,
        ctx: BuildContext<'_>,
    ) -> Option<(Arc<VersionedEntity>, usize)> {
        let way = ctx.resolver.resolve(member.key())?;
        let idx = way.version_index_at(timestamp)?;
        way.versions()[idx].visible.then_some((way, idx))
    }

    fn build_multipolygon(
        &self,
        version: &EntityVersion,
        timestamp: Timestamp,
        ctx: BuildContext<'_>,
    ) -> EngineResult<Geometry<f64>> {
        let mut outer_lines = Vec::new();
        let mut inner_lines = Vec::new();
        for member in version.members() {
            let is_outer = ctx.tags.is_outer_member(member);
            if !is_outer && !ctx.tags.is_inner_member(member) {
                continue;
            }
            let Some((way, idx)) = Self::member_way(member, timestamp, ctx) else {
                continue;
            };
            let coords = self.way_coords(&way.versions()[idx], timestamp, ctx);
            if coords.len() < 2 {
                continue;
            }
            if is_outer {
                outer_lines.push(coords);
            } else {
                inner_lines.push(coords);
            }
        }

        let outers = join_rings(outer_lines)?;
        if outers.is_empty() {
            return Err(EngineError::Geometry(
                "multipolygon has no outer ring".to_string(),
            ));
        }
        let mut inners = join_rings(inner_lines)?;

        let mut polygons: Vec<Polygon<f64>> = outers
            .into_iter()
            .map(|ring| Polygon::new(ring, Vec::new()))
            .collect();
        for polygon in &mut polygons {
            let (holes, rest): (Vec<_>, Vec<_>) = inners.into_iter().partition(|ring| {
                ring.0
                    .first()
                    .is_some_and(|c| polygon.contains(&Point(*c)))
            });
            inners = rest;
            for hole in holes {
                polygon.interiors_push(hole);
            }
        }
        if !inners.is_empty() {
            warn!(
                orphaned = inners.len(),
                "Inner rings outside every outer ring ignored"
            );
        }

        Ok(single_or_multi_polygon(MultiPolygon::new(polygons)))
    }

    fn build_relation(
        &self,
        version: &EntityVersion,
        timestamp: Timestamp,
        ctx: BuildContext<'_>,
    ) -> EngineResult<Geometry<f64>> {
        if ctx.tags.is_multipolygon(version) {
            return self.build_multipolygon(version, timestamp, ctx);
        }

        // Nested relations are skipped; they may form reference cycles.
        let parts: Vec<Geometry<f64>> = version
            .members()
            .iter()
            .filter_map(|member| match member.osm_type {
                OsmType::Node => ctx
                    .resolver
                    .resolve(member.key())?
                    .visible_at(timestamp)?
                    .coordinates()
                    .map(|(lon, lat)| Point::new(lon, lat).into()),
                OsmType::Way => {
                    let (way, idx) = Self::member_way(member, timestamp, ctx)?;
                    self.build_way(&way.versions()[idx], timestamp, ctx).ok()
                }
                OsmType::Relation => None,
            })
            .collect();
        if parts.is_empty() {
            return Err(EngineError::Geometry(
                "relation has no visible members".to_string(),
            ));
        }
        Ok(Geometry::GeometryCollection(GeometryCollection(parts)))
    }
}

impl GeometryBuilder for GeoGeometryBuilder {
    fn build(
        &self,
        entity: &VersionedEntity,
        version: &EntityVersion,
        timestamp: Timestamp,
        ctx: BuildContext<'_>,
    ) -> EngineResult<Geometry<f64>> {
        if !version.visible {
            return Err(EngineError::Geometry(format!(
                "{} is deleted at {timestamp}",
                entity.key()
            )));
        }
        let geometry = match &version.payload {
            Payload::Node { lon, lat } => Point::new(*lon, *lat).into(),
            Payload::Way { .. } => self.build_way(version, timestamp, ctx)?,
            Payload::Relation { .. } => self.build_relation(version, timestamp, ctx)?,
            Payload::Deleted => {
                return Err(EngineError::Geometry(format!(
                    "{} has no content at {timestamp}",
                    entity.key()
                )));
            }
        };
        validate(&geometry)?;
        Ok(geometry)
    }

    fn intersects(&self, geometry: &Geometry<f64>, area: &MultiPolygon<f64>) -> EngineResult<bool> {
        validate(geometry)?;
        guarded(|| relate_geometry(area, geometry).is_intersects())
    }

    fn intersection(
        &self,
        geometry: &Geometry<f64>,
        area: &MultiPolygon<f64>,
    ) -> EngineResult<Geometry<f64>> {
        validate(geometry)?;
        clip(geometry, area)
    }
}

/// Reject coordinates no topology operation can handle.
fn validate(geometry: &Geometry<f64>) -> EngineResult<()> {
    if geometry
        .coords_iter()
        .all(|c| c.x.is_finite() && c.y.is_finite())
    {
        Ok(())
    } else {
        Err(EngineError::Geometry(
            "geometry has non-finite coordinates".to_string(),
        ))
    }
}

/// Run a topology operation, turning a panic on degenerate input into a
/// geometry error.
fn guarded<T>(op: impl FnOnce() -> T) -> EngineResult<T> {
    catch_unwind(AssertUnwindSafe(op))
        .map_err(|_| EngineError::Geometry("topology operation failed".to_string()))
}

fn clip(geometry: &Geometry<f64>, area: &MultiPolygon<f64>) -> EngineResult<Geometry<f64>> {
    let clipped = match geometry {
        Geometry::Point(p) => {
            if guarded(|| area.relate(p).is_intersects())? {
                Geometry::Point(*p)
            } else {
                empty_geometry()
            }
        }
        Geometry::MultiPoint(mp) => {
            let mut kept = Vec::new();
            for p in &mp.0 {
                if guarded(|| area.relate(p).is_intersects())? {
                    kept.push(*p);
                }
            }
            MultiPoint(kept).into()
        }
        Geometry::Line(line) => clip_lines(area, MultiLineString::new(vec![LineString::new(vec![
            line.start, line.end,
        ])]))?,
        Geometry::LineString(ls) => clip_lines(area, MultiLineString::new(vec![ls.clone()]))?,
        Geometry::MultiLineString(mls) => clip_lines(area, mls.clone())?,
        Geometry::Polygon(p) => clip_polygons(area, MultiPolygon::new(vec![p.clone()]))?,
        Geometry::MultiPolygon(mp) => clip_polygons(area, mp.clone())?,
        Geometry::Rect(r) => clip_polygons(area, MultiPolygon::new(vec![r.to_polygon()]))?,
        Geometry::Triangle(t) => clip_polygons(area, MultiPolygon::new(vec![t.to_polygon()]))?,
        Geometry::GeometryCollection(gc) => {
            let mut parts = Vec::new();
            for part in &gc.0 {
                let part = clip(part, area)?;
                if !is_empty_geometry(&part) {
                    parts.push(part);
                }
            }
            Geometry::GeometryCollection(GeometryCollection(parts))
        }
    };
    Ok(clipped)
}

fn clip_lines(area: &MultiPolygon<f64>, lines: MultiLineString<f64>) -> EngineResult<Geometry<f64>> {
    let mut clipped = guarded(|| area.clip(&lines, false))?;
    clipped.0.retain(|ls| ls.0.len() >= 2);
    Ok(if clipped.0.len() == 1 {
        clipped.0.remove(0).into()
    } else {
        clipped.into()
    })
}

fn clip_polygons(area: &MultiPolygon<f64>, polygons: MultiPolygon<f64>) -> EngineResult<Geometry<f64>> {
    let clipped = guarded(|| area.intersection(&polygons))?;
    Ok(single_or_multi_polygon(clipped))
}

fn single_or_multi_polygon(mut polygons: MultiPolygon<f64>) -> Geometry<f64> {
    if polygons.0.len() == 1 {
        polygons.0.remove(0).into()
    } else {
        polygons.into()
    }
}

/// Join way segments end to end into closed rings.
fn join_rings(mut lines: Vec<Vec<Coord<f64>>>) -> EngineResult<Vec<LineString<f64>>> {
    let mut rings = Vec::new();
    while let Some(mut ring) = lines.pop() {
        while ring.first() != ring.last() {
            let Some(tail) = ring.last().copied() else {
                break;
            };
            let next = lines
                .iter()
                .position(|l| l.first() == Some(&tail) || l.last() == Some(&tail));
            let Some(idx) = next else {
                return Err(EngineError::Geometry("unclosed multipolygon ring".to_string()));
            };
            let mut segment = lines.swap_remove(idx);
            if segment.first() != Some(&tail) {
                segment.reverse();
            }
            ring.extend(segment.into_iter().skip(1));
        }
        if ring.len() < 4 {
            return Err(EngineError::Geometry(
                "multipolygon ring has fewer than four coordinates".to_string(),
            ));
        }
        rings.push(LineString::new(ring));
    }
    Ok(rings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bbox::BoundingBox;
    use crate::storage::MemoryStore;
    use crate::tags::{DefaultTagInterpreter, TagDictionary, TagTranslator};
    use crate::types::Tag;
    use geo::Area;

    fn ts(seconds: i64) -> Timestamp {
        Timestamp::from_epoch_seconds(seconds)
    }

    fn node(id: i64, lon: f64, lat: f64) -> VersionedEntity {
        VersionedEntity::new(
            OsmType::Node,
            id,
            vec![EntityVersion::new(ts(1), 1, Payload::Node { lon, lat })],
        )
        .unwrap()
    }

    fn way(id: i64, nodes: &[i64], tags: Vec<Tag>) -> VersionedEntity {
        VersionedEntity::new(
            OsmType::Way,
            id,
            vec![
                EntityVersion::new(
                    ts(2),
                    1,
                    Payload::Way {
                        nodes: nodes.iter().copied().map(MemberRef::node).collect(),
                    },
                )
                .with_tags(tags),
            ],
        )
        .unwrap()
    }

    /// A 4x4 square of nodes 1-4 and a 1x1 square of nodes 5-8 inside it.
    fn fixture() -> (MemoryStore, TagDictionary) {
        let store = MemoryStore::new(16);
        for (id, lon, lat) in [
            (1, 0.0, 0.0),
            (2, 4.0, 0.0),
            (3, 4.0, 4.0),
            (4, 0.0, 4.0),
            (5, 1.0, 1.0),
            (6, 2.0, 1.0),
            (7, 2.0, 2.0),
            (8, 1.0, 2.0),
        ] {
            store.insert(node(id, lon, lat));
        }
        let mut dict = TagDictionary::new();
        dict.intern_tag("building", "yes");
        dict.intern_tag("highway", "residential");
        dict.intern_tag("type", "multipolygon");
        dict.intern_role("outer");
        dict.intern_role("inner");
        (store, dict)
    }

    fn build(
        store: &MemoryStore,
        dict: &TagDictionary,
        entity: &VersionedEntity,
    ) -> EngineResult<Geometry<f64>> {
        let interpreter = DefaultTagInterpreter::new(dict);
        let ctx = BuildContext {
            resolver: store,
            tags: &interpreter,
        };
        let version = entity.versions().last().unwrap();
        GeoGeometryBuilder::new().build(entity, version, ts(10), ctx)
    }

    #[test]
    fn test_closed_area_way_is_polygon() {
        let (store, dict) = fixture();
        let building = dict.tag_id("building", "yes").unwrap();
        let geometry = build(&store, &dict, &way(10, &[1, 2, 3, 4, 1], vec![building])).unwrap();
        match geometry {
            Geometry::Polygon(p) => assert_eq!(p.unsigned_area(), 16.0),
            other => panic!("expected polygon, got {other:?}"),
        }
    }

    #[test]
    fn test_open_way_is_linestring() {
        let (store, dict) = fixture();
        let highway = dict.tag_id("highway", "residential").unwrap();
        let geometry = build(&store, &dict, &way(11, &[1, 2, 3], vec![highway])).unwrap();
        assert!(matches!(geometry, Geometry::LineString(ls) if ls.0.len() == 3));
    }

    #[test]
    fn test_way_without_nodes_fails() {
        let (store, dict) = fixture();
        let result = build(&store, &dict, &way(12, &[99, 98], Vec::new()));
        assert!(matches!(result, Err(EngineError::Geometry(_))));
    }

    #[test]
    fn test_multipolygon_with_hole() {
        let (store, dict) = fixture();
        // Outer ring split across two ways to exercise ring joining.
        store.insert(way(20, &[1, 2, 3], Vec::new()));
        store.insert(way(21, &[1, 4, 3], Vec::new()));
        store.insert(way(22, &[5, 6, 7, 8, 5], Vec::new()));
        let outer = dict.role_id("outer").unwrap();
        let inner = dict.role_id("inner").unwrap();
        let relation = VersionedEntity::new(
            OsmType::Relation,
            30,
            vec![
                EntityVersion::new(
                    ts(3),
                    1,
                    Payload::Relation {
                        members: vec![
                            MemberRef::new(OsmType::Way, 20, outer),
                            MemberRef::new(OsmType::Way, 21, outer),
                            MemberRef::new(OsmType::Way, 22, inner),
                        ],
                    },
                )
                .with_tags([dict.tag_id("type", "multipolygon").unwrap()]),
            ],
        )
        .unwrap();

        let geometry = build(&store, &dict, &relation).unwrap();
        match geometry {
            Geometry::Polygon(p) => {
                assert_eq!(p.interiors().len(), 1);
                assert_eq!(p.unsigned_area(), 15.0);
            }
            other => panic!("expected polygon, got {other:?}"),
        }
    }

    #[test]
    fn test_plain_relation_is_collection_and_clips_per_part() {
        let (store, dict) = fixture();
        let highway = dict.tag_id("highway", "residential").unwrap();
        store.insert(way(40, &[1, 2], vec![highway]));
        let relation = VersionedEntity::new(
            OsmType::Relation,
            41,
            vec![EntityVersion::new(
                ts(3),
                1,
                Payload::Relation {
                    members: vec![
                        MemberRef::new(OsmType::Node, 7, -1),
                        MemberRef::new(OsmType::Way, 40, -1),
                    ],
                },
            )],
        )
        .unwrap();

        let geometry = build(&store, &dict, &relation).unwrap();
        assert!(matches!(&geometry, Geometry::GeometryCollection(gc) if gc.0.len() == 2));

        let builder = GeoGeometryBuilder::new();
        let near_node = QueryArea::BBox(BoundingBox::new(1.5, 1.5, 3.0, 3.0)).to_multi_polygon();
        assert!(builder.intersects(&geometry, &near_node).unwrap());
        match builder.intersection(&geometry, &near_node).unwrap() {
            Geometry::GeometryCollection(gc) => {
                assert_eq!(gc.0.len(), 1);
                assert!(matches!(gc.0[0], Geometry::Point(_)));
            }
            other => panic!("expected collection, got {other:?}"),
        }

        let far = QueryArea::BBox(BoundingBox::new(10.0, 10.0, 11.0, 11.0)).to_multi_polygon();
        assert!(!builder.intersects(&geometry, &far).unwrap());
    }

    #[test]
    fn test_clip_linestring_to_bbox() {
        let area = QueryArea::BBox(BoundingBox::new(0.0, 0.0, 2.0, 2.0)).to_multi_polygon();
        let line: Geometry<f64> = LineString::from(vec![(-1.0, 1.0), (3.0, 1.0)]).into();
        let clipped = GeoGeometryBuilder::new().intersection(&line, &area).unwrap();
        match clipped {
            Geometry::LineString(ls) => {
                let xs: Vec<f64> = ls.0.iter().map(|c| c.x).collect();
                assert!(xs.contains(&0.0) && xs.contains(&2.0));
            }
            other => panic!("expected linestring, got {other:?}"),
        }
    }

    #[test]
    fn test_clip_point_outside_is_empty() {
        let area = QueryArea::BBox(BoundingBox::new(0.0, 0.0, 1.0, 1.0)).to_multi_polygon();
        let point: Geometry<f64> = Point::new(5.0, 5.0).into();
        let clipped = GeoGeometryBuilder::new().intersection(&point, &area).unwrap();
        assert!(is_empty_geometry(&clipped));
    }

    #[test]
    fn test_non_finite_coordinates_rejected() {
        let area = QueryArea::BBox(BoundingBox::world()).to_multi_polygon();
        let point: Geometry<f64> = Point::new(f64::NAN, 0.0).into();
        assert!(GeoGeometryBuilder::new().intersects(&point, &area).is_err());
    }

    #[test]
    fn test_lazy_geometry_memoises() {
        let lazy = LazyGeometry::ready(Point::new(1.0, 1.0).into());
        assert!(lazy.get().is_some());
        assert!(std::ptr::eq(lazy.get().unwrap(), lazy.get().unwrap()));
        assert!(LazyGeometry::ready(empty_geometry()).get().is_none());
    }
}
