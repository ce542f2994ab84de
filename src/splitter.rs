//! Fan-out of records into named sub-regions.
//!
//! A [`RegionSplitter`] is built once from a map of region key → polygon.
//! Region envelopes go into an R-tree; each region additionally gets a
//! coarse grid whose cells are classified as inside, outside or on the
//! boundary of the polygon. The grid answers "is this bbox certainly
//! inside / certainly outside" without touching the polygon, so precise
//! intersections are only computed for records that straddle a boundary,
//! and then lazily.

use crate::bbox::BoundingBox;
use crate::error::{EngineError, EngineResult};
use crate::geometry::{GeometryBuilder, LazyGeometry};
use crate::history::{Contribution, Snapshot};
use geo::{BoundingRect, Relate};
use geo_types::{Geometry, MultiPolygon};
use rstar::{AABB, RTree, RTreeObject};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Grid resolution per axis.
const GRID_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GridClass {
    Inside,
    Outside,
    Boundary,
}

/// A region polygon with precomputed fast containment tests.
#[derive(Debug)]
pub struct PreparedRegion {
    polygon: Arc<MultiPolygon<f64>>,
    bbox: BoundingBox,
    /// Row-major, empty when the bbox is degenerate.
    grid: Vec<GridClass>,
}

impl PreparedRegion {
    pub fn new(polygon: MultiPolygon<f64>) -> EngineResult<Self> {
        let bbox = polygon
            .bounding_rect()
            .map(BoundingBox::from)
            .ok_or_else(|| EngineError::invalid_configuration("region polygon is empty"))?;

        let width = bbox.max_lon - bbox.min_lon;
        let height = bbox.max_lat - bbox.min_lat;
        let mut grid = Vec::new();
        if width > 0.0 && height > 0.0 {
            let (dx, dy) = (width / GRID_SIZE as f64, height / GRID_SIZE as f64);
            grid.reserve(GRID_SIZE * GRID_SIZE);
            for row in 0..GRID_SIZE {
                for col in 0..GRID_SIZE {
                    let cell = BoundingBox::new(
                        bbox.min_lon + col as f64 * dx,
                        bbox.min_lat + row as f64 * dy,
                        bbox.min_lon + (col + 1) as f64 * dx,
                        bbox.min_lat + (row + 1) as f64 * dy,
                    );
                    let matrix = polygon.relate(&cell.to_polygon());
                    grid.push(if matrix.is_contains() {
                        GridClass::Inside
                    } else if !matrix.is_intersects() {
                        GridClass::Outside
                    } else {
                        GridClass::Boundary
                    });
                }
            }
        }

        Ok(Self {
            polygon: Arc::new(polygon),
            bbox,
            grid,
        })
    }

    pub fn polygon(&self) -> &Arc<MultiPolygon<f64>> {
        &self.polygon
    }

    pub fn bbox(&self) -> BoundingBox {
        self.bbox
    }

    /// True only if the bbox certainly does not touch the polygon.
    pub fn is_outside(&self, bbox: &BoundingBox) -> bool {
        if !self.bbox.intersects(bbox) {
            return true;
        }
        self.covered_cells(bbox)
            .is_some_and(|mut cells| cells.all(|class| class == GridClass::Outside))
    }

    /// True only if the bbox certainly lies within the polygon.
    pub fn is_inside(&self, bbox: &BoundingBox) -> bool {
        self.bbox.contains(bbox)
            && self
                .covered_cells(bbox)
                .is_some_and(|mut cells| cells.all(|class| class == GridClass::Inside))
    }

    /// Classes of every grid cell touching the bbox.
    fn covered_cells(&self, bbox: &BoundingBox) -> Option<impl Iterator<Item = GridClass> + '_> {
        if self.grid.is_empty() {
            return None;
        }
        let col = |lon: f64| {
            let t = (lon - self.bbox.min_lon) / (self.bbox.max_lon - self.bbox.min_lon);
            ((t * GRID_SIZE as f64).floor().max(0.0) as usize).min(GRID_SIZE - 1)
        };
        let row = |lat: f64| {
            let t = (lat - self.bbox.min_lat) / (self.bbox.max_lat - self.bbox.min_lat);
            ((t * GRID_SIZE as f64).floor().max(0.0) as usize).min(GRID_SIZE - 1)
        };
        let (c0, c1) = (col(bbox.min_lon), col(bbox.max_lon));
        let (r0, r1) = (row(bbox.min_lat), row(bbox.max_lat));
        Some(
            (r0..=r1)
                .flat_map(move |r| (c0..=c1).map(move |c| r * GRID_SIZE + c))
                .map(|i| self.grid[i]),
        )
    }
}

struct RegionEntry {
    index: usize,
    envelope: AABB<[f64; 2]>,
}

impl RTreeObject for RegionEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

fn envelope_of(bbox: &BoundingBox) -> AABB<[f64; 2]> {
    AABB::from_corners([bbox.min_lon, bbox.min_lat], [bbox.max_lon, bbox.max_lat])
}

/// Splits records into named regions.
///
/// Read-only after construction and shared between workers.
pub struct RegionSplitter<K> {
    regions: Vec<(K, PreparedRegion)>,
    index: RTree<RegionEntry>,
    builder: Arc<dyn GeometryBuilder>,
}

impl<K: Ord + Clone> RegionSplitter<K> {
    /// Prepare a set of regions. Fails when there are no regions or one of
    /// them is empty.
    pub fn new<P: Into<MultiPolygon<f64>>>(
        regions: impl IntoIterator<Item = (K, P)>,
        builder: Arc<dyn GeometryBuilder>,
    ) -> EngineResult<Self> {
        let regions: BTreeMap<K, MultiPolygon<f64>> = regions
            .into_iter()
            .map(|(key, polygon)| (key, polygon.into()))
            .collect();
        if regions.is_empty() {
            return Err(EngineError::invalid_configuration(
                "region splitter needs at least one region",
            ));
        }

        let regions = regions
            .into_iter()
            .map(|(key, polygon)| Ok((key, PreparedRegion::new(polygon)?)))
            .collect::<EngineResult<Vec<_>>>()?;
        let entries = regions
            .iter()
            .enumerate()
            .map(|(index, (_, region))| RegionEntry {
                index,
                envelope: envelope_of(&region.bbox),
            })
            .collect();
        debug!(regions = regions.len(), "Prepared region splitter");

        Ok(Self {
            regions,
            index: RTree::bulk_load(entries),
            builder,
        })
    }

    /// Region keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.regions.iter().map(|(key, _)| key)
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Split one record into the regions it touches.
    pub fn split<T: Splittable>(&self, item: T) -> Vec<(K, T)> {
        item.split_by(self)
    }

    /// Region-by-region split of a single record.
    fn split_one<T: Splittable>(&self, item: &T) -> Vec<(K, T)> {
        let extent = item.extent();
        let mut candidates: Vec<usize> = match &extent {
            Some(bbox) => self
                .index
                .locate_in_envelope_intersecting(&envelope_of(bbox))
                .map(|entry| entry.index)
                .collect(),
            None => (0..self.regions.len()).collect(),
        };
        candidates.sort_unstable();

        let mut parts = Vec::new();
        for idx in candidates {
            let (key, region) = &self.regions[idx];
            if let Some(bbox) = &extent {
                if region.is_outside(bbox) {
                    continue;
                }
                if region.is_inside(bbox) {
                    parts.push((key.clone(), item.clone()));
                    continue;
                }
            }
            if let Some(part) = item.restrict_to(region, &self.builder) {
                parts.push((key.clone(), part));
            }
        }
        parts
    }
}

/// Records that can be split into regions.
pub trait Splittable: Clone + Send + 'static {
    /// Extent of the whole entity history.
    fn extent(&self) -> Option<BoundingBox>;

    /// The record restricted to a region it straddles; `None` when nothing
    /// of it lies inside.
    fn restrict_to(&self, region: &PreparedRegion, builder: &Arc<dyn GeometryBuilder>)
    -> Option<Self>;

    /// Split into `(region, record)` pairs.
    fn split_by<K: Ord + Clone>(self, splitter: &RegionSplitter<K>) -> Vec<(K, Self)> {
        splitter.split_one(&self)
    }
}

/// Where a geometry stands relative to one region.
enum Placement {
    Inside,
    Outside,
    Straddling,
}

fn place(
    geometry: &Geometry<f64>,
    region: &PreparedRegion,
    builder: &Arc<dyn GeometryBuilder>,
) -> Option<Placement> {
    let bbox = BoundingBox::from_geometry(geometry)?;
    if region.is_outside(&bbox) {
        return Some(Placement::Outside);
    }
    if region.is_inside(&bbox) {
        return Some(Placement::Inside);
    }
    match builder.intersects(geometry, region.polygon()) {
        Ok(true) => Some(Placement::Straddling),
        Ok(false) => Some(Placement::Outside),
        Err(e) => {
            warn!(error = %e, "Dropping record from region after failed intersection test");
            None
        }
    }
}

fn clip_lazily(
    base: &Arc<LazyGeometry>,
    region: &PreparedRegion,
    builder: &Arc<dyn GeometryBuilder>,
) -> Arc<LazyGeometry> {
    Arc::new(LazyGeometry::deferred_clip(
        builder.clone(),
        base.clone(),
        region.polygon().clone(),
    ))
}

impl Splittable for Snapshot {
    fn extent(&self) -> Option<BoundingBox> {
        self.entity().bbox()
    }

    fn restrict_to(
        &self,
        region: &PreparedRegion,
        builder: &Arc<dyn GeometryBuilder>,
    ) -> Option<Self> {
        let geometry = self.geometry()?;
        match place(geometry, region, builder)? {
            Placement::Outside => None,
            Placement::Inside => Some(self.clone()),
            Placement::Straddling => Some(
                self.with_geometry(clip_lazily(self.lazy_geometry(), region, builder)),
            ),
        }
    }
}

impl Splittable for Contribution {
    fn extent(&self) -> Option<BoundingBox> {
        self.entity().bbox()
    }

    fn restrict_to(
        &self,
        region: &PreparedRegion,
        builder: &Arc<dyn GeometryBuilder>,
    ) -> Option<Self> {
        let (before, after) = self.states();
        let mut inside = true;
        let mut touching = false;
        for state in [before, after].into_iter().flatten() {
            let Some(geometry) = state.geometry.get() else {
                continue;
            };
            match place(geometry, region, builder)? {
                Placement::Outside => inside = false,
                Placement::Inside => touching = true,
                Placement::Straddling => {
                    inside = false;
                    touching = true;
                }
            }
        }
        if !touching {
            return None;
        }
        if inside {
            return Some(self.clone());
        }
        Some(self.with_geometries(
            before.map(|s| clip_lazily(&s.geometry, region, builder)),
            after.map(|s| clip_lazily(&s.geometry, region, builder)),
        ))
    }
}

/// Entity groups split element-wise; each region receives the group's
/// elements that touch it, in their original order.
impl<T: Splittable> Splittable for Vec<T> {
    fn extent(&self) -> Option<BoundingBox> {
        self.iter()
            .map(Splittable::extent)
            .collect::<Option<Vec<_>>>()?
            .into_iter()
            .reduce(|a, b| a.union(&b))
    }

    fn restrict_to(
        &self,
        region: &PreparedRegion,
        builder: &Arc<dyn GeometryBuilder>,
    ) -> Option<Self> {
        let parts: Vec<T> = self
            .iter()
            .filter_map(|item| item.restrict_to(region, builder))
            .collect();
        (!parts.is_empty()).then_some(parts)
    }

    fn split_by<K: Ord + Clone>(self, splitter: &RegionSplitter<K>) -> Vec<(K, Self)> {
        let mut groups: BTreeMap<K, Vec<T>> = BTreeMap::new();
        for item in self {
            for (key, part) in splitter.split(item) {
                groups.entry(key).or_default().push(part);
            }
        }
        groups.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::GeoGeometryBuilder;
    use geo_types::polygon;

    fn square(x0: f64, y0: f64, size: f64) -> MultiPolygon<f64> {
        BoundingBox::new(x0, y0, x0 + size, y0 + size)
            .to_polygon()
            .into()
    }

    fn triangle() -> MultiPolygon<f64> {
        polygon![(x: 0.0, y: 0.0), (x: 10.0, y: 0.0), (x: 0.0, y: 10.0), (x: 0.0, y: 0.0)].into()
    }

    #[test]
    fn test_grid_fast_predicates() {
        let region = PreparedRegion::new(triangle()).unwrap();
        assert!(region.is_inside(&BoundingBox::new(0.5, 0.5, 1.5, 1.5)));
        assert!(region.is_outside(&BoundingBox::new(8.0, 8.0, 9.5, 9.5)));
        assert!(region.is_outside(&BoundingBox::new(20.0, 20.0, 21.0, 21.0)));
        // Straddling the hypotenuse: neither test may claim certainty.
        let straddling = BoundingBox::new(4.0, 4.0, 6.0, 6.0);
        assert!(!region.is_inside(&straddling));
        assert!(!region.is_outside(&straddling));
    }

    #[test]
    fn test_rejects_empty_region_set() {
        let result = RegionSplitter::<u8>::new(
            Vec::<(u8, MultiPolygon<f64>)>::new(),
            Arc::new(GeoGeometryBuilder::new()),
        );
        assert!(matches!(result, Err(EngineError::InvalidConfiguration { .. })));
    }

    #[test]
    fn test_keys_sorted() {
        let splitter = RegionSplitter::new(
            [("west", square(0.0, 0.0, 1.0)), ("east", square(1.0, 0.0, 1.0))],
            Arc::new(GeoGeometryBuilder::new()),
        )
        .unwrap();
        assert_eq!(splitter.keys().copied().collect::<Vec<_>>(), vec!["east", "west"]);
        assert_eq!(splitter.len(), 2);
    }
}
