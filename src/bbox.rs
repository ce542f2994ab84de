//! Spatial extents: bounding boxes and the query's area of interest.

use crate::geometry::relate_geometry;
use geo::BoundingRect;
use geo_types::{Coord, Geometry, LineString, MultiPolygon, Point, Polygon, Rect};
use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box in WGS84 degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    /// Create a bounding box; corners are normalised so min <= max.
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        Self {
            min_lon: min_lon.min(max_lon),
            min_lat: min_lat.min(max_lat),
            max_lon: min_lon.max(max_lon),
            max_lat: min_lat.max(max_lat),
        }
    }

    /// The whole globe.
    pub fn world() -> Self {
        Self::new(-180.0, -90.0, 180.0, 90.0)
    }

    /// A degenerate box around one coordinate.
    pub fn from_point(lon: f64, lat: f64) -> Self {
        Self::new(lon, lat, lon, lat)
    }

    /// Bounding box of a geometry, `None` for empty geometries.
    pub fn from_geometry(geometry: &Geometry<f64>) -> Option<Self> {
        geometry.bounding_rect().map(Self::from)
    }

    /// Check if this bbox intersects another (touching edges count).
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_lon <= other.max_lon
            && self.max_lon >= other.min_lon
            && self.min_lat <= other.max_lat
            && self.max_lat >= other.min_lat
    }

    /// Check if this bbox fully contains another bbox.
    pub fn contains(&self, other: &BoundingBox) -> bool {
        self.min_lon <= other.min_lon
            && self.max_lon >= other.max_lon
            && self.min_lat <= other.min_lat
            && self.max_lat >= other.max_lat
    }

    /// Check if this bbox contains a coordinate.
    pub fn contains_point(&self, lon: f64, lat: f64) -> bool {
        lon >= self.min_lon && lon <= self.max_lon && lat >= self.min_lat && lat <= self.max_lat
    }

    /// Smallest box covering both.
    pub fn union(&self, other: &BoundingBox) -> Self {
        Self {
            min_lon: self.min_lon.min(other.min_lon),
            min_lat: self.min_lat.min(other.min_lat),
            max_lon: self.max_lon.max(other.max_lon),
            max_lat: self.max_lat.max(other.max_lat),
        }
    }

    pub fn to_rect(&self) -> Rect<f64> {
        Rect::new(
            Coord {
                x: self.min_lon,
                y: self.min_lat,
            },
            Coord {
                x: self.max_lon,
                y: self.max_lat,
            },
        )
    }

    pub fn to_polygon(&self) -> Polygon<f64> {
        self.to_rect().to_polygon()
    }

    /// The box as the simplest geometry covering it; degenerate boxes of
    /// points and axis-parallel lines would be invalid polygons.
    pub fn to_geometry(&self) -> Geometry<f64> {
        let lon_flat = self.min_lon == self.max_lon;
        let lat_flat = self.min_lat == self.max_lat;
        match (lon_flat, lat_flat) {
            (true, true) => Point::new(self.min_lon, self.min_lat).into(),
            (true, false) | (false, true) => LineString::from(vec![
                (self.min_lon, self.min_lat),
                (self.max_lon, self.max_lat),
            ])
            .into(),
            (false, false) => self.to_polygon().into(),
        }
    }
}

impl From<Rect<f64>> for BoundingBox {
    fn from(rect: Rect<f64>) -> Self {
        Self::new(rect.min().x, rect.min().y, rect.max().x, rect.max().y)
    }
}

/// The area of interest of a query.
///
/// Rectangular areas take the cheap path everywhere; polygonal areas need a
/// topology test for full containment and clip against the polygon itself.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryArea {
    BBox(BoundingBox),
    Polygon {
        polygon: MultiPolygon<f64>,
        envelope: BoundingBox,
    },
}

impl QueryArea {
    /// A polygonal area; `None` when the polygon is empty.
    pub fn polygon(polygon: impl Into<MultiPolygon<f64>>) -> Option<Self> {
        let polygon = polygon.into();
        let envelope = polygon.bounding_rect().map(BoundingBox::from)?;
        Some(Self::Polygon { polygon, envelope })
    }

    /// Bounding box of the area.
    pub fn envelope(&self) -> BoundingBox {
        match self {
            Self::BBox(bbox) => *bbox,
            Self::Polygon { envelope, .. } => *envelope,
        }
    }

    /// Whether an entity with the given bbox lies completely inside the area.
    pub fn contains_bbox(&self, bbox: &BoundingBox) -> bool {
        match self {
            Self::BBox(area) => area.contains(bbox),
            Self::Polygon { polygon, envelope } => {
                envelope.contains(bbox)
                    && relate_geometry(polygon, &bbox.to_geometry()).is_contains()
            }
        }
    }

    /// Whether an entity with the given bbox may touch the area.
    pub fn intersects_bbox(&self, bbox: &BoundingBox) -> bool {
        match self {
            Self::BBox(area) => area.intersects(bbox),
            Self::Polygon { polygon, envelope } => {
                envelope.intersects(bbox)
                    && relate_geometry(polygon, &bbox.to_geometry()).is_intersects()
            }
        }
    }

    /// The area as polygons, for clipping.
    pub fn to_multi_polygon(&self) -> MultiPolygon<f64> {
        match self {
            Self::BBox(bbox) => MultiPolygon::new(vec![bbox.to_polygon()]),
            Self::Polygon { polygon, .. } => polygon.clone(),
        }
    }
}

impl From<BoundingBox> for QueryArea {
    fn from(bbox: BoundingBox) -> Self {
        Self::BBox(bbox)
    }
}
