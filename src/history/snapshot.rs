use crate::geometry::LazyGeometry;
use crate::time::Timestamp;
use crate::types::{EntityVersion, VersionedEntity};
use geo_types::Geometry;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// How an entity's overall extent relates to the query area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Containment {
    /// Completely inside; geometries are used unclipped.
    Inside,
    /// Overlapping the boundary; geometries are clipped.
    Partial,
}

/// The state of one entity at one requested timestamp.
#[derive(Clone)]
pub struct Snapshot {
    timestamp: Timestamp,
    entity: Arc<VersionedEntity>,
    version: usize,
    geometry: Arc<LazyGeometry>,
    unclipped: Arc<LazyGeometry>,
    containment: Containment,
}

impl Snapshot {
    pub(crate) fn new(
        timestamp: Timestamp,
        entity: Arc<VersionedEntity>,
        version: usize,
        geometry: Arc<LazyGeometry>,
        unclipped: Arc<LazyGeometry>,
        containment: Containment,
    ) -> Self {
        Self {
            timestamp,
            entity,
            version,
            geometry,
            unclipped,
            containment,
        }
    }

    /// The requested timestamp this snapshot was taken at.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn entity(&self) -> &Arc<VersionedEntity> {
        &self.entity
    }

    /// The version active at the snapshot timestamp.
    pub fn version(&self) -> &EntityVersion {
        &self.entity.versions()[self.version]
    }

    pub fn version_index(&self) -> usize {
        self.version
    }

    /// Geometry clipped to the query area (or to a split region).
    ///
    /// Computed on first access. `None` when the geometry cannot be built.
    pub fn geometry(&self) -> Option<&Geometry<f64>> {
        self.geometry.get()
    }

    /// Geometry without any clipping.
    pub fn geometry_unclipped(&self) -> Option<&Geometry<f64>> {
        self.unclipped.get()
    }

    pub fn containment(&self) -> Containment {
        self.containment
    }

    pub(crate) fn lazy_geometry(&self) -> &Arc<LazyGeometry> {
        &self.geometry
    }

    /// The same snapshot with a different clipped geometry.
    pub(crate) fn with_geometry(&self, geometry: Arc<LazyGeometry>) -> Self {
        Self {
            geometry,
            containment: Containment::Partial,
            ..self.clone()
        }
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("timestamp", &self.timestamp)
            .field("entity", &self.entity.key())
            .field("version", &self.version().version)
            .field("containment", &self.containment)
            .finish()
    }
}

/// All snapshots of one entity, ordered by timestamp.
#[derive(Debug, Clone)]
pub struct EntitySnapshots {
    pub entity: Arc<VersionedEntity>,
    pub snapshots: Vec<Snapshot>,
}
