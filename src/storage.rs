/// Backend capabilities and the in-memory history store.
///
/// The engine does not own persistent storage. It consumes two
/// capabilities from whatever backend holds the data:
///
/// - [`EntityResolver`]: lookup of member entities by key, used to build way
///   and relation geometries at a given timestamp
/// - [`CellProvider`]: partitions of the entities overlapping a query area,
///   each [`Cell`] being the unit of parallel work
///
/// [`MemoryStore`] implements both on top of DashMap so that tests,
/// benchmarks and embedders can run queries without an external backend.
use crate::bbox::BoundingBox;
use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::types::{EntityKey, OsmType, VersionedEntity};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Lookup of sibling entities referenced by way and relation members.
pub trait EntityResolver: Send + Sync {
    /// The entity with the given key, if the backend holds it.
    fn resolve(&self, key: EntityKey) -> Option<Arc<VersionedEntity>>;
}

/// A partition of the entities touching a query area.
#[derive(Debug, Clone)]
pub struct Cell {
    pub id: u64,
    pub entities: Vec<Arc<VersionedEntity>>,
}

impl Cell {
    pub fn new(id: u64, entities: Vec<Arc<VersionedEntity>>) -> Self {
        Self { id, entities }
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// A source of cells for a query.
///
/// How entities are assigned to cells (grid scheme, cell ids) is entirely
/// up to the backend; the engine only requires that every entity touching
/// the area appears in exactly one returned cell.
pub trait CellProvider: EntityResolver {
    fn cells(&self, area: &BoundingBox) -> EngineResult<Vec<Cell>>;
}

/// In-memory store of entity histories.
///
/// Entities are kept behind `Arc` so cells and member lookups share them
/// without copying. Insert members before the ways and relations that
/// reference them; the overall bbox of a way or relation is derived from
/// its members at insert time.
#[derive(Debug)]
pub struct MemoryStore {
    entities: DashMap<EntityKey, Arc<VersionedEntity>>,
    cell_capacity: usize,
}

impl MemoryStore {
    /// Create an empty store that serves cells of at most `cell_capacity`
    /// entities.
    pub fn new(cell_capacity: usize) -> Self {
        Self {
            entities: DashMap::new(),
            cell_capacity: cell_capacity.max(1),
        }
    }

    /// Create an empty store partitioned by the configured cell capacity.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.cell_capacity)
    }

    /// Store an entity history, replacing any previous one with the same key.
    pub fn insert(&self, entity: VersionedEntity) -> Arc<VersionedEntity> {
        let entity = match (entity.osm_type(), entity.bbox()) {
            (OsmType::Node, _) | (_, Some(_)) => entity,
            (_, None) => match self.member_bbox(&entity) {
                Some(bbox) => entity.with_bbox(bbox),
                None => entity,
            },
        };
        let entity = Arc::new(entity);
        self.entities.insert(entity.key(), entity.clone());
        entity
    }

    /// Store several entity histories in order.
    pub fn insert_all(&self, entities: impl IntoIterator<Item = VersionedEntity>) {
        for entity in entities {
            self.insert(entity);
        }
    }

    /// Get an entity by key.
    pub fn get(&self, key: EntityKey) -> Option<Arc<VersionedEntity>> {
        self.entities.get(&key).map(|e| e.value().clone())
    }

    /// Number of stored entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Total number of versions across all entities.
    pub fn total_version_count(&self) -> usize {
        self.entities
            .iter()
            .map(|entry| entry.value().versions().len())
            .sum()
    }

    /// Union of the bboxes of every member referenced by any version.
    fn member_bbox(&self, entity: &VersionedEntity) -> Option<BoundingBox> {
        entity
            .versions()
            .iter()
            .flat_map(|v| v.members())
            .filter_map(|m| self.get(m.key()))
            .filter_map(|m| m.bbox())
            .reduce(|a, b| a.union(&b))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl EntityResolver for MemoryStore {
    fn resolve(&self, key: EntityKey) -> Option<Arc<VersionedEntity>> {
        self.get(key)
    }
}

impl CellProvider for MemoryStore {
    fn cells(&self, area: &BoundingBox) -> EngineResult<Vec<Cell>> {
        let mut selected: Vec<Arc<VersionedEntity>> = self
            .entities
            .iter()
            .filter(|entry| entry.value().bbox().is_none_or(|b| b.intersects(area)))
            .map(|entry| entry.value().clone())
            .collect();
        selected.sort_by_key(|e| e.key());

        let cells: Vec<Cell> = selected
            .chunks(self.cell_capacity)
            .enumerate()
            .map(|(id, chunk)| Cell::new(id as u64, chunk.to_vec()))
            .collect();
        debug!(
            entities = selected.len(),
            cells = cells.len(),
            "Selected cells from memory store"
        );
        Ok(cells)
    }
}
