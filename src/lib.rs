//! # osh-engine: analytics over full OpenStreetMap history
//!
//! The engine answers questions about how map data evolved: how many
//! buildings existed in a region each month, how long the road network was
//! at a set of dates, who changed what and when. It reads versioned entity
//! histories from a backend and evaluates chainable map-reduce queries over
//! one of two views:
//!
//! - **snapshots**: the state of every entity at each requested timestamp
//! - **contributions**: every change between the first and last timestamp
//!
//! ## Quick Start
//!
//! ```ignore
//! use osh_engine::prelude::*;
//! use std::sync::Arc;
//!
//! let store = Arc::new(MemoryStore::default());
//! let mut tags = TagDictionary::new();
//! // ... intern tags and insert entity histories into the store ...
//! let engine = HistoryEngine::new(store, Arc::new(tags), EngineConfig::default());
//!
//! // Buildings per year inside a bbox
//! let counts = engine
//!     .snapshot_view()
//!     .area(BoundingBox::new(8.6, 49.3, 8.8, 49.5))
//!     .timestamps(Timestamps::parse("2012-01-01/2020-01-01/P1Y")?)
//!     .where_key("building")
//!     .aggregate_by_timestamp()
//!     .count()?;
//!
//! // Median building area per district, by year
//! let areas = engine
//!     .snapshot_view()
//!     .where_key("building")
//!     .aggregate_by_geometry(districts)?
//!     .aggregate_by_timestamp()
//!     .map(|s: Snapshot| s.geometry().map(|g| g.unsigned_area()).unwrap_or(0.0))
//!     .estimated_median()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//!   CellProvider ──▶ CellIterator ──▶ MapReducer<X> ──▶ MapAggregator<U, X>
//!   (backend)        (history)        (pipeline)        (aggregator, splitter)
//! ```
//!
//! 1. **Backend** (`storage`): cells of entity histories plus member lookup
//! 2. **History iteration** (`history`): floor lookup, filters, bbox and
//!    polygon clipping, contribution classification
//! 3. **Pipeline** (`pipeline`): typed transforms and associative,
//!    partition-parallel reductions
//! 4. **Aggregation** (`aggregator`, `splitter`): keyed reductions with
//!    zero-fill, combined keys and region splitting
//!
//! Geometries are built lazily and memoised per record; topology failures
//! affect only the record they occur in.

pub mod aggregator;
pub mod bbox;
pub mod config;
mod core;
pub mod digest;
mod error;
pub mod filter;
pub mod geometry;
pub mod history;
pub mod pipeline;
pub mod splitter;
pub mod storage;
pub mod tags;
pub mod time;
pub mod types;

// Public API exports
pub use aggregator::{CombinedIndex, MapAggregator, nest};
pub use bbox::{BoundingBox, QueryArea};
pub use config::EngineConfig;
pub use crate::core::HistoryEngine;
pub use digest::QuantileAccumulator;
pub use error::{EngineError, EngineResult};
pub use geometry::{GeoGeometryBuilder, GeometryBuilder};
pub use history::{Containment, Contribution, ContributionType, ContributionTypes, Snapshot};
pub use pipeline::{Grouping, MapReducer, View, WeightedValue};
pub use splitter::{RegionSplitter, Splittable};
pub use storage::{Cell, CellProvider, EntityResolver, MemoryStore};
pub use tags::{DefaultTagInterpreter, TagDictionary, TagInterpreter, TagTranslator};
pub use time::{Period, Timestamp, Timestamps};
pub use types::{EntityKey, EntityVersion, MemberRef, OsmType, Payload, Tag, VersionedEntity};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use osh_engine::prelude::*;
/// ```
pub mod prelude {
    pub use crate::aggregator::{CombinedIndex, MapAggregator, nest};
    pub use crate::bbox::{BoundingBox, QueryArea};
    pub use crate::config::EngineConfig;
    pub use crate::core::HistoryEngine;
    pub use crate::error::{EngineError, EngineResult};
    pub use crate::history::{Contribution, ContributionType, Snapshot};
    pub use crate::pipeline::{MapReducer, Timestamped, WeightedValue};
    pub use crate::storage::MemoryStore;
    pub use crate::tags::{TagDictionary, TagTranslator};
    pub use crate::time::{Period, Timestamp, Timestamps};
    pub use crate::types::{EntityVersion, MemberRef, OsmType, Payload, Tag, VersionedEntity};
}
