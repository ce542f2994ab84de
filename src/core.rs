/// The engine entry point.
///
/// A [`HistoryEngine`] binds a backend, a tag dictionary and the geometry
/// collaborators together and hands out fresh query descriptors for the two
/// views of the data. It is cheap to clone and can be shared across
/// threads; every query it creates is independent of the others.
///
/// # Example
///
/// ```ignore
/// use osh_engine::{EngineConfig, HistoryEngine, MemoryStore, TagDictionary, Timestamps};
/// use std::sync::Arc;
///
/// let store = Arc::new(MemoryStore::default());
/// let tags = Arc::new(TagDictionary::new());
/// let engine = HistoryEngine::new(store, tags, EngineConfig::default());
///
/// let buildings = engine
///     .snapshot_view()
///     .timestamps(Timestamps::parse("2015-01-01/2020-01-01/P1Y")?)
///     .where_key("building")
///     .aggregate_by_timestamp()
///     .count()?;
/// ```
use crate::config::EngineConfig;
use crate::geometry::{GeoGeometryBuilder, GeometryBuilder};
use crate::history::{Contribution, Snapshot};
use crate::pipeline::{Backend, MapReducer, View};
use crate::storage::CellProvider;
use crate::tags::{DefaultTagInterpreter, TagInterpreter, TagTranslator};
use std::sync::Arc;
use tracing::info;

/// Shared handle to a history backend.
#[derive(Clone)]
pub struct HistoryEngine {
    backend: Backend,
    config: EngineConfig,
}

impl std::fmt::Debug for HistoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl HistoryEngine {
    /// Create an engine over a backend.
    ///
    /// Tag interpretation defaults to [`DefaultTagInterpreter`] built from
    /// `translator`, and geometries are built with [`GeoGeometryBuilder`].
    pub fn new<B>(backend: Arc<B>, translator: Arc<dyn TagTranslator>, config: EngineConfig) -> Self
    where
        B: CellProvider + 'static,
    {
        let interpreter = Arc::new(DefaultTagInterpreter::new(translator.as_ref()));
        info!(
            parallel = config.parallel,
            timeout_ms = config.timeout.map(|t| t.as_millis() as u64),
            legacy_multipolygons = config.include_legacy_multipolygons,
            "Created history engine"
        );
        Self {
            backend: Backend {
                cells: backend.clone(),
                resolver: backend,
                translator,
                interpreter,
                geometry: Arc::new(GeoGeometryBuilder::new()),
            },
            config,
        }
    }

    /// Replace the tag interpreter.
    pub fn with_interpreter(mut self, interpreter: Arc<dyn TagInterpreter>) -> Self {
        self.backend.interpreter = interpreter;
        self
    }

    /// Replace the geometry builder.
    pub fn with_geometry_builder(mut self, builder: Arc<dyn GeometryBuilder>) -> Self {
        self.backend.geometry = builder;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// A query over entity states at the requested timestamps.
    pub fn snapshot_view(&self) -> MapReducer<Snapshot> {
        MapReducer::new(self.backend.clone(), self.config.clone(), View::Snapshot)
    }

    /// A query over the changes between the first and last requested
    /// timestamp.
    pub fn contribution_view(&self) -> MapReducer<Contribution> {
        MapReducer::new(self.backend.clone(), self.config.clone(), View::Contribution)
    }
}
