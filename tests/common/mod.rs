//! Shared fixtures for the integration suites.
#![allow(dead_code)]

use geo_types::{Polygon, polygon};
use osh_engine::prelude::*;
use std::sync::Arc;

pub fn ts(seconds: i64) -> Timestamp {
    Timestamp::from_epoch_seconds(seconds)
}

pub fn times(seconds: &[i64]) -> Timestamps {
    Timestamps::list(seconds.iter().copied().map(ts)).unwrap()
}

pub fn square(x0: f64, y0: f64, size: f64) -> Polygon<f64> {
    polygon![
        (x: x0, y: y0),
        (x: x0 + size, y: y0),
        (x: x0 + size, y: y0 + size),
        (x: x0, y: y0 + size),
        (x: x0, y: y0),
    ]
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A tag dictionary and an in-memory store being filled for one test.
pub struct World {
    pub tags: TagDictionary,
    pub store: Arc<MemoryStore>,
}

impl World {
    /// Small cells so that even tiny datasets span several partitions.
    pub fn new() -> Self {
        init_tracing();
        let config = EngineConfig::default().cell_capacity(2);
        Self {
            tags: TagDictionary::new(),
            store: Arc::new(MemoryStore::from_config(&config)),
        }
    }

    pub fn tag(&mut self, key: &str, value: &str) -> Tag {
        self.tags.intern_tag(key, value)
    }

    pub fn role(&mut self, role: &str) -> i32 {
        self.tags.intern_role(role)
    }

    pub fn insert(&self, osm_type: OsmType, id: i64, versions: Vec<EntityVersion>) {
        self.store
            .insert(VersionedEntity::new(osm_type, id, versions).unwrap());
    }

    /// A node that never changes after its creation at `t`.
    pub fn node(&self, id: i64, t: i64, lon: f64, lat: f64, tags: &[Tag]) {
        self.insert(
            OsmType::Node,
            id,
            vec![node_version(t, 1, lon, lat).with_tags(tags.iter().copied())],
        );
    }

    /// A way over existing nodes, created at `t`.
    pub fn way(&self, id: i64, t: i64, nodes: &[i64], tags: &[Tag]) {
        self.insert(
            OsmType::Way,
            id,
            vec![way_version(t, 1, nodes).with_tags(tags.iter().copied())],
        );
    }

    /// Four nodes and a closed way forming an axis-aligned square.
    pub fn square_way(&self, id: i64, first_node: i64, t: i64, x0: f64, y0: f64, size: f64, tags: &[Tag]) {
        let corners = [(x0, y0), (x0 + size, y0), (x0 + size, y0 + size), (x0, y0 + size)];
        for (i, (lon, lat)) in corners.into_iter().enumerate() {
            self.node(first_node + i as i64, t, lon, lat, &[]);
        }
        let ids: Vec<i64> = (0..4).map(|i| first_node + i).chain([first_node]).collect();
        self.way(id, t, &ids, tags);
    }

    pub fn engine(&self, config: EngineConfig) -> HistoryEngine {
        HistoryEngine::new(self.store.clone(), Arc::new(self.tags.clone()), config)
    }

    pub fn sequential(&self) -> HistoryEngine {
        self.engine(EngineConfig::default().parallel(false))
    }

    pub fn parallel(&self) -> HistoryEngine {
        self.engine(EngineConfig::default().parallel(true).parallel_threshold(1))
    }
}

pub fn node_version(t: i64, version: u32, lon: f64, lat: f64) -> EntityVersion {
    EntityVersion::new(ts(t), version, Payload::Node { lon, lat })
}

pub fn way_version(t: i64, version: u32, nodes: &[i64]) -> EntityVersion {
    EntityVersion::new(
        ts(t),
        version,
        Payload::Way {
            nodes: nodes.iter().copied().map(MemberRef::node).collect(),
        },
    )
}
