//! Engine configuration.

use crate::error::EngineResult;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a [`HistoryEngine`](crate::HistoryEngine) and the
/// queries it creates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Reduce cells on the rayon thread pool (default: true).
    pub parallel: bool,
    /// Minimum number of cells before a reduction goes parallel (default: 2).
    pub parallel_threshold: usize,
    /// Deadline for a whole reduction (default: none).
    #[serde(rename = "timeout_ms", with = "optional_millis")]
    pub timeout: Option<Duration>,
    /// Match tag filters of old-style multipolygons against their outer
    /// way (default: false).
    pub include_legacy_multipolygons: bool,
    /// Entities per cell of the in-memory backend (default: 256).
    pub cell_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallel: true,
            parallel_threshold: 2,
            timeout: None,
            include_legacy_multipolygons: false,
            cell_capacity: 256,
        }
    }
}

impl EngineConfig {
    /// Create a config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a config from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> EngineResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Enable or disable parallel reduction.
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Set the cell count at which reductions go parallel.
    pub fn parallel_threshold(mut self, cells: usize) -> Self {
        self.parallel_threshold = cells;
        self
    }

    /// Set the reduction deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn include_legacy_multipolygons(mut self, include: bool) -> Self {
        self.include_legacy_multipolygons = include;
        self
    }

    pub fn cell_capacity(mut self, capacity: usize) -> Self {
        self.cell_capacity = capacity;
        self
    }
}

mod optional_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.parallel);
        assert_eq!(config.parallel_threshold, 2);
        assert_eq!(config.timeout, None);
        assert!(!config.include_legacy_multipolygons);
        assert_eq!(config.cell_capacity, 256);
    }

    #[test]
    fn test_from_json_partial() {
        let config = EngineConfig::from_json(r#"{"parallel": false, "timeout_ms": 1500}"#).unwrap();
        assert!(!config.parallel);
        assert_eq!(config.timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.cell_capacity, 256);
    }

    #[test]
    fn test_json_roundtrip() {
        let config = EngineConfig::new()
            .timeout(Duration::from_secs(2))
            .include_legacy_multipolygons(true);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"timeout_ms\":2000"));
        assert_eq!(EngineConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_invalid_json() {
        assert!(EngineConfig::from_json("{not json").is_err());
    }
}
