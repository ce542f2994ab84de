use crate::geometry::LazyGeometry;
use crate::time::Timestamp;
use crate::types::{EntityVersion, VersionedEntity};
use geo_types::Geometry;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Kinds of change a contribution can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ContributionType {
    Creation,
    Deletion,
    TagChange,
    GeometryChange,
}

impl ContributionType {
    const ALL: [ContributionType; 4] = [
        ContributionType::Creation,
        ContributionType::Deletion,
        ContributionType::TagChange,
        ContributionType::GeometryChange,
    ];

    fn bit(self) -> u8 {
        1 << self as u8
    }
}

/// A set of [`ContributionType`]s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ContributionTypes(u8);

impl ContributionTypes {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn with(mut self, kind: ContributionType) -> Self {
        self.0 |= kind.bit();
        self
    }

    pub fn contains(&self, kind: ContributionType) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = ContributionType> + '_ {
        ContributionType::ALL
            .into_iter()
            .filter(move |kind| self.contains(*kind))
    }
}

impl FromIterator<ContributionType> for ContributionTypes {
    fn from_iter<I: IntoIterator<Item = ContributionType>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), Self::with)
    }
}

/// Entity state on one side of a contribution.
#[derive(Clone)]
pub struct ContributionState {
    pub(crate) version: usize,
    pub(crate) geometry: Arc<LazyGeometry>,
}

/// A change of one entity between two consecutive observed states.
#[derive(Clone)]
pub struct Contribution {
    timestamp: Timestamp,
    changeset: i64,
    entity: Arc<VersionedEntity>,
    before: Option<ContributionState>,
    after: Option<ContributionState>,
    types: ContributionTypes,
}

impl Contribution {
    pub(crate) fn new(
        timestamp: Timestamp,
        changeset: i64,
        entity: Arc<VersionedEntity>,
        before: Option<ContributionState>,
        after: Option<ContributionState>,
        types: ContributionTypes,
    ) -> Self {
        Self {
            timestamp,
            changeset,
            entity,
            before,
            after,
            types,
        }
    }

    /// When the change happened.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Changeset of the edit that caused the change. For geometry changes
    /// caused by a member edit this is the member's changeset.
    pub fn changeset(&self) -> i64 {
        self.changeset
    }

    pub fn entity(&self) -> &Arc<VersionedEntity> {
        &self.entity
    }

    pub fn types(&self) -> ContributionTypes {
        self.types
    }

    pub fn is(&self, kind: ContributionType) -> bool {
        self.types.contains(kind)
    }

    /// Version before the change; `None` for creations.
    pub fn version_before(&self) -> Option<&EntityVersion> {
        self.before
            .as_ref()
            .map(|s| &self.entity.versions()[s.version])
    }

    /// Version after the change; `None` for deletions.
    pub fn version_after(&self) -> Option<&EntityVersion> {
        self.after
            .as_ref()
            .map(|s| &self.entity.versions()[s.version])
    }

    pub fn geometry_before(&self) -> Option<&Geometry<f64>> {
        self.before.as_ref().and_then(|s| s.geometry.get())
    }

    pub fn geometry_after(&self) -> Option<&Geometry<f64>> {
        self.after.as_ref().and_then(|s| s.geometry.get())
    }

    pub(crate) fn states(&self) -> (Option<&ContributionState>, Option<&ContributionState>) {
        (self.before.as_ref(), self.after.as_ref())
    }

    /// The same contribution with both geometries replaced.
    pub(crate) fn with_geometries(
        &self,
        before: Option<Arc<LazyGeometry>>,
        after: Option<Arc<LazyGeometry>>,
    ) -> Self {
        let replace = |state: &Option<ContributionState>, geometry: Option<Arc<LazyGeometry>>| {
            state.as_ref().zip(geometry).map(|(s, geometry)| ContributionState {
                version: s.version,
                geometry,
            })
        };
        Self {
            before: replace(&self.before, before),
            after: replace(&self.after, after),
            ..self.clone()
        }
    }
}

impl fmt::Debug for Contribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Contribution")
            .field("timestamp", &self.timestamp)
            .field("entity", &self.entity.key())
            .field("types", &self.types.iter().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_set() {
        let types: ContributionTypes = [ContributionType::TagChange, ContributionType::GeometryChange]
            .into_iter()
            .collect();
        assert!(types.contains(ContributionType::TagChange));
        assert!(!types.contains(ContributionType::Creation));
        assert_eq!(types.iter().count(), 2);
        assert!(ContributionTypes::empty().is_empty());
    }
}
