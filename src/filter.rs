/// Tag and type filters for entity selection.
///
/// Filters are resolved against a [`TagTranslator`] when they are built, so
/// evaluation only compares integers. A filter naming a key or value absent
/// from the dictionary cannot match anything and becomes
/// [`TagFilter::Nothing`] instead of failing.
///
/// Every filter can be evaluated at two granularities:
///
/// - `may_match_entity`: cheap pre-check on the whole history (does any
///   version possibly match), used before any geometry is materialised
/// - `matches_version`: the exact test on one version
use crate::error::EngineResult;
use crate::tags::TagTranslator;
use crate::types::{EntityVersion, OsmType, Tag, VersionedEntity};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Predicate on a single materialised version.
pub type VersionPredicate = Arc<dyn Fn(&EntityVersion) -> bool + Send + Sync>;

/// Predicate on a whole entity history, evaluated before materialisation.
pub type EntityPredicate = Arc<dyn Fn(&VersionedEntity) -> bool + Send + Sync>;

/// A filter on the tags of a version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TagFilter {
    /// Key present with any value.
    Key(i32),
    /// Exact key/value pair.
    Tag(Tag),
    /// Key present with one of several values.
    TagIn { key: i32, values: BTreeSet<i32> },
    /// Any of a list of key/value pairs.
    AnyOf(Vec<Tag>),
    /// Matches nothing (unresolvable key or value).
    Nothing,
}

impl TagFilter {
    /// Create a key filter.
    pub fn key(translator: &dyn TagTranslator, key: &str) -> Self {
        translator.key_id(key).map_or(Self::Nothing, Self::Key)
    }

    /// Create a key=value filter.
    pub fn tag(translator: &dyn TagTranslator, key: &str, value: &str) -> Self {
        translator.tag_id(key, value).map_or(Self::Nothing, Self::Tag)
    }

    /// Create a key∈{values} filter; unknown values are dropped.
    pub fn tag_in(translator: &dyn TagTranslator, key: &str, values: &[&str]) -> Self {
        let Some(key_id) = translator.key_id(key) else {
            return Self::Nothing;
        };
        let values: BTreeSet<i32> = values
            .iter()
            .filter_map(|v| translator.tag_id(key, v))
            .map(|t| t.value)
            .collect();
        Self::tag_in_ids(key_id, values)
    }

    /// Create a filter matching values of `key` against a regex.
    ///
    /// The pattern is evaluated once against the dictionary, producing the
    /// set of matching value ids.
    pub fn value_matches(
        translator: &dyn TagTranslator,
        key: &str,
        pattern: &str,
    ) -> EngineResult<Self> {
        let regex = Regex::new(pattern)?;
        let Some(key_id) = translator.key_id(key) else {
            return Ok(Self::Nothing);
        };
        let values: BTreeSet<i32> = translator
            .values_of(key_id)
            .into_iter()
            .filter(|(_, name)| regex.is_match(name))
            .map(|(id, _)| id)
            .collect();
        Ok(Self::tag_in_ids(key_id, values))
    }

    /// Create a filter matching any of a list of key/value pairs.
    pub fn any_of(translator: &dyn TagTranslator, tags: &[(&str, &str)]) -> Self {
        let tags: Vec<Tag> = tags
            .iter()
            .filter_map(|(k, v)| translator.tag_id(k, v))
            .collect();
        if tags.is_empty() {
            Self::Nothing
        } else {
            Self::AnyOf(tags)
        }
    }

    fn tag_in_ids(key: i32, values: BTreeSet<i32>) -> Self {
        if values.is_empty() {
            Self::Nothing
        } else {
            Self::TagIn { key, values }
        }
    }

    /// Evaluate this filter against one version.
    pub fn matches_version(&self, version: &EntityVersion) -> bool {
        match self {
            TagFilter::Key(key) => version.has_key(*key),
            TagFilter::Tag(tag) => version.has_tag(tag.key, tag.value),
            TagFilter::TagIn { key, values } => version
                .tag_value(*key)
                .is_some_and(|v| values.contains(&v)),
            TagFilter::AnyOf(tags) => tags.iter().any(|t| version.has_tag(t.key, t.value)),
            TagFilter::Nothing => false,
        }
    }

    /// Whether any version of the entity could match.
    pub fn may_match_entity(&self, entity: &VersionedEntity) -> bool {
        match self {
            TagFilter::Key(key) => entity.ever_has_key(*key),
            TagFilter::Tag(Tag { key, .. }) | TagFilter::TagIn { key, .. } => {
                entity.ever_has_key(*key)
            }
            TagFilter::AnyOf(tags) => tags.iter().any(|t| entity.ever_has_key(t.key)),
            TagFilter::Nothing => false,
        }
    }
}

/// Set of entity types to include.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeFilter {
    pub node: bool,
    pub way: bool,
    pub relation: bool,
}

impl TypeFilter {
    /// All three types.
    pub fn all() -> Self {
        Self {
            node: true,
            way: true,
            relation: true,
        }
    }

    /// Only the listed types.
    pub fn only(types: impl IntoIterator<Item = OsmType>) -> Self {
        let mut filter = Self {
            node: false,
            way: false,
            relation: false,
        };
        for t in types {
            match t {
                OsmType::Node => filter.node = true,
                OsmType::Way => filter.way = true,
                OsmType::Relation => filter.relation = true,
            }
        }
        filter
    }

    pub fn contains(&self, osm_type: OsmType) -> bool {
        match osm_type {
            OsmType::Node => self.node,
            OsmType::Way => self.way,
            OsmType::Relation => self.relation,
        }
    }
}

impl Default for TypeFilter {
    fn default() -> Self {
        Self::all()
    }
}
