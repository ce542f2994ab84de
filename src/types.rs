/// Core data model: OSM entities and their edit histories.
///
/// A [`VersionedEntity`] owns the complete, timestamp-ordered list of its
/// [`EntityVersion`]s. Way and relation versions refer to their members by
/// [`MemberRef`] only; the member histories live in sibling entities that
/// are looked up through an [`EntityResolver`](crate::storage::EntityResolver).
use crate::bbox::BoundingBox;
use crate::error::{EngineError, EngineResult};
use crate::time::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The three OSM entity types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsmType {
    Node,
    Way,
    Relation,
}

impl fmt::Display for OsmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsmType::Node => write!(f, "node"),
            OsmType::Way => write!(f, "way"),
            OsmType::Relation => write!(f, "relation"),
        }
    }
}

/// Identity of an entity: its type plus numeric id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub osm_type: OsmType,
    pub id: i64,
}

impl EntityKey {
    pub fn new(osm_type: OsmType, id: i64) -> Self {
        Self { osm_type, id }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.osm_type, self.id)
    }
}

/// A tag as a pair of dictionary ids.
///
/// Strings are translated to integers once, outside the engine, by a
/// [`TagTranslator`](crate::tags::TagTranslator).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub key: i32,
    pub value: i32,
}

impl Tag {
    pub fn new(key: i32, value: i32) -> Self {
        Self { key, value }
    }
}

/// Role id used for way node references, which carry no role.
pub const NO_ROLE: i32 = -1;

/// A reference from a way or relation version to a member entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemberRef {
    pub osm_type: OsmType,
    pub id: i64,
    pub role: i32,
}

impl MemberRef {
    pub fn new(osm_type: OsmType, id: i64, role: i32) -> Self {
        Self { osm_type, id, role }
    }

    /// A way's reference to one of its nodes.
    pub fn node(id: i64) -> Self {
        Self::new(OsmType::Node, id, NO_ROLE)
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.osm_type, self.id)
    }
}

/// Type-specific content of a version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Node { lon: f64, lat: f64 },
    Way { nodes: Vec<MemberRef> },
    Relation { members: Vec<MemberRef> },
    /// Deleted versions carry no content.
    Deleted,
}

/// One edit of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityVersion {
    pub timestamp: Timestamp,
    pub changeset: i64,
    pub user_id: i32,
    pub version: u32,
    pub visible: bool,
    /// Sorted by key.
    tags: Vec<Tag>,
    pub payload: Payload,
}

impl EntityVersion {
    /// A visible, untagged version.
    pub fn new(timestamp: Timestamp, version: u32, payload: Payload) -> Self {
        Self {
            timestamp,
            changeset: 0,
            user_id: 0,
            version,
            visible: true,
            tags: Vec::new(),
            payload,
        }
    }

    /// A deletion.
    pub fn deleted(timestamp: Timestamp, version: u32) -> Self {
        Self {
            visible: false,
            ..Self::new(timestamp, version, Payload::Deleted)
        }
    }

    /// Replace the tag set.
    pub fn with_tags(mut self, tags: impl IntoIterator<Item = Tag>) -> Self {
        self.tags = tags.into_iter().collect();
        self.tags.sort_unstable();
        self.tags.dedup_by_key(|t| t.key);
        self
    }

    /// Set changeset and author.
    pub fn with_changeset(mut self, changeset: i64, user_id: i32) -> Self {
        self.changeset = changeset;
        self.user_id = user_id;
        self
    }

    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    /// Value id for a key, if tagged.
    pub fn tag_value(&self, key: i32) -> Option<i32> {
        self.tags
            .binary_search_by_key(&key, |t| t.key)
            .ok()
            .map(|i| self.tags[i].value)
    }

    pub fn has_key(&self, key: i32) -> bool {
        self.tag_value(key).is_some()
    }

    pub fn has_tag(&self, key: i32, value: i32) -> bool {
        self.tag_value(key) == Some(value)
    }

    /// Member references of a way or relation; empty for nodes.
    pub fn members(&self) -> &[MemberRef] {
        match &self.payload {
            Payload::Way { nodes } => nodes,
            Payload::Relation { members } => members,
            Payload::Node { .. } | Payload::Deleted => &[],
        }
    }

    /// Coordinates of a node version.
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match self.payload {
            Payload::Node { lon, lat } => Some((lon, lat)),
            _ => None,
        }
    }
}

/// An entity together with its full edit history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedEntity {
    key: EntityKey,
    versions: Vec<EntityVersion>,
    bbox: Option<BoundingBox>,
}

impl VersionedEntity {
    /// Create an entity from its versions, oldest first.
    ///
    /// Version timestamps must be strictly increasing. For nodes the overall
    /// bounding box is derived from the coordinates of every version; ways
    /// and relations get theirs from the backend via [`Self::with_bbox`].
    pub fn new(osm_type: OsmType, id: i64, versions: Vec<EntityVersion>) -> EngineResult<Self> {
        let key = EntityKey::new(osm_type, id);
        if versions.is_empty() {
            return Err(EngineError::InvalidData {
                reason: format!("{key} has no versions"),
            });
        }
        if let Some(pair) = versions
            .windows(2)
            .find(|pair| pair[0].timestamp >= pair[1].timestamp)
        {
            return Err(EngineError::InvalidData {
                reason: format!(
                    "{key}: version {} at {} does not follow {}",
                    pair[1].version, pair[1].timestamp, pair[0].timestamp
                ),
            });
        }

        let bbox = if osm_type == OsmType::Node {
            versions
                .iter()
                .filter_map(EntityVersion::coordinates)
                .map(|(lon, lat)| BoundingBox::from_point(lon, lat))
                .reduce(|a, b| a.union(&b))
        } else {
            None
        };

        Ok(Self {
            key,
            versions,
            bbox,
        })
    }

    /// Set the bounding box covering every version of this entity.
    pub fn with_bbox(mut self, bbox: BoundingBox) -> Self {
        self.bbox = Some(bbox);
        self
    }

    pub fn key(&self) -> EntityKey {
        self.key
    }

    pub fn osm_type(&self) -> OsmType {
        self.key.osm_type
    }

    pub fn id(&self) -> i64 {
        self.key.id
    }

    /// All versions, oldest first.
    pub fn versions(&self) -> &[EntityVersion] {
        &self.versions
    }

    /// Bounding box over the whole history, when known.
    pub fn bbox(&self) -> Option<BoundingBox> {
        self.bbox
    }

    /// Index of the version active at `timestamp`: the greatest version
    /// timestamp `<= timestamp`.
    pub fn version_index_at(&self, timestamp: Timestamp) -> Option<usize> {
        self.versions
            .partition_point(|v| v.timestamp <= timestamp)
            .checked_sub(1)
    }

    /// The version active at `timestamp`, deleted or not.
    pub fn version_at(&self, timestamp: Timestamp) -> Option<&EntityVersion> {
        self.version_index_at(timestamp).map(|i| &self.versions[i])
    }

    /// The version active at `timestamp` if it is visible.
    pub fn visible_at(&self, timestamp: Timestamp) -> Option<&EntityVersion> {
        self.version_at(timestamp).filter(|v| v.visible)
    }

    /// Whether any version carries the key.
    pub fn ever_has_key(&self, key: i32) -> bool {
        self.versions.iter().any(|v| v.has_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(seconds: i64) -> Timestamp {
        Timestamp::from_epoch_seconds(seconds)
    }

    fn node_history() -> VersionedEntity {
        VersionedEntity::new(
            OsmType::Node,
            7,
            vec![
                EntityVersion::new(ts(100), 1, Payload::Node { lon: 1.0, lat: 2.0 })
                    .with_tags([Tag::new(3, 1), Tag::new(1, 4)]),
                EntityVersion::new(ts(200), 2, Payload::Node { lon: 3.0, lat: 0.5 }),
                EntityVersion::deleted(ts(300), 3),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_floor_version_lookup() {
        let node = node_history();
        assert!(node.version_at(ts(99)).is_none());
        assert_eq!(node.version_at(ts(100)).unwrap().version, 1);
        assert_eq!(node.version_at(ts(250)).unwrap().version, 2);
        assert_eq!(node.version_at(ts(1_000)).unwrap().version, 3);
        assert!(node.visible_at(ts(1_000)).is_none());
    }

    #[test]
    fn test_node_bbox_spans_history() {
        let node = node_history();
        assert_eq!(node.bbox(), Some(BoundingBox::new(1.0, 0.5, 3.0, 2.0)));
    }

    #[test]
    fn test_tags_sorted_for_lookup() {
        let node = node_history();
        let first = &node.versions()[0];
        assert_eq!(first.tags(), &[Tag::new(1, 4), Tag::new(3, 1)]);
        assert_eq!(first.tag_value(3), Some(1));
        assert!(first.has_tag(1, 4));
        assert!(!first.has_key(2));
        assert!(node.ever_has_key(3));
        assert!(!node.ever_has_key(9));
    }

    #[test]
    fn test_rejects_unordered_versions() {
        let result = VersionedEntity::new(
            OsmType::Node,
            1,
            vec![
                EntityVersion::new(ts(200), 1, Payload::Node { lon: 0.0, lat: 0.0 }),
                EntityVersion::new(ts(200), 2, Payload::Node { lon: 0.0, lat: 0.0 }),
            ],
        );
        assert!(matches!(result, Err(EngineError::InvalidData { .. })));
    }

    #[test]
    fn test_entity_key_display() {
        assert_eq!(EntityKey::new(OsmType::Way, 42).to_string(), "way/42");
    }
}
