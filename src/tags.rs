//! Tag dictionaries and tag interpretation.
//!
//! The engine never sees tag strings: entity versions store integer ids and
//! filters are resolved to ids up front through a [`TagTranslator`]. A
//! [`TagInterpreter`] answers the few semantic questions geometry building
//! needs (is this way an area, is this relation a multipolygon, which
//! members are outer rings).

use crate::types::{EntityVersion, MemberRef, OsmType, Tag};
use std::collections::{BTreeMap, BTreeSet};

/// String ⇄ integer translation for tag keys, values and member roles.
pub trait TagTranslator: Send + Sync {
    /// Id of a key, `None` if it never occurs in the data.
    fn key_id(&self, key: &str) -> Option<i32>;

    /// Ids of a key/value pair, `None` if the pair never occurs.
    fn tag_id(&self, key: &str, value: &str) -> Option<Tag>;

    /// Id of a member role.
    fn role_id(&self, role: &str) -> Option<i32>;

    /// Every known value of a key as `(value id, value string)`.
    fn values_of(&self, key: i32) -> Vec<(i32, String)>;

    /// Reverse lookup of a tag.
    fn tag_name(&self, tag: Tag) -> Option<(String, String)>;
}

/// An in-memory, append-only tag dictionary.
///
/// Ids are dense and assigned in interning order; value ids are scoped to
/// their key.
#[derive(Debug, Default, Clone)]
pub struct TagDictionary {
    keys: BTreeMap<String, i32>,
    key_names: Vec<String>,
    values: Vec<BTreeMap<String, i32>>,
    value_names: Vec<Vec<String>>,
    roles: BTreeMap<String, i32>,
}

impl TagDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a key, returning its id.
    pub fn intern_key(&mut self, key: &str) -> i32 {
        if let Some(id) = self.keys.get(key) {
            return *id;
        }
        let id = self.key_names.len() as i32;
        self.keys.insert(key.to_string(), id);
        self.key_names.push(key.to_string());
        self.values.push(BTreeMap::new());
        self.value_names.push(Vec::new());
        id
    }

    /// Intern a key/value pair, returning its ids.
    pub fn intern_tag(&mut self, key: &str, value: &str) -> Tag {
        let key_id = self.intern_key(key);
        let slot = key_id as usize;
        if let Some(value_id) = self.values[slot].get(value) {
            return Tag::new(key_id, *value_id);
        }
        let value_id = self.value_names[slot].len() as i32;
        self.values[slot].insert(value.to_string(), value_id);
        self.value_names[slot].push(value.to_string());
        Tag::new(key_id, value_id)
    }

    /// Intern a member role, returning its id.
    pub fn intern_role(&mut self, role: &str) -> i32 {
        let next = self.roles.len() as i32;
        *self.roles.entry(role.to_string()).or_insert(next)
    }
}

impl TagTranslator for TagDictionary {
    fn key_id(&self, key: &str) -> Option<i32> {
        self.keys.get(key).copied()
    }

    fn tag_id(&self, key: &str, value: &str) -> Option<Tag> {
        let key_id = self.key_id(key)?;
        let value_id = self.values.get(key_id as usize)?.get(value)?;
        Some(Tag::new(key_id, *value_id))
    }

    fn role_id(&self, role: &str) -> Option<i32> {
        self.roles.get(role).copied()
    }

    fn values_of(&self, key: i32) -> Vec<(i32, String)> {
        usize::try_from(key)
            .ok()
            .and_then(|slot| self.value_names.get(slot))
            .map(|names| {
                names
                    .iter()
                    .enumerate()
                    .map(|(id, name)| (id as i32, name.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn tag_name(&self, tag: Tag) -> Option<(String, String)> {
        let slot = usize::try_from(tag.key).ok()?;
        let key = self.key_names.get(slot)?;
        let value = self
            .value_names
            .get(slot)?
            .get(usize::try_from(tag.value).ok()?)?;
        Some((key.clone(), value.clone()))
    }
}

/// Semantic interpretation of tags needed for geometry building.
pub trait TagInterpreter: Send + Sync {
    /// Whether a closed way should be built as a polygon.
    fn is_area(&self, version: &EntityVersion) -> bool;

    /// Whether a relation version describes a (multi)polygon.
    fn is_multipolygon(&self, version: &EntityVersion) -> bool;

    /// Whether a relation is an old-style multipolygon, whose descriptive
    /// tags live on its outer way rather than on the relation.
    fn is_legacy_multipolygon(&self, version: &EntityVersion) -> bool;

    /// Whether a relation member forms an outer ring.
    fn is_outer_member(&self, member: &MemberRef) -> bool;

    /// Whether a relation member forms an inner ring.
    fn is_inner_member(&self, member: &MemberRef) -> bool;
}

/// Keys whose presence makes a closed way an area.
const AREA_KEYS: &[&str] = &[
    "building", "landuse", "leisure", "natural", "amenity", "shop", "boundary", "place",
];

/// Tag interpretation following common OSM conventions.
///
/// Built against a translator so that every string it relies on is resolved
/// to ids once. Strings missing from the dictionary simply never match.
#[derive(Debug, Clone)]
pub struct DefaultTagInterpreter {
    type_key: Option<i32>,
    multipolygon_types: BTreeSet<i32>,
    legacy_type: Option<i32>,
    area_key: Option<i32>,
    area_yes: Option<i32>,
    area_no: Option<i32>,
    area_keys: BTreeSet<i32>,
    outer_roles: BTreeSet<i32>,
    inner_role: Option<i32>,
}

impl DefaultTagInterpreter {
    pub fn new(translator: &dyn TagTranslator) -> Self {
        let tag_value = |key: &str, value: &str| translator.tag_id(key, value).map(|t| t.value);
        Self {
            type_key: translator.key_id("type"),
            multipolygon_types: [tag_value("type", "multipolygon"), tag_value("type", "boundary")]
                .into_iter()
                .flatten()
                .collect(),
            legacy_type: tag_value("type", "multipolygon"),
            area_key: translator.key_id("area"),
            area_yes: tag_value("area", "yes"),
            area_no: tag_value("area", "no"),
            area_keys: AREA_KEYS
                .iter()
                .filter_map(|k| translator.key_id(k))
                .collect(),
            // Members without a role are treated as outer rings.
            outer_roles: [translator.role_id("outer"), translator.role_id("")]
                .into_iter()
                .flatten()
                .collect(),
            inner_role: translator.role_id("inner"),
        }
    }

    fn relation_type(&self, version: &EntityVersion) -> Option<i32> {
        self.type_key.and_then(|key| version.tag_value(key))
    }
}

impl TagInterpreter for DefaultTagInterpreter {
    fn is_area(&self, version: &EntityVersion) -> bool {
        if let Some(area_key) = self.area_key {
            match version.tag_value(area_key) {
                Some(v) if Some(v) == self.area_no => return false,
                Some(v) if Some(v) == self.area_yes => return true,
                _ => {}
            }
        }
        version
            .tags()
            .iter()
            .any(|tag| self.area_keys.contains(&tag.key))
    }

    fn is_multipolygon(&self, version: &EntityVersion) -> bool {
        self.relation_type(version)
            .is_some_and(|t| self.multipolygon_types.contains(&t))
    }

    fn is_legacy_multipolygon(&self, version: &EntityVersion) -> bool {
        self.legacy_type.is_some()
            && self.relation_type(version) == self.legacy_type
            && version.tags().len() == 1
    }

    fn is_outer_member(&self, member: &MemberRef) -> bool {
        member.osm_type == OsmType::Way && self.outer_roles.contains(&member.role)
    }

    fn is_inner_member(&self, member: &MemberRef) -> bool {
        member.osm_type == OsmType::Way && Some(member.role) == self.inner_role
    }
}
