use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// A composite aggregation key.
///
/// Ordered lexicographically by `(first, second)`. Nesting further keys
/// produces left-nested values such as
/// `CombinedIndex<CombinedIndex<Timestamp, String>, u8>`, so the nesting
/// depth is part of the key type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CombinedIndex<U, V> {
    first: U,
    second: V,
}

impl<U, V> CombinedIndex<U, V> {
    pub fn new(first: U, second: V) -> Self {
        Self { first, second }
    }

    /// The outer (earlier) key.
    pub fn first(&self) -> &U {
        &self.first
    }

    /// The inner (most recently added) key.
    pub fn second(&self) -> &V {
        &self.second
    }

    pub fn into_parts(self) -> (U, V) {
        (self.first, self.second)
    }
}

impl<U: fmt::Display, V: fmt::Display> fmt::Display for CombinedIndex<U, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.first, self.second)
    }
}

impl<U: Ord, V: Ord> CombinedIndex<U, V> {
    /// Regroup a map keyed by combined indices into a two-level map.
    pub fn nest<S>(map: BTreeMap<Self, S>) -> BTreeMap<U, BTreeMap<V, S>> {
        let mut nested: BTreeMap<U, BTreeMap<V, S>> = BTreeMap::new();
        for (key, value) in map {
            let (first, second) = key.into_parts();
            nested.entry(first).or_default().insert(second, value);
        }
        nested
    }
}

/// Free-function form of [`CombinedIndex::nest`].
pub fn nest<U: Ord, V: Ord, S>(
    map: BTreeMap<CombinedIndex<U, V>, S>,
) -> BTreeMap<U, BTreeMap<V, S>> {
    CombinedIndex::nest(map)
}

/// Completes the set of keys present in a result with zero-fill keys.
pub(crate) type KeyCompleter<U> = Arc<dyn Fn(BTreeSet<U>) -> BTreeSet<U> + Send + Sync>;

/// Single-level completion: present keys plus the declared ones.
pub(crate) fn base_completer<U>(declared: BTreeSet<U>) -> KeyCompleter<U>
where
    U: Ord + Clone + Send + Sync + 'static,
{
    Arc::new(move |mut present: BTreeSet<U>| {
        present.extend(declared.iter().cloned());
        present
    })
}

/// Completion of a nested level.
///
/// The outer keys are completed first by the outer level's completer; then
/// every completed outer key is paired with its present inner keys plus the
/// inner level's declared keys.
pub(crate) fn nested_completer<U, V>(
    outer: KeyCompleter<U>,
    declared: BTreeSet<V>,
) -> KeyCompleter<CombinedIndex<U, V>>
where
    U: Ord + Clone + Send + Sync + 'static,
    V: Ord + Clone + Send + Sync + 'static,
{
    Arc::new(move |present: BTreeSet<CombinedIndex<U, V>>| {
        let mut by_first: BTreeMap<U, BTreeSet<V>> = BTreeMap::new();
        for key in present {
            let (first, second) = key.into_parts();
            by_first.entry(first).or_default().insert(second);
        }
        let firsts = outer(by_first.keys().cloned().collect());

        let mut completed = BTreeSet::new();
        for first in firsts {
            let mut seconds = by_first.remove(&first).unwrap_or_default();
            seconds.extend(declared.iter().cloned());
            for second in seconds {
                completed.insert(CombinedIndex::new(first.clone(), second));
            }
        }
        completed
    })
}
