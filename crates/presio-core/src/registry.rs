//! The placeholder registry.
//!
//! A hierarchical store of named, lazily-evaluated values. Entries are
//! addressed by dot-delimited paths; setting a nested path auto-creates
//! intermediate Map entries. A flat index mirrors every path for lock-free
//! reads, while the nested [`ValueMap`] tree serves Map-valued lookups.
//!
//! Writers assemble new subtrees off to the side and attach them with a
//! single insertion, so a reader never observes a half-built Map.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use tracing::trace;

use crate::value::{Producer, Value};

/// An ordered map of names to producers, guarded per-map.
#[derive(Default)]
pub struct ValueMap {
    entries: RwLock<BTreeMap<String, Producer>>,
}

impl ValueMap {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a producer, returning the previous one.
    pub fn set(&self, name: &str, producer: Producer) -> Option<Producer> {
        self.entries
            .write()
            .expect("value map lock poisoned")
            .insert(name.to_string(), producer)
    }

    /// Look up a producer by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Producer> {
        self.entries
            .read()
            .expect("value map lock poisoned")
            .get(name)
            .cloned()
    }

    /// Remove a producer, returning it.
    pub fn remove(&self, name: &str) -> Option<Producer> {
        self.entries
            .write()
            .expect("value map lock poisoned")
            .remove(name)
    }

    /// Whether the map holds the given name.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries
            .read()
            .expect("value map lock poisoned")
            .contains_key(name)
    }

    /// Snapshot of the current key set, in order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.entries
            .read()
            .expect("value map lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().expect("value map lock poisoned").len()
    }

    /// Whether the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn map_producer(map: Arc<ValueMap>) -> Producer {
    Arc::new(move || Value::Map(Arc::clone(&map)))
}

/// A producer that always yields [`Value::Null`].
#[must_use]
pub fn null_producer() -> Producer {
    Arc::new(|| Value::Null)
}

/// The hierarchical placeholder registry.
///
/// Paths are unique and case-sensitive; the last writer wins. Reads never
/// fail: an absent path resolves to a Null-producer.
#[derive(Default)]
pub struct Registry {
    root: Arc<ValueMap>,
    index: DashMap<String, Producer>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a producer at a dot-delimited path.
    ///
    /// Intermediate segments auto-create Map entries; a non-Map value at an
    /// intermediate segment is overwritten. Replacing a Map leaf drops its
    /// flattened sub-paths from the index.
    pub fn set(&self, path: &str, producer: Producer) {
        let segments: Vec<&str> = path.split('.').collect();

        // Descend through existing Map entries as far as possible.
        let mut current = Arc::clone(&self.root);
        let mut depth = 0;
        let mut prefix = String::new();
        while depth + 1 < segments.len() {
            let seg = segments[depth];
            let child = match current.get(seg).map(|p| p()) {
                Some(Value::Map(m)) => m,
                _ => break,
            };
            if !prefix.is_empty() {
                prefix.push('.');
            }
            prefix.push_str(seg);
            current = child;
            depth += 1;
        }

        if depth + 1 == segments.len() {
            let old = current.set(segments[depth], Arc::clone(&producer));
            if matches!(old.map(|p| p()), Some(Value::Map(_))) {
                self.purge_index_children(path);
            }
        } else {
            // Assemble the remaining chain fully before attaching it.
            let mut sub_path = path.to_string();
            let mut child: Producer = Arc::clone(&producer);
            let mut created = vec![(sub_path.clone(), Arc::clone(&child))];
            for seg in segments[depth + 1..segments.len()].iter().rev() {
                let map = Arc::new(ValueMap::new());
                map.set(seg, child);
                sub_path.truncate(sub_path.len() - seg.len() - 1);
                child = map_producer(map);
                created.push((sub_path.clone(), Arc::clone(&child)));
            }
            let old = current.set(segments[depth], child);
            if matches!(old.map(|p| p()), Some(Value::Map(_))) {
                self.purge_index_children(&created.last().expect("chain non-empty").0);
            }
            for (index_path, index_producer) in created {
                self.index.insert(index_path, index_producer);
            }
            trace!(%path, "Installed placeholder chain");
            return;
        }

        self.index.insert(path.to_string(), producer);
        trace!(%path, "Installed placeholder");
    }

    /// Install a fixed value at a path.
    pub fn set_value(&self, path: &str, value: Value) {
        self.set(path, value.into_producer());
    }

    /// Look up a producer; absent paths yield a Null-producer.
    #[must_use]
    pub fn get(&self, path: &str) -> Producer {
        self.index
            .get(path)
            .map(|entry| Arc::clone(entry.value()))
            .unwrap_or_else(null_producer)
    }

    /// Whether a path is currently installed.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.index.contains_key(path)
    }

    /// Remove a path, returning its producer.
    ///
    /// Removing a Map-valued entry also drops its flattened sub-paths.
    pub fn remove(&self, path: &str) -> Option<Producer> {
        let removed = self.index.remove(path).map(|(_, producer)| producer);

        let segments: Vec<&str> = path.split('.').collect();
        let mut current = Arc::clone(&self.root);
        for seg in &segments[..segments.len() - 1] {
            match current.get(seg).map(|p| p()) {
                Some(Value::Map(m)) => current = m,
                _ => return removed,
            }
        }
        let detached = current.remove(segments[segments.len() - 1]);

        if matches!(detached.map(|p| p()), Some(Value::Map(_))) {
            self.purge_index_children(path);
        }
        removed
    }

    /// Remove every path matching any of the given prefixes.
    ///
    /// Returns the removed paths in order.
    pub fn remove_by_prefixes(&self, prefixes: &[&str]) -> Vec<String> {
        let mut matched: Vec<String> = self
            .index
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|key| prefixes.iter().any(|prefix| key.starts_with(prefix)))
            .collect();
        matched.sort();

        let mut removed = Vec::with_capacity(matched.len());
        for path in matched {
            if self.remove(&path).is_some() {
                removed.push(path);
            }
        }
        removed
    }

    /// Ordered snapshot of paths matching any filter.
    ///
    /// A filter is a literal path prefix, the `all`/`*` sentinel, or a
    /// `type:<tag>` selector evaluated against each producer's current
    /// value. An empty filter list matches everything.
    #[must_use]
    pub fn query(&self, filters: &[&str]) -> BTreeMap<String, Producer> {
        self.index
            .iter()
            .filter(|entry| {
                filters.is_empty()
                    || filters.iter().any(|filter| match *filter {
                        "all" | "*" => true,
                        f => {
                            if let Some(tag) = f.strip_prefix("type:") {
                                (entry.value())().matches_tag(tag)
                            } else {
                                entry.key().starts_with(f)
                            }
                        }
                    })
            })
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }

    fn purge_index_children(&self, path: &str) {
        let prefix = format!("{path}.");
        self.index.retain(|key, _| !key.starts_with(&prefix));
    }
}
