//! Icon assets: the index of known icons and the memoized resolver.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tracing::debug;

/// How an asset key resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    /// A named icon uploaded to the presence service; resolves to its
    /// canonical name.
    Canonical,
    /// An externally hosted image; its URL may itself be an expression.
    Custom,
}

/// A named icon resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    /// Normalized icon name.
    pub name: String,
    /// Service-side asset id, when known.
    pub id: String,
    /// Source URL for custom assets.
    pub url: Option<String>,
    pub kind: AssetKind,
}

impl Asset {
    /// A canonical asset with the given name and id.
    #[must_use]
    pub fn canonical(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: format_as_icon(&name.into()),
            id: id.into(),
            url: None,
            kind: AssetKind::Canonical,
        }
    }

    /// A custom asset backed by a URL.
    #[must_use]
    pub fn custom(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: format_as_icon(&name.into()),
            id: String::new(),
            url: Some(url.into()),
            kind: AssetKind::Custom,
        }
    }
}

/// Normalize a key icon-style: lowercase, invalid characters to `_`.
#[must_use]
pub fn format_as_icon(key: &str) -> String {
    key.trim()
        .chars()
        .map(|ch| {
            let ch = ch.to_ascii_lowercase();
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '.' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

fn is_external_url(key: &str) -> bool {
    key.starts_with("http://") || key.starts_with("https://")
}

/// The read-mostly index of known assets.
#[derive(Default)]
pub struct AssetIndex {
    entries: RwLock<BTreeMap<String, Asset>>,
}

impl AssetIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install an asset under its normalized name.
    pub fn insert(&self, asset: Asset) {
        self.entries
            .write()
            .expect("asset index lock poisoned")
            .insert(asset.name.clone(), asset);
    }

    /// Look up a key.
    ///
    /// External image URLs materialize as realtime custom assets; other
    /// keys are normalized icon-style before lookup.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Asset> {
        if is_external_url(key) {
            return Some(Asset {
                name: key.to_string(),
                id: String::new(),
                url: Some(key.to_string()),
                kind: AssetKind::Custom,
            });
        }
        self.entries
            .read()
            .expect("asset index lock poisoned")
            .get(&format_as_icon(key))
            .cloned()
    }

    /// Resolved canonical key for a lookup, when present.
    #[must_use]
    pub fn get_key(&self, key: &str) -> Option<String> {
        self.get(key).map(|asset| asset.name)
    }

    /// Source URL for a lookup, when present.
    #[must_use]
    pub fn get_url(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|asset| asset.url)
    }

    /// Whether a key resolves.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        is_external_url(key)
            || self
                .entries
                .read()
                .expect("asset index lock poisoned")
                .contains_key(&format_as_icon(key))
    }

    /// Merge user-configured custom icons into the index.
    ///
    /// Custom icons override canonical entries, except `default`.
    pub fn sync_custom(&self, icons: &BTreeMap<String, String>) {
        let mut entries = self.entries.write().expect("asset index lock poisoned");
        for (name, url) in icons {
            let normalized = format_as_icon(name);
            let overriding_default = normalized == "default"
                && entries
                    .get(&normalized)
                    .is_some_and(|existing| existing.kind == AssetKind::Canonical);
            if overriding_default {
                continue;
            }
            entries.insert(normalized, Asset::custom(name.as_str(), url.as_str()));
        }
    }

    /// An arbitrary known key, when the index is non-empty.
    #[must_use]
    pub fn random_key(&self) -> Option<String> {
        let entries = self.entries.read().expect("asset index lock poisoned");
        if entries.is_empty() {
            return None;
        }
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as usize;
        entries.keys().nth(nanos % entries.len()).cloned()
    }

    /// Whether the index holds no assets.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries
            .read()
            .expect("asset index lock poisoned")
            .is_empty()
    }

    /// Snapshot of the known keys, in order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.entries
            .read()
            .expect("asset index lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Drop every asset.
    pub fn clear(&self) {
        self.entries
            .write()
            .expect("asset index lock poisoned")
            .clear();
    }
}

/// Memoized icon resolution through a candidate fallback chain.
pub struct IconResolver {
    index: Arc<AssetIndex>,
    cache: DashMap<String, String>,
    default_icon: String,
}

impl IconResolver {
    /// Create a resolver over the index with the configured default icon.
    #[must_use]
    pub fn new(index: Arc<AssetIndex>, default_icon: impl Into<String>) -> Self {
        Self {
            index,
            cache: DashMap::new(),
            default_icon: default_icon.into(),
        }
    }

    /// Resolve the first candidate that exists in the asset index.
    ///
    /// The first candidate is the cache key. When no candidate resolves,
    /// the result is the configured default icon (resolved through the
    /// index, else an arbitrary asset) unless `allow_null` is set, in
    /// which case it is empty. Failed hops are logged when `log_enabled`.
    #[must_use]
    pub fn resolve(&self, allow_null: bool, log_enabled: bool, candidates: &[&str]) -> String {
        let Some(primary) = candidates.first() else {
            return self.fallback(allow_null);
        };
        if let Some(hit) = self.cache.get(*primary) {
            return hit.clone();
        }

        let mut resolved = None;
        for candidate in candidates {
            if candidate.is_empty() {
                continue;
            }
            if let Some(key) = self.index.get_key(candidate) {
                resolved = Some(key);
                break;
            }
            if log_enabled {
                debug!(icon = %candidate, "Icon not found, trying next candidate");
            }
        }

        let result = resolved.unwrap_or_else(|| self.fallback(allow_null));
        self.cache.insert((*primary).to_string(), result.clone());
        result
    }

    fn fallback(&self, allow_null: bool) -> String {
        if allow_null {
            return String::new();
        }
        self.index
            .get_key(&self.default_icon)
            .or_else(|| self.index.random_key())
            .unwrap_or_default()
    }

    /// Drop every memoized resolution.
    pub fn clear(&self) {
        self.cache.clear();
    }

    /// Number of memoized resolutions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_with(keys: &[&str]) -> Arc<AssetIndex> {
        let index = AssetIndex::new();
        for (i, key) in keys.iter().enumerate() {
            index.insert(Asset::canonical(*key, i.to_string()));
        }
        Arc::new(index)
    }

    #[test]
    fn test_format_as_icon() {
        assert_eq!(format_as_icon("The Overworld"), "the_overworld");
        assert_eq!(format_as_icon("  nether-wastes "), "nether-wastes");
        assert_eq!(format_as_icon("End?!"), "end__");
    }

    #[test]
    fn test_external_url_materializes_custom_asset() {
        let index = AssetIndex::new();
        let asset = index.get("https://example.com/icon.png").unwrap();
        assert_eq!(asset.kind, AssetKind::Custom);
        assert_eq!(asset.url.as_deref(), Some("https://example.com/icon.png"));
    }

    #[test]
    fn test_custom_icons_override_except_default() {
        let index = AssetIndex::new();
        index.insert(Asset::canonical("default", "1"));
        index.insert(Asset::canonical("world", "2"));

        let mut custom = BTreeMap::new();
        custom.insert("default".to_string(), "https://example.com/d.png".to_string());
        custom.insert("world".to_string(), "https://example.com/w.png".to_string());
        index.sync_custom(&custom);

        assert_eq!(index.get("default").unwrap().kind, AssetKind::Canonical);
        assert_eq!(index.get("world").unwrap().kind, AssetKind::Custom);
    }

    #[test]
    fn test_resolve_walks_fallback_chain() {
        let index = index_with(&["valid_key", "default"]);
        let resolver = IconResolver::new(index, "default");

        let resolved = resolver.resolve(false, true, &["missingA", "missingB", "Valid_Key"]);
        assert_eq!(resolved, "valid_key");
    }

    #[test]
    fn test_resolve_falls_back_to_default_icon() {
        let index = index_with(&["default"]);
        let resolver = IconResolver::new(index, "default");

        assert_eq!(resolver.resolve(false, true, &["missingA", "missingB"]), "default");
        assert_eq!(resolver.resolve(true, false, &["stillMissing"]), "");
    }

    #[test]
    fn test_resolve_memoizes_on_first_candidate() {
        let index = index_with(&["late_key"]);
        let resolver = IconResolver::new(Arc::clone(&index), "default");

        let first = resolver.resolve(true, false, &["primary", "late_key"]);
        assert_eq!(first, "late_key");

        // The cached entry under "primary" wins even after the index
        // changes.
        index.clear();
        assert_eq!(resolver.resolve(true, false, &["primary"]), "late_key");
        assert_eq!(resolver.len(), 1);

        resolver.clear();
        assert!(resolver.is_empty());
    }
}
