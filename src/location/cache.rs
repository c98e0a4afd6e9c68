//! Persistent result cache.
//!
//! Default location: ~/.freight-locator/geocache.json. Keys are
//! case-insensitive. Entries never expire unless a TTL is configured and are
//! only removed by the explicit clear operations. Unresolved sentinels are
//! stored like any other entry (both coordinates null).

use super::types::{Coordinates, LocationResult, Quality, ResolvedLocation, Source};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Key/value capability the resolver persists through.
///
/// Implementations must tolerate concurrent readers and writers; the last
/// write for a key wins.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Option<ResolvedLocation>;

    fn set(&self, key: &str, location: &ResolvedLocation) -> LocationResult<()>;

    fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Write several entries at once. Stores that persist on every write
    /// override this to persist once.
    fn set_many(&self, entries: &[(String, ResolvedLocation)]) -> LocationResult<()> {
        for (key, location) in entries {
            self.set(key, location)?;
        }
        Ok(())
    }

    /// Snapshot of every entry, for administrative dumps and sync.
    fn entries(&self) -> Vec<(String, ResolvedLocation)>;

    fn clear(&self) -> LocationResult<()>;

    /// Drop every unresolved sentinel; returns how many were removed.
    fn clear_unresolved(&self) -> LocationResult<usize>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct CacheEntry {
    lat: Option<f64>,
    lon: Option<f64>,
    quality: Quality,
    source: Source,
    #[serde(default)]
    timestamp: i64,
}

impl CacheEntry {
    fn from_location(location: &ResolvedLocation) -> Self {
        Self {
            lat: location.lat(),
            lon: location.lon(),
            quality: location.quality,
            source: location.source,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    fn to_location(&self) -> ResolvedLocation {
        match Coordinates::from_parts(self.lat, self.lon) {
            Some(coords) => ResolvedLocation::new(coords, self.quality, self.source),
            None => ResolvedLocation::unresolved(),
        }
    }
}

fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase()
}

/// JSON-file-backed cache. Every write is persisted before it returns.
pub struct JsonFileCache {
    path: PathBuf,
    ttl_ms: Option<i64>,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl JsonFileCache {
    /// Open the cache at its default location.
    pub fn open_default() -> LocationResult<Self> {
        Self::open(Self::default_path())
    }

    /// Open a cache file; a missing file starts an empty cache.
    pub fn open(path: impl Into<PathBuf>) -> LocationResult<Self> {
        let path = path.into();
        let entries = Self::read_file(&path)?;
        debug!(path = %path.display(), entries = entries.len(), "loaded geocode cache");
        Ok(Self {
            path,
            ttl_ms: None,
            entries: RwLock::new(entries),
        })
    }

    pub fn with_ttl_days(mut self, days: Option<u64>) -> Self {
        self.ttl_ms = days.map(|d| (d as i64) * 24 * 3600 * 1000);
        self
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".freight-locator")
            .join("geocache.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_file(path: &Path) -> LocationResult<HashMap<String, CacheEntry>> {
        let data = match fs::read_to_string(path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(err) => return Err(err.into()),
        };
        if data.trim().is_empty() {
            return Ok(HashMap::new());
        }
        let raw: HashMap<String, CacheEntry> = serde_json::from_str(&data)?;
        Ok(raw.into_iter().map(|(k, v)| (normalize_key(&k), v)).collect())
    }

    fn persist(&self, entries: &HashMap<String, CacheEntry>) -> LocationResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Apply `change` to a copy of the entries and swap it in only once the
    /// copy is on disk, so a failed write leaves memory matching the file.
    fn update<T>(&self, change: impl FnOnce(&mut HashMap<String, CacheEntry>) -> T) -> LocationResult<T> {
        let mut entries = self.entries.write();
        let mut next = entries.clone();
        let out = change(&mut next);
        self.persist(&next)?;
        *entries = next;
        Ok(out)
    }

    fn is_expired(&self, entry: &CacheEntry) -> bool {
        match self.ttl_ms {
            Some(ttl) => chrono::Utc::now().timestamp_millis() - entry.timestamp > ttl,
            None => false,
        }
    }
}

impl CacheStore for JsonFileCache {
    fn get(&self, key: &str) -> Option<ResolvedLocation> {
        let entries = self.entries.read();
        let entry = entries.get(&normalize_key(key))?;
        if self.is_expired(entry) {
            return None;
        }
        Some(entry.to_location())
    }

    fn set(&self, key: &str, location: &ResolvedLocation) -> LocationResult<()> {
        self.update(|entries| {
            entries.insert(normalize_key(key), CacheEntry::from_location(location));
        })
    }

    fn set_many(&self, batch: &[(String, ResolvedLocation)]) -> LocationResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.update(|entries| {
            for (key, location) in batch {
                entries.insert(normalize_key(key), CacheEntry::from_location(location));
            }
        })
    }

    fn entries(&self) -> Vec<(String, ResolvedLocation)> {
        let mut all: Vec<_> = self
            .entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.to_location()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    fn clear(&self) -> LocationResult<()> {
        let removed = self.update(|entries| {
            let removed = entries.len();
            entries.clear();
            removed
        })?;
        info!(removed, "cleared geocode cache");
        Ok(())
    }

    fn clear_unresolved(&self) -> LocationResult<usize> {
        let has_unresolved = self
            .entries
            .read()
            .values()
            .any(|e| Coordinates::from_parts(e.lat, e.lon).is_none());
        if !has_unresolved {
            return Ok(0);
        }
        self.update(|entries| {
            let before = entries.len();
            entries.retain(|_, e| Coordinates::from_parts(e.lat, e.lon).is_some());
            before - entries.len()
        })
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}

/// Non-persistent cache.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, ResolvedLocation>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStore for MemoryCache {
    fn get(&self, key: &str) -> Option<ResolvedLocation> {
        self.entries.read().get(&normalize_key(key)).cloned()
    }

    fn set(&self, key: &str, location: &ResolvedLocation) -> LocationResult<()> {
        self.entries.write().insert(normalize_key(key), location.clone());
        Ok(())
    }

    fn entries(&self) -> Vec<(String, ResolvedLocation)> {
        let mut all: Vec<_> = self
            .entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    fn clear(&self) -> LocationResult<()> {
        self.entries.write().clear();
        Ok(())
    }

    fn clear_unresolved(&self) -> LocationResult<usize> {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, loc| loc.is_resolved());
        Ok(before - entries.len())
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_cache() -> (JsonFileCache, TempDir) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("geocache.json");
        (JsonFileCache::open(path).unwrap(), dir)
    }

    fn warsaw() -> ResolvedLocation {
        ResolvedLocation::new(Coordinates::new(52.2297, 21.0122), Quality::Structured, Source::StructuredApi)
    }

    #[test]
    fn test_cache_set_get() {
        let (cache, _dir) = test_cache();
        cache.set("Poland_00", &warsaw()).unwrap();

        let result = cache.get("Poland_00").unwrap();
        assert_eq!(result.quality, Quality::Structured);
        assert!((result.lat().unwrap() - 52.2297).abs() < 1e-9);
        assert!(cache.contains("Poland_00"));
    }

    #[test]
    fn test_failed_write_leaves_memory_unchanged() {
        let (cache, dir) = test_cache();
        cache.set("Poland_00", &warsaw()).unwrap();

        // A directory in the temp file's place makes every write fail.
        fs::create_dir(dir.path().join("geocache.json.tmp")).unwrap();
        assert!(cache.set("Poland_30", &warsaw()).is_err());
        assert!(cache.get("Poland_30").is_none());
        assert!(cache.clear().is_err());
        assert_eq!(cache.len(), 1);

        let reopened = JsonFileCache::open(dir.path().join("geocache.json")).unwrap();
        assert_eq!(reopened.entries(), cache.entries());
    }

    #[test]
    fn test_cache_case_insensitive() {
        let (cache, _dir) = test_cache();
        cache.set("Poland_00_Warszawa", &warsaw()).unwrap();
        assert!(cache.get("poland_00_warszawa").is_some());
        assert!(cache.get("POLAND_00_WARSZAWA").is_some());
    }

    #[test]
    fn test_cache_miss() {
        let (cache, _dir) = test_cache();
        assert!(cache.get("nonexistent").is_none());
        assert!(!cache.contains("nonexistent"));
    }

    #[test]
    fn test_cache_persistence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("geocache.json");

        {
            let cache = JsonFileCache::open(path.clone()).unwrap();
            cache.set("Germany_10", &warsaw()).unwrap();
            cache.set("Germany_99", &ResolvedLocation::unresolved()).unwrap();
        }

        let reopened = JsonFileCache::open(path).unwrap();
        assert_eq!(reopened.len(), 2);
        assert!(reopened.get("Germany_10").unwrap().is_resolved());
        let sentinel = reopened.get("Germany_99").unwrap();
        assert_eq!(sentinel, ResolvedLocation::unresolved());
    }

    #[test]
    fn test_partial_pair_loads_as_unresolved() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("geocache.json");
        let json = r#"{
            "poland_30": { "lat": 50.06, "lon": null, "quality": "lookup", "source": "sync", "timestamp": 1 }
        }"#;
        fs::write(&path, json).unwrap();

        let cache = JsonFileCache::open(path).unwrap();
        assert!(!cache.get("Poland_30").unwrap().is_resolved());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("geocache.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(JsonFileCache::open(path).is_err());
    }

    #[test]
    fn test_clear_unresolved() {
        let (cache, _dir) = test_cache();
        cache.set("a", &warsaw()).unwrap();
        cache.set("b", &ResolvedLocation::unresolved()).unwrap();
        assert_eq!(cache.clear_unresolved().unwrap(), 1);
        assert_eq!(cache.len(), 1);
        cache.clear().unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_ttl_expiry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("geocache.json");
        let json = r#"{
            "poland_30": { "lat": 50.06, "lon": 19.94, "quality": "lookup", "source": "sync", "timestamp": 1 }
        }"#;
        fs::write(&path, json).unwrap();

        let no_ttl = JsonFileCache::open(path.clone()).unwrap();
        assert!(no_ttl.get("poland_30").is_some());

        let with_ttl = JsonFileCache::open(path).unwrap().with_ttl_days(Some(30));
        assert!(with_ttl.get("poland_30").is_none());
    }

    #[test]
    fn test_set_many_persists_once() {
        let (cache, dir) = test_cache();
        let batch = vec![
            ("Poland_00".to_string(), warsaw()),
            ("Poland_01".to_string(), warsaw()),
        ];
        cache.set_many(&batch).unwrap();
        let reopened = JsonFileCache::open(dir.path().join("geocache.json")).unwrap();
        assert_eq!(reopened.len(), 2);
    }

    #[test]
    fn test_memory_cache() {
        let cache = MemoryCache::new();
        cache.set("X_1", &warsaw()).unwrap();
        assert!(cache.contains("x_1"));
        assert_eq!(cache.entries().len(), 1);
    }
}
