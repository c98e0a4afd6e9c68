//! Static gazetteer: (country, postal prefix) → coordinate.
//!
//! Loaded once from a CSV file with the header
//! `country,postal_prefix,latitude,longitude`, or from the built-in dataset
//! compiled into the binary. Read-only after load.

use super::cache::CacheStore;
use super::normalize::{build_key, normalize_country, normalize_postal};
use super::types::{Coordinates, LocationError, LocationResult, Quality, ResolvedLocation, Source};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info, warn};

const BUILTIN_DATASET: &str = include_str!("../../data/gazetteer.csv");

#[derive(Debug, Deserialize)]
struct GazetteerRow {
    country: String,
    postal_prefix: String,
    latitude: f64,
    longitude: f64,
}

/// One row of the dataset after normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct GazetteerEntry {
    pub country: String,
    pub postal_prefix: String,
    pub coords: Coordinates,
}

#[derive(Debug, Default)]
pub struct Gazetteer {
    // Lowercased canonical key → entry. Ordered so substring matches are deterministic.
    entries: BTreeMap<String, GazetteerEntry>,
}

impl Gazetteer {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The dataset shipped with the crate.
    pub fn builtin() -> LocationResult<Self> {
        Self::from_reader(BUILTIN_DATASET.as_bytes())
    }

    pub fn load(path: &Path) -> LocationResult<Self> {
        let file = std::fs::File::open(path)
            .map_err(|e| LocationError::Gazetteer(format!("{}: {}", path.display(), e)))?;
        let gazetteer = Self::from_reader(file)?;
        info!(path = %path.display(), entries = gazetteer.len(), "loaded gazetteer");
        Ok(gazetteer)
    }

    pub fn from_reader<R: Read>(reader: R) -> LocationResult<Self> {
        let mut csv = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let mut entries = BTreeMap::new();
        for row in csv.deserialize::<GazetteerRow>() {
            let row = row?;
            let Some(coords) = Coordinates::from_parts(Some(row.latitude), Some(row.longitude)) else {
                warn!(country = %row.country, prefix = %row.postal_prefix, "skipping gazetteer row without coordinates");
                continue;
            };
            let country = normalize_country(&row.country);
            let postal_prefix = normalize_postal(&row.postal_prefix);
            if country.is_empty() || postal_prefix.is_empty() {
                continue;
            }
            let key = build_key(&country, &postal_prefix).to_lowercase();
            entries.insert(key, GazetteerEntry { country, postal_prefix, coords });
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &GazetteerEntry> {
        self.entries.values()
    }

    /// Exact key lookup (`"{country}_{prefix}"`, case-insensitive).
    pub fn lookup(&self, key: &str) -> Option<Coordinates> {
        self.entries.get(&key.trim().to_lowercase()).map(|e| e.coords)
    }

    fn substring_match(&self, country: &str, postal: &str) -> Option<Coordinates> {
        let country = country.to_lowercase();
        let postal = postal.to_lowercase();
        self.entries
            .values()
            .find(|e| e.country.to_lowercase() == country && e.postal_prefix.to_lowercase().contains(&postal))
            .map(|e| e.coords)
    }

    /// The short-postal-code ladder: exact, stripped-zero (`"05"` → `"5"`, for
    /// datasets that lost leading zeros), then substring. Exact hits are tagged
    /// `lookup`, the rest `lookup_partial`.
    pub fn lookup_short(&self, country: &str, postal: &str) -> Option<ResolvedLocation> {
        let country = normalize_country(country);
        let postal = normalize_postal(postal);
        if postal.is_empty() {
            return None;
        }

        if let Some(coords) = self.lookup(&build_key(&country, &postal)) {
            return Some(ResolvedLocation::new(coords, Quality::Lookup, Source::Gazetteer));
        }

        let stripped = postal.trim_start_matches('0');
        if !stripped.is_empty() && stripped != postal {
            if let Some(coords) = self.lookup(&build_key(&country, stripped)) {
                debug!(%country, %postal, stripped, "gazetteer hit on stripped prefix");
                return Some(ResolvedLocation::new(coords, Quality::LookupPartial, Source::Gazetteer));
            }
        }

        self.substring_match(&country, &postal)
            .map(|coords| ResolvedLocation::new(coords, Quality::LookupPartial, Source::Gazetteer))
    }

    /// Push every entry into the cache whose key is absent or unresolved there.
    /// Returns the number of entries written; running it twice writes nothing new.
    pub fn sync_into(&self, cache: &dyn CacheStore) -> LocationResult<usize> {
        let pending: Vec<(String, ResolvedLocation)> = self
            .entries
            .values()
            .filter_map(|e| {
                let key = build_key(&e.country, &e.postal_prefix);
                let resolved = cache.get(&key).map(|loc| loc.is_resolved()).unwrap_or(false);
                (!resolved).then(|| (key, ResolvedLocation::new(e.coords, Quality::Lookup, Source::Sync)))
            })
            .collect();
        cache.set_many(&pending)?;
        info!(written = pending.len(), total = self.len(), "gazetteer synced into cache");
        Ok(pending.len())
    }
}
