//! Location resolver: orchestrates the layered lookup.
//!
//! Flow: Cache → Gazetteer (two-character postal codes) → ProviderChain →
//! cached "unknown" sentinel. The sentinel is only written once a provider
//! has actually been tried.

use super::cache::{CacheStore, JsonFileCache};
use super::gazetteer::Gazetteer;
use super::normalize::{canonical_key, generate_query_variants, is_short_postal, normalize_query};
use super::providers::{AttemptLog, ProviderChain};
use super::types::{
    CancelFlag, LocationError, LocationQuery, LocationResult, Resolution, ResolvedLocation, Source, UnresolvedReason,
};
use super::verify::VerificationResult;
use crate::config::LocatorConfig;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The location resolver with its fallback pipeline.
pub struct LocationResolver {
    cache: Arc<dyn CacheStore>,
    gazetteer: Arc<Gazetteer>,
    chain: ProviderChain,
}

impl LocationResolver {
    pub fn new(cache: Arc<dyn CacheStore>, gazetteer: Arc<Gazetteer>, chain: ProviderChain) -> Self {
        Self { cache, gazetteer, chain }
    }

    /// Open the configured cache and gazetteer, sync the gazetteer into the
    /// cache unless disabled, and build the provider chain.
    pub fn from_config(config: &LocatorConfig) -> LocationResult<Self> {
        let cache = match &config.cache_path {
            Some(path) => JsonFileCache::open(path.clone())?,
            None => JsonFileCache::open_default()?,
        }
        .with_ttl_days(config.cache_ttl_days);
        let cache: Arc<dyn CacheStore> = Arc::new(cache);

        let gazetteer = match &config.gazetteer_path {
            Some(path) => Gazetteer::load(path)?,
            None => Gazetteer::builtin()?,
        };
        if config.gazetteer_sync {
            gazetteer.sync_into(cache.as_ref())?;
        } else {
            debug!("gazetteer sync disabled");
        }

        Ok(Self::new(cache, Arc::new(gazetteer), ProviderChain::from_config(config)))
    }

    /// Replace the provider chain (e.g. with [`ProviderChain::offline`]).
    pub fn with_chain(mut self, chain: ProviderChain) -> Self {
        self.chain = chain;
        self
    }

    pub fn cache(&self) -> &dyn CacheStore {
        self.cache.as_ref()
    }

    pub fn gazetteer(&self) -> &Gazetteer {
        &self.gazetteer
    }

    pub fn chain(&self) -> &ProviderChain {
        &self.chain
    }

    /// Resolve a (country, postal, city) triple. Misses come back as the
    /// unresolved sentinel; only malformed input and cache failures are errors.
    pub fn resolve(&self, country: &str, postal: &str, city: &str) -> LocationResult<ResolvedLocation> {
        let query = LocationQuery::new(country, postal, city);
        self.lookup(&query, &CancelFlag::new()).map(Resolution::into_location)
    }

    /// Resolve through the full chain and report how the lookup ended.
    pub fn lookup(&self, query: &LocationQuery, cancel: &CancelFlag) -> LocationResult<Resolution> {
        let q = normalize_query(query);
        if q.country.is_empty() {
            return Err(LocationError::InvalidInput("country is required".into()));
        }
        if q.postal_code.is_empty() && q.city.is_empty() {
            return Err(LocationError::InvalidInput(format!(
                "{}: postal code or city is required",
                q.country
            )));
        }
        let key = canonical_key(&q);

        // 1. Cache, including remembered misses.
        if let Some(cached) = self.cache.get(&key) {
            if cached.is_resolved() {
                debug!(%key, quality = %cached.quality, "cache hit");
                return Ok(Resolution::Resolved(cached));
            }
            debug!(%key, "cached as unresolved");
            return Ok(Resolution::Unresolved {
                reason: UnresolvedReason::PreviouslyUnresolved,
                tried: variant_texts(&q),
            });
        }

        // 2. Two-character postal codes are region prefixes the gazetteer knows best.
        if is_short_postal(&q.postal_code) {
            if let Some(hit) = self.gazetteer.lookup_short(&q.country, &q.postal_code) {
                info!(%key, quality = %hit.quality, "gazetteer hit");
                self.remember(&key, &hit)?;
                return Ok(Resolution::Resolved(hit));
            }
        }

        // 3. External providers in policy order.
        let mut log = AttemptLog::new(cancel.clone());
        if let Some(hit) = self.chain.resolve(&q, &mut log) {
            self.remember(&hit.key, &hit.location)?;
            if !hit.key.eq_ignore_ascii_case(&key) {
                self.remember(&key, &hit.location)?;
            }
            return Ok(Resolution::Resolved(hit.location));
        }

        if log.is_cancelled() {
            debug!(%key, "lookup cancelled; not caching a miss");
            return Ok(Resolution::Unresolved {
                reason: UnresolvedReason::Cancelled,
                tried: log.into_tried(),
            });
        }
        if self.chain.is_empty() {
            debug!(%key, "no providers configured; not caching a miss");
            return Ok(Resolution::Unresolved {
                reason: UnresolvedReason::Offline,
                tried: log.into_tried(),
            });
        }

        // 4. Remember the miss so the chain is not re-run for this key.
        warn!(%key, attempts = log.tried().len(), "location unresolved");
        self.cache.set(&key, &ResolvedLocation::unresolved())?;
        Ok(Resolution::Unresolved {
            reason: UnresolvedReason::Exhausted,
            tried: log.into_tried(),
        })
    }

    /// Store a coordinate the user entered by hand under the canonical key.
    pub fn record_manual(&self, country: &str, postal: &str, lat: f64, lon: f64) -> LocationResult<ResolvedLocation> {
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
            return Err(LocationError::InvalidInput(format!(
                "coordinates out of range: {}, {}",
                lat, lon
            )));
        }
        let key = self.key_for(country, postal, "")?;
        let location = ResolvedLocation::manual(lat, lon);
        self.cache.set(&key, &location)?;
        info!(%key, lat, lon, "manual coordinate recorded");
        Ok(location)
    }

    /// Write a verifier's suggested coordinate back under the canonical key.
    /// Returns the stored location, or `None` if the result carries no suggestion.
    pub fn apply_suggestion(
        &self,
        country: &str,
        postal: &str,
        result: &VerificationResult,
    ) -> LocationResult<Option<ResolvedLocation>> {
        let Some(suggested) = result.suggested.as_ref().filter(|_| !result.is_match) else {
            return Ok(None);
        };
        let Some(coords) = suggested.coords else {
            return Ok(None);
        };
        let key = self.key_for(country, postal, "")?;
        let corrected = ResolvedLocation::new(coords, suggested.quality, Source::Verification);
        self.cache.set(&key, &corrected)?;
        info!(%key, "verification correction applied");
        Ok(Some(corrected))
    }

    fn key_for(&self, country: &str, postal: &str, city: &str) -> LocationResult<String> {
        let q = normalize_query(&LocationQuery::new(country, postal, city));
        if q.country.is_empty() || (q.postal_code.is_empty() && q.city.is_empty()) {
            return Err(LocationError::InvalidInput("country and postal code are required".into()));
        }
        Ok(canonical_key(&q))
    }

    /// Write unless the key already holds a resolved coordinate.
    fn remember(&self, key: &str, location: &ResolvedLocation) -> LocationResult<()> {
        match self.cache.get(key) {
            Some(existing) if existing.is_resolved() => Ok(()),
            _ => self.cache.set(key, location),
        }
    }
}

fn variant_texts(q: &LocationQuery) -> Vec<String> {
    generate_query_variants(&q.country, &q.postal_code, &q.city)
        .into_iter()
        .map(|v| v.text)
        .collect()
}
