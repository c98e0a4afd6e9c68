//! Batch resolution of shipment endpoints.
//!
//! Rows are collapsed to the distinct locations they reference, each location
//! is resolved once on the blocking pool (bounded by a semaphore), endpoints
//! carrying both a postal code and a city are cross-checked, and everything is
//! folded into a [`BatchReport`] the caller inspects for manual follow-up.

use std::collections::{BTreeMap, HashSet};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::VerificationThresholds;
use crate::location::normalize::{canonical_key, normalize_query};
use crate::location::{
    CancelFlag, ConsistencyVerifier, LocationError, LocationQuery, LocationResolver, LocationResult, Resolution,
    ResolvedLocation, Source, UnresolvedReason, VerificationResult,
};

/// One shipment row as it appears in the input CSV.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ShipmentRow {
    pub origin_country: String,
    #[serde(default)]
    pub origin_postal: String,
    #[serde(default)]
    pub origin_city: String,
    pub dest_country: String,
    #[serde(default)]
    pub dest_postal: String,
    #[serde(default)]
    pub dest_city: String,
}

impl ShipmentRow {
    pub fn origin(&self) -> LocationQuery {
        LocationQuery::new(&*self.origin_country, &*self.origin_postal, &*self.origin_city)
    }

    pub fn destination(&self) -> LocationQuery {
        LocationQuery::new(&*self.dest_country, &*self.dest_postal, &*self.dest_city)
    }
}

/// Read shipment rows from CSV. Postal codes are read as text so leading
/// zeros survive.
pub fn read_rows<R: Read>(reader: R) -> LocationResult<Vec<ShipmentRow>> {
    let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let mut rows = Vec::new();
    for record in rdr.deserialize() {
        let row: ShipmentRow = record.map_err(|e| LocationError::InvalidInput(e.to_string()))?;
        rows.push(row);
    }
    Ok(rows)
}

pub fn read_rows_from_path(path: &Path) -> LocationResult<Vec<ShipmentRow>> {
    let file = std::fs::File::open(path)
        .map_err(|e| LocationError::InvalidInput(format!("{}: {}", path.display(), e)))?;
    read_rows(file)
}

/// Collects the distinct locations referenced by a set of rows.
#[derive(Debug, Default)]
pub struct BatchCollector {
    seen: HashSet<(String, String, String)>,
    locations: Vec<LocationQuery>,
}

impl BatchCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one endpoint. Returns `false` if it was already collected or is
    /// entirely blank.
    pub fn add(&mut self, query: LocationQuery) -> bool {
        let q = normalize_query(&query);
        if q.country.is_empty() && q.postal_code.is_empty() && q.city.is_empty() {
            return false;
        }
        let identity = (q.country.to_lowercase(), q.postal_code.clone(), q.city.to_lowercase());
        if !self.seen.insert(identity) {
            return false;
        }
        self.locations.push(q);
        true
    }

    pub fn add_row(&mut self, row: &ShipmentRow) {
        self.add(row.origin());
        self.add(row.destination());
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    /// The distinct locations in first-seen order.
    pub fn into_locations(self) -> Vec<LocationQuery> {
        self.locations
    }
}

/// Distinct locations of `rows`, origins and destinations interleaved in row order.
pub fn collect_locations(rows: &[ShipmentRow]) -> Vec<LocationQuery> {
    let mut collector = BatchCollector::new();
    for row in rows {
        collector.add_row(row);
    }
    collector.into_locations()
}

/// Upper bound on lookups in flight, whatever `max_concurrency` asks for.
pub const MAX_BATCH_CONCURRENCY: usize = 64;

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub max_concurrency: usize,
    pub verify: bool,
    /// Persist verifier corrections under the canonical key.
    pub apply_corrections: bool,
    pub thresholds: VerificationThresholds,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            verify: true,
            apply_corrections: false,
            thresholds: VerificationThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedEntry {
    #[serde(flatten)]
    pub query: LocationQuery,
    pub location: ResolvedLocation,
    /// True when `location` is a verifier suggestion rather than the lookup result.
    pub corrected: bool,
}

/// A location the caller has to supply coordinates for by hand.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnresolvedLocation {
    pub country: String,
    pub postal_code: String,
    pub city: String,
    pub tried_queries: Vec<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationFinding {
    #[serde(flatten)]
    pub query: LocationQuery,
    pub result: VerificationResult,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStats {
    pub total: usize,
    pub resolved: usize,
    pub unresolved: usize,
    pub cache_hits: usize,
    pub gazetteer_hits: usize,
    pub provider_hits: usize,
    pub mismatches: usize,
    pub corrected: usize,
    pub by_source: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub resolved: Vec<ResolvedEntry>,
    pub unresolved: Vec<UnresolvedLocation>,
    pub verification: Vec<VerificationFinding>,
    pub stats: BatchStats,
}

impl BatchReport {
    pub fn needs_manual_input(&self) -> bool {
        !self.unresolved.is_empty()
    }

    /// Final coordinate for an endpoint, if it was resolved in this batch.
    pub fn location_for(&self, query: &LocationQuery) -> Option<&ResolvedLocation> {
        let key = canonical_key(query).to_lowercase();
        self.resolved
            .iter()
            .find(|entry| canonical_key(&entry.query).to_lowercase() == key)
            .map(|entry| &entry.location)
    }
}

enum Lookup {
    Done(Resolution),
    Invalid(String),
}

struct Outcome {
    index: usize,
    query: LocationQuery,
    lookup: Lookup,
    from_cache: bool,
    verification: Option<VerificationResult>,
    correction: Option<ResolvedLocation>,
}

/// Resolve every location with at most `max_concurrency` lookups in flight.
///
/// Misses, invalid endpoints and cancelled lookups end up in the report; only
/// cache-store failures abort the batch.
pub async fn resolve_batch(
    resolver: Arc<LocationResolver>,
    locations: Vec<LocationQuery>,
    options: &BatchOptions,
    cancel: CancelFlag,
) -> LocationResult<BatchReport> {
    let total = locations.len();
    let max_concurrency = options.max_concurrency.clamp(1, MAX_BATCH_CONCURRENCY);
    let semaphore = Arc::new(Semaphore::new(max_concurrency));
    info!(total, max_concurrency, "resolving batch");

    let mut tasks = JoinSet::new();
    for (index, query) in locations.into_iter().enumerate() {
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };
        let resolver = Arc::clone(&resolver);
        let cancel = cancel.clone();
        let options = options.clone();
        tasks.spawn_blocking(move || {
            let _permit = permit;
            resolve_one(&resolver, index, query, &options, &cancel)
        });
    }

    let mut outcomes = Vec::with_capacity(total);
    let mut failure = None;
    while let Some(joined) = tasks.join_next().await {
        let result = joined.map_err(|e| LocationError::Worker(e.to_string())).and_then(|r| r);
        match result {
            Ok(outcome) => {
                debug!(done = outcomes.len() + 1, total, "location finished");
                outcomes.push(outcome);
            }
            Err(err) => {
                warn!(error = %err, "batch aborted");
                cancel.cancel();
                failure.get_or_insert(err);
            }
        }
    }
    if let Some(err) = failure {
        return Err(err);
    }

    outcomes.sort_by_key(|o| o.index);
    let report = build_report(outcomes);
    info!(
        resolved = report.stats.resolved,
        unresolved = report.stats.unresolved,
        mismatches = report.stats.mismatches,
        "batch finished"
    );
    Ok(report)
}

fn resolve_one(
    resolver: &LocationResolver,
    index: usize,
    query: LocationQuery,
    options: &BatchOptions,
    cancel: &CancelFlag,
) -> LocationResult<Outcome> {
    let from_cache = resolver
        .cache()
        .get(&canonical_key(&query))
        .is_some_and(|cached| cached.is_resolved());

    let resolution = match resolver.lookup(&query, cancel) {
        Ok(resolution) => resolution,
        Err(LocationError::InvalidInput(msg)) => {
            return Ok(Outcome {
                index,
                query,
                lookup: Lookup::Invalid(msg),
                from_cache: false,
                verification: None,
                correction: None,
            })
        }
        Err(err) => return Err(err),
    };

    let mut verification = None;
    let mut correction = None;
    let verifiable = query.has_postal() && query.usable_city().is_some();
    if options.verify && verifiable && resolution.is_resolved() && !cancel.is_cancelled() {
        let verifier = ConsistencyVerifier::new(resolver, options.thresholds);
        let result = verifier.verify_query(&query, options.thresholds.mismatch_km, cancel);
        if !result.is_match {
            correction = if options.apply_corrections {
                resolver.apply_suggestion(&query.country, &query.postal_code, &result)?
            } else {
                result.suggested.clone()
            };
        }
        verification = Some(result);
    }

    Ok(Outcome {
        index,
        query,
        lookup: Lookup::Done(resolution),
        from_cache,
        verification,
        correction,
    })
}

fn build_report(outcomes: Vec<Outcome>) -> BatchReport {
    let mut report = BatchReport::default();
    report.stats.total = outcomes.len();

    for outcome in outcomes {
        let Outcome {
            query,
            lookup,
            from_cache,
            verification,
            correction,
            ..
        } = outcome;

        if let Some(result) = verification {
            if !result.is_match {
                report.stats.mismatches += 1;
            }
            report.verification.push(VerificationFinding {
                query: query.clone(),
                result,
            });
        }

        match lookup {
            Lookup::Done(Resolution::Resolved(location)) => {
                report.stats.resolved += 1;
                if from_cache {
                    report.stats.cache_hits += 1;
                } else if matches!(location.source, Source::Gazetteer | Source::Sync) {
                    report.stats.gazetteer_hits += 1;
                } else {
                    report.stats.provider_hits += 1;
                }
                *report.stats.by_source.entry(location.source.to_string()).or_default() += 1;

                let corrected = correction.is_some();
                if corrected {
                    report.stats.corrected += 1;
                }
                report.resolved.push(ResolvedEntry {
                    query,
                    location: correction.unwrap_or(location),
                    corrected,
                });
            }
            Lookup::Done(Resolution::Unresolved { reason, tried }) => {
                report.stats.unresolved += 1;
                report.unresolved.push(unresolved(query, tried, reason_label(reason)));
            }
            Lookup::Invalid(msg) => {
                report.stats.unresolved += 1;
                report.unresolved.push(unresolved(query, Vec::new(), msg));
            }
        }
    }
    report
}

fn unresolved(query: LocationQuery, tried: Vec<String>, reason: impl Into<String>) -> UnresolvedLocation {
    UnresolvedLocation {
        country: query.country,
        postal_code: query.postal_code,
        city: query.city,
        tried_queries: tried,
        reason: reason.into(),
    }
}

fn reason_label(reason: UnresolvedReason) -> &'static str {
    match reason {
        UnresolvedReason::Exhausted => "exhausted",
        UnresolvedReason::PreviouslyUnresolved => "previously unresolved",
        UnresolvedReason::Cancelled => "cancelled",
        UnresolvedReason::Offline => "offline",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::providers::testing::FakeProvider;
    use crate::location::providers::ProviderChain;
    use crate::location::{CacheStore, Coordinates, Gazetteer, MemoryCache, Quality};
    use std::sync::atomic::Ordering;

    const ROWS: &str = "\
origin_country,origin_postal,origin_city,dest_country,dest_postal,dest_city
PL,00-001,Warszawa,DE,10115,Berlin
Polska,00-001,warszawa,DE,10115,Berlin
Poland,00-001,Warszawa,CZ,110 00,nan
";

    fn resolver(provider: FakeProvider) -> (Arc<LocationResolver>, Arc<MemoryCache>) {
        let cache = Arc::new(MemoryCache::new());
        let resolver = LocationResolver::new(
            cache.clone(),
            Arc::new(Gazetteer::empty()),
            ProviderChain::new(vec![Box::new(provider)]),
        );
        (Arc::new(resolver), cache)
    }

    fn options(verify: bool) -> BatchOptions {
        BatchOptions {
            max_concurrency: 3,
            verify,
            ..BatchOptions::default()
        }
    }

    #[test]
    fn test_read_rows_keeps_leading_zeros() {
        let rows = read_rows(ROWS.as_bytes()).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].origin_postal, "00-001");
        assert_eq!(rows[2].destination(), LocationQuery::new("CZ", "110 00", "nan"));
    }

    #[test]
    fn test_collector_deduplicates_spellings() {
        let rows = read_rows(ROWS.as_bytes()).unwrap();
        let locations = collect_locations(&rows);
        assert_eq!(locations.len(), 3);
        assert_eq!(locations[0], LocationQuery::new("Poland", "00-001", "Warszawa"));
        assert_eq!(locations[1], LocationQuery::new("Germany", "10115", "Berlin"));
        assert_eq!(locations[2].city, "");
    }

    #[test]
    fn test_collector_skips_blank_endpoints() {
        let mut collector = BatchCollector::new();
        assert!(!collector.add(LocationQuery::new(" ", "", "None")));
        assert!(collector.add(LocationQuery::new("FR", "", "Lyon")));
        assert!(!collector.add(LocationQuery::new("France", "", " lyon ")));
        assert_eq!(collector.len(), 1);
    }

    #[tokio::test]
    async fn test_each_location_resolved_once() {
        let provider = FakeProvider::always("fake", Coordinates::new(50.0, 20.0));
        let counter = provider.counter();
        let (resolver, _) = resolver(provider);

        let rows = read_rows(ROWS.as_bytes()).unwrap();
        let locations = collect_locations(&rows);
        let report = resolve_batch(resolver, locations, &options(false), CancelFlag::new())
            .await
            .unwrap();

        assert_eq!(report.stats.total, 3);
        assert_eq!(report.stats.resolved, 3);
        assert_eq!(report.stats.provider_hits, 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(!report.needs_manual_input());
        assert_eq!(report.resolved[1].query.country, "Germany");
    }

    #[tokio::test]
    async fn test_second_batch_hits_cache() {
        let provider = FakeProvider::always("fake", Coordinates::new(50.0, 20.0));
        let counter = provider.counter();
        let (resolver, _) = resolver(provider);
        let locations = vec![LocationQuery::new("PL", "31-000", ""), LocationQuery::new("DE", "10115", "")];

        resolve_batch(resolver.clone(), locations.clone(), &options(false), CancelFlag::new())
            .await
            .unwrap();
        let report = resolve_batch(resolver, locations, &options(false), CancelFlag::new())
            .await
            .unwrap();

        assert_eq!(report.stats.cache_hits, 2);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unresolved_are_listed_for_manual_input() {
        let provider = FakeProvider::miss("fake").answer("Poland_00-001", Coordinates::new(52.23, 21.01));
        let (resolver, cache) = resolver(provider);
        let locations = vec![
            LocationQuery::new("PL", "00-001", ""),
            LocationQuery::new("PL", "99-999", "Nowhere"),
            LocationQuery::new("", "12345", ""),
        ];

        let report = resolve_batch(resolver, locations, &options(false), CancelFlag::new())
            .await
            .unwrap();

        assert!(report.needs_manual_input());
        assert_eq!(report.stats.resolved, 1);
        assert_eq!(report.unresolved.len(), 2);
        let missing = &report.unresolved[0];
        assert_eq!(missing.postal_code, "99-999");
        assert_eq!(missing.reason, "exhausted");
        assert!(!missing.tried_queries.is_empty());
        assert!(report.unresolved[1].tried_queries.is_empty());
        assert_eq!(cache.get("Poland_99-999"), Some(ResolvedLocation::unresolved()));

        let json = serde_json::to_value(&report.unresolved[0]).unwrap();
        assert_eq!(json["postalCode"], "99-999");
        assert!(json["triedQueries"].is_array());
    }

    #[tokio::test]
    async fn test_cancelled_batch_caches_nothing() {
        let provider = FakeProvider::always("fake", Coordinates::new(50.0, 20.0));
        let (resolver, cache) = resolver(provider);
        let cancel = CancelFlag::new();
        cancel.cancel();

        let locations = vec![LocationQuery::new("PL", "31-000", ""), LocationQuery::new("PL", "30-001", "")];
        let report = resolve_batch(resolver, locations, &options(false), cancel).await.unwrap();

        assert_eq!(report.stats.unresolved, 2);
        assert!(report.unresolved.iter().all(|u| u.reason == "cancelled"));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_mismatch_uses_suggested_coordinate() {
        let provider = FakeProvider::miss("fake")
            .answer("Poland_31-000", Coordinates::new(50.06, 19.94))
            .answer("Poland_gdańsk", Coordinates::new(54.35, 18.65))
            .tagged(Quality::OpenData, Source::Nominatim);
        let (resolver, cache) = resolver(provider);
        cache.set("Poland_gdańsk", &ResolvedLocation::manual(54.35, 18.65)).unwrap();

        let locations = vec![LocationQuery::new("PL", "31-000", "Gdańsk")];
        let report = resolve_batch(resolver, locations, &options(true), CancelFlag::new())
            .await
            .unwrap();

        assert_eq!(report.stats.mismatches, 1);
        assert_eq!(report.verification.len(), 1);
        let entry = &report.resolved[0];
        assert!(entry.corrected);
        assert_eq!(entry.location.lat(), Some(54.35));
        // Not persisted unless asked.
        assert_eq!(cache.get("Poland_31-000").unwrap().lat(), Some(50.06));
    }

    #[tokio::test]
    async fn test_apply_corrections_persists() {
        let provider = FakeProvider::miss("fake")
            .answer("Poland_31-000", Coordinates::new(50.06, 19.94))
            .tagged(Quality::OpenData, Source::Nominatim);
        let (resolver, cache) = resolver(provider);
        cache.set("Poland_gdańsk", &ResolvedLocation::manual(54.35, 18.65)).unwrap();

        let opts = BatchOptions {
            apply_corrections: true,
            ..options(true)
        };
        let locations = vec![LocationQuery::new("PL", "31-000", "Gdańsk")];
        let report = resolve_batch(resolver.clone(), locations, &opts, CancelFlag::new())
            .await
            .unwrap();

        assert_eq!(report.stats.corrected, 1);
        let stored = cache.get("Poland_31-000").unwrap();
        assert_eq!(stored.source, Source::Verification);
        assert_eq!(
            report.location_for(&LocationQuery::new("Polska", "31-000", "")),
            Some(&stored)
        );
    }

    #[tokio::test]
    async fn test_many_locations_with_small_bound() {
        let provider = FakeProvider::always("fake", Coordinates::new(48.0, 16.0));
        let (resolver, _) = resolver(provider);
        let locations: Vec<_> = (0..40)
            .map(|i| LocationQuery::new("AT", format!("{:04}", 1000 + i * 10), ""))
            .collect();
        let opts = BatchOptions {
            max_concurrency: 2,
            ..options(false)
        };
        let report = resolve_batch(resolver, locations, &opts, CancelFlag::new()).await.unwrap();
        assert_eq!(report.stats.resolved, 40);
        assert_eq!(report.resolved[0].query.postal_code, "1000");
        assert_eq!(report.resolved[39].query.postal_code, "1390");
    }

    #[tokio::test]
    async fn test_oversized_concurrency_is_clamped() {
        let provider = FakeProvider::always("fake", Coordinates::new(48.0, 16.0));
        let (resolver, _) = resolver(provider);
        let locations = vec![LocationQuery::new("AT", "1010", ""), LocationQuery::new("AT", "1020", "")];
        let opts = BatchOptions {
            max_concurrency: usize::MAX,
            ..options(false)
        };
        let report = resolve_batch(resolver, locations, &opts, CancelFlag::new()).await.unwrap();
        assert_eq!(report.stats.resolved, 2);
    }

    #[tokio::test]
    async fn test_offline_batch_reports_offline_misses() {
        let cache = Arc::new(MemoryCache::new());
        let resolver = Arc::new(LocationResolver::new(
            cache.clone(),
            Arc::new(Gazetteer::empty()),
            ProviderChain::offline(),
        ));
        let locations = vec![LocationQuery::new("PL", "31-000", "Kraków")];
        let report = resolve_batch(resolver, locations, &options(false), CancelFlag::new())
            .await
            .unwrap();

        assert_eq!(report.unresolved.len(), 1);
        assert_eq!(report.unresolved[0].reason, "offline");
        assert!(cache.is_empty());
    }
}
