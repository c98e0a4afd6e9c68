//! Geocoding provider abstraction and the ordered provider chain.
//!
//! Every provider is tried with a normalized [`LocationQuery`]. Network
//! failures and validation rejections both end as a miss for that provider;
//! the chain then moves on and never retries the same provider.

use super::nominatim::NominatimProvider;
use super::ptv::{FreeTextProvider, StructuredAddressProvider};
use super::types::{CancelFlag, LocationError, LocationQuery, LocationResult, ResolvedLocation};
use crate::config::LocatorConfig;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const USER_AGENT: &str = "FreightLocator/0.7 (route-pricing)";

/// The concrete providers the chain knows how to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Structured,
    FreeText,
    OpenData,
}

impl ProviderKind {
    pub const DEFAULT_ORDER: [ProviderKind; 3] = [Self::Structured, Self::FreeText, Self::OpenData];
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Structured => write!(f, "structured"),
            Self::FreeText => write!(f, "free_text"),
            Self::OpenData => write!(f, "open_data"),
        }
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "structured" | "ptv_structured" => Ok(Self::Structured),
            "free_text" | "text" | "ptv" => Ok(Self::FreeText),
            "open_data" | "nominatim" | "osm" => Ok(Self::OpenData),
            other => Err(format!("unknown provider '{}'", other)),
        }
    }
}

/// A validated provider answer and the key it should be cached under.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderHit {
    pub location: ResolvedLocation,
    pub key: String,
    pub query_text: String,
}

/// Per-lookup record of attempted queries plus the batch cancellation flag.
#[derive(Debug, Default)]
pub struct AttemptLog {
    cancel: CancelFlag,
    tried: Vec<String>,
}

impl AttemptLog {
    pub fn new(cancel: CancelFlag) -> Self {
        Self { cancel, tried: Vec::new() }
    }

    pub fn record(&mut self, query_text: impl Into<String>) {
        self.tried.push(query_text.into());
    }

    pub fn tried(&self) -> &[String] {
        &self.tried
    }

    pub fn into_tried(self) -> Vec<String> {
        self.tried
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A single external geocoding source.
pub trait GeocodingProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Try this provider's query combinations for an already-normalized query.
    /// `Ok(None)` means every combination missed or was rejected.
    fn resolve(&self, query: &LocationQuery, log: &mut AttemptLog) -> LocationResult<Option<ProviderHit>>;
}

/// Minimum spacing between calls to one provider, shared by all workers.
pub struct RateLimiter {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: Mutex::new(None),
        }
    }

    /// Block until the minimum interval since the previous call has passed.
    pub fn wait(&self) {
        let mut last = self.last_call.lock();
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                std::thread::sleep(self.min_interval - elapsed);
            }
        }
        *last = Some(Instant::now());
    }
}

pub(crate) fn build_agent(timeout: Duration) -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
}

pub(crate) fn fetch_json<T: DeserializeOwned>(request: ureq::Request) -> LocationResult<T> {
    let response = request.call().map_err(|e| LocationError::Network(e.to_string()))?;
    response
        .into_json()
        .map_err(|e| LocationError::InvalidResponse(e.to_string()))
}

/// True unless both sides carry a postal code and their first characters differ.
pub(crate) fn postal_leading_digit_matches(requested: &str, returned: Option<&str>) -> bool {
    let first = |s: &str| s.trim().chars().next().map(|c| c.to_ascii_uppercase());
    match (first(requested), returned.and_then(first)) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}

/// True unless both codes are known and differ.
pub(crate) fn country_code_matches(expected: Option<&str>, returned: Option<&str>) -> bool {
    match (expected, returned) {
        (Some(e), Some(r)) if !r.trim().is_empty() => e.eq_ignore_ascii_case(r.trim()),
        _ => true,
    }
}

/// Similarity of two locality names in `[0, 1]`; containment counts as a full match.
pub(crate) fn locality_similarity(a: &str, b: &str) -> f64 {
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a.contains(&b) || b.contains(&a) {
        return 1.0;
    }
    strsim::normalized_levenshtein(&a, &b)
}

/// Providers in policy order.
pub struct ProviderChain {
    providers: Vec<Box<dyn GeocodingProvider>>,
}

impl ProviderChain {
    pub fn new(providers: Vec<Box<dyn GeocodingProvider>>) -> Self {
        Self { providers }
    }

    /// No providers: cache and gazetteer only.
    pub fn offline() -> Self {
        Self { providers: Vec::new() }
    }

    /// Build the configured order. PTV providers are skipped without an API key.
    pub fn from_config(config: &LocatorConfig) -> Self {
        let mut providers: Vec<Box<dyn GeocodingProvider>> = Vec::new();
        for kind in &config.provider_order {
            match kind {
                ProviderKind::Structured | ProviderKind::FreeText => {
                    let Some(api_key) = config.ptv_api_key.clone() else {
                        warn!(provider = %kind, "PTV_API_KEY not set; provider disabled");
                        continue;
                    };
                    if *kind == ProviderKind::Structured {
                        providers.push(Box::new(StructuredAddressProvider::new(config, api_key)));
                    } else {
                        providers.push(Box::new(FreeTextProvider::new(config, api_key)));
                    }
                }
                ProviderKind::OpenData => providers.push(Box::new(NominatimProvider::new(config))),
            }
        }
        debug!(providers = ?providers.iter().map(|p| p.name()).collect::<Vec<_>>(), "provider chain built");
        Self { providers }
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// First validated hit across providers, in order.
    pub fn resolve(&self, query: &LocationQuery, log: &mut AttemptLog) -> Option<ProviderHit> {
        for provider in &self.providers {
            if log.is_cancelled() {
                debug!(%query, "cancelled before provider {}", provider.name());
                return None;
            }
            match provider.resolve(query, log) {
                Ok(Some(hit)) => {
                    info!(provider = provider.name(), %query, via = %hit.query_text, "provider resolved location");
                    return Some(hit);
                }
                Ok(None) => debug!(provider = provider.name(), %query, "provider miss"),
                Err(err) => warn!(provider = provider.name(), %query, %err, "provider failed; treating as miss"),
            }
        }
        None
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::location::normalize::canonical_key;
    use crate::location::types::{Coordinates, Quality, Source};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Counting in-memory provider keyed by canonical key.
    pub struct FakeProvider {
        name: &'static str,
        answers: HashMap<String, Coordinates>,
        default: Option<Coordinates>,
        fail: bool,
        quality: Quality,
        source: Source,
        pub calls: Arc<AtomicUsize>,
    }

    impl FakeProvider {
        pub fn miss(name: &'static str) -> Self {
            Self {
                name,
                answers: HashMap::new(),
                default: None,
                fail: false,
                quality: Quality::Structured,
                source: Source::StructuredApi,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub fn always(name: &'static str, coords: Coordinates) -> Self {
            Self { default: Some(coords), ..Self::miss(name) }
        }

        pub fn failing(name: &'static str) -> Self {
            Self { fail: true, ..Self::miss(name) }
        }

        pub fn answer(mut self, key: &str, coords: Coordinates) -> Self {
            self.answers.insert(key.to_lowercase(), coords);
            self
        }

        pub fn tagged(mut self, quality: Quality, source: Source) -> Self {
            self.quality = quality;
            self.source = source;
            self
        }

        pub fn counter(&self) -> Arc<AtomicUsize> {
            Arc::clone(&self.calls)
        }
    }

    impl GeocodingProvider for FakeProvider {
        fn name(&self) -> &'static str {
            self.name
        }

        fn resolve(&self, query: &LocationQuery, log: &mut AttemptLog) -> LocationResult<Option<ProviderHit>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let text = format!("{} {}", self.name, query);
            log.record(text.clone());
            if self.fail {
                return Err(LocationError::Network("connection refused".into()));
            }
            let key = canonical_key(query);
            let coords = self.answers.get(&key.to_lowercase()).copied().or(self.default);
            Ok(coords.map(|c| ProviderHit {
                location: ResolvedLocation::new(c, self.quality, self.source),
                key,
                query_text: text,
            }))
        }
    }
}
