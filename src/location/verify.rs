//! Postal-code vs. city consistency check for one shipment endpoint.
//!
//! The postal code and the city are resolved independently (`{country}_{postal}`
//! and `{country}_{city}` keys). If they land too far apart, the more
//! reliable of the two coordinates is suggested as the correction.

use super::normalize::{is_usable_city, normalize_postal};
use super::resolver::LocationResolver;
use super::scoring;
use super::types::{CancelFlag, LocationQuery, Resolution, ResolvedLocation};
use crate::config::VerificationThresholds;
use crate::geo::haversine;
use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub is_match: bool,
    pub distance_km: Option<f64>,
    #[serde(rename = "postalCoords")]
    pub postal: Option<ResolvedLocation>,
    #[serde(rename = "cityCoords")]
    pub city: Option<ResolvedLocation>,
    #[serde(rename = "suggestedCoords")]
    pub suggested: Option<ResolvedLocation>,
    pub error: Option<String>,
}

impl Default for VerificationResult {
    fn default() -> Self {
        Self {
            is_match: true,
            distance_km: None,
            postal: None,
            city: None,
            suggested: None,
            error: None,
        }
    }
}

impl VerificationResult {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// True if the distance counts as two different places.
pub fn is_mismatch(distance_km: f64, mismatch_km: f64, thresholds: &VerificationThresholds) -> bool {
    distance_km > mismatch_km
        || (distance_km > thresholds.locality_min_km && distance_km > thresholds.locality_heuristic_km)
}

/// Compare two resolved coordinates. Ties in reliability favor the postal side.
pub fn compare(
    postal: ResolvedLocation,
    city: ResolvedLocation,
    mismatch_km: f64,
    thresholds: &VerificationThresholds,
) -> VerificationResult {
    let Some(distance) = haversine(postal.coords, city.coords) else {
        return VerificationResult {
            postal: Some(postal),
            city: Some(city),
            ..VerificationResult::failed("missing coordinates")
        };
    };

    if !is_mismatch(distance, mismatch_km, thresholds) {
        return VerificationResult {
            is_match: true,
            distance_km: Some(distance),
            postal: Some(postal),
            city: Some(city),
            suggested: None,
            error: None,
        };
    }

    let postal_score = scoring::score(postal.quality, postal.source);
    let city_score = scoring::score(city.quality, city.source);
    let suggested = if city_score > postal_score { city.clone() } else { postal.clone() };
    info!(
        distance_km = distance,
        postal_score, city_score, "postal code and city disagree"
    );

    VerificationResult {
        is_match: false,
        distance_km: Some(distance),
        postal: Some(postal),
        city: Some(city),
        suggested: Some(suggested),
        error: None,
    }
}

pub struct ConsistencyVerifier<'a> {
    resolver: &'a LocationResolver,
    thresholds: VerificationThresholds,
}

impl<'a> ConsistencyVerifier<'a> {
    pub fn new(resolver: &'a LocationResolver, thresholds: VerificationThresholds) -> Self {
        Self { resolver, thresholds }
    }

    /// Verify with the configured mismatch threshold.
    pub fn verify(&self, country: &str, postal: &str, city: &str) -> VerificationResult {
        self.verify_with_threshold(country, postal, city, self.thresholds.mismatch_km)
    }

    pub fn verify_with_threshold(&self, country: &str, postal: &str, city: &str, threshold_km: f64) -> VerificationResult {
        let query = LocationQuery::new(country, postal, city);
        self.verify_query(&query, threshold_km, &CancelFlag::new())
    }

    pub fn verify_query(&self, query: &LocationQuery, threshold_km: f64, cancel: &CancelFlag) -> VerificationResult {
        if !is_usable_city(&query.city) {
            return VerificationResult::failed("no city");
        }
        if normalize_postal(&query.postal_code).is_empty() {
            return VerificationResult::failed("no postal");
        }

        let postal_query = LocationQuery::new(query.country.as_str(), query.postal_code.as_str(), "");
        let city_query = LocationQuery::new(query.country.as_str(), "", query.city.as_str());

        let postal = match self.resolver.lookup(&postal_query, cancel) {
            Ok(Resolution::Resolved(loc)) => loc,
            Ok(Resolution::Unresolved { .. }) => return VerificationResult::failed("postal code could not be resolved"),
            Err(err) => return VerificationResult::failed(format!("postal code lookup failed: {}", err)),
        };
        let city = match self.resolver.lookup(&city_query, cancel) {
            Ok(Resolution::Resolved(loc)) => loc,
            Ok(Resolution::Unresolved { .. }) => {
                return VerificationResult {
                    postal: Some(postal),
                    ..VerificationResult::failed("city could not be resolved")
                }
            }
            Err(err) => {
                return VerificationResult {
                    postal: Some(postal),
                    ..VerificationResult::failed(format!("city lookup failed: {}", err))
                }
            }
        };

        debug!(%query, "comparing postal and city coordinates");
        compare(postal, city, threshold_km, &self.thresholds)
    }
}
