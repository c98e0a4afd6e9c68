//! PTV-style geocoding: the structured-address endpoint and the free-text endpoint.
//!
//! Both return the same candidate list; only the first candidate is used.

use super::normalize::{build_key, city_key, country_code, generate_query_variants, variant_key};
use super::providers::{
    build_agent, country_code_matches, fetch_json, locality_similarity, postal_leading_digit_matches,
    AttemptLog, GeocodingProvider, ProviderHit, RateLimiter,
};
use super::types::{Coordinates, LocationQuery, LocationResult, Quality, ResolvedLocation, Source};
use crate::config::LocatorConfig;
use serde::Deserialize;
use tracing::debug;

#[derive(Deserialize, Debug, Default)]
pub struct PtvResponse {
    #[serde(default)]
    pub locations: Vec<PtvLocation>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PtvLocation {
    pub reference_position: Option<PtvPosition>,
    #[serde(default)]
    pub address: PtvAddress,
    #[serde(default)]
    pub location_type: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Copy)]
pub struct PtvPosition {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct PtvAddress {
    #[serde(default)]
    pub country_code: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(default, alias = "locality")]
    pub city: Option<String>,
}

impl PtvLocation {
    fn coords(&self) -> Option<Coordinates> {
        let pos = self.reference_position?;
        Coordinates::from_parts(Some(pos.latitude), Some(pos.longitude))
    }
}

/// Accept the first candidate of a structured query if its country matches
/// and its postal code starts like the requested one.
pub fn evaluate_structured(
    response: &PtvResponse,
    expected_country: Option<&str>,
    requested_postal: Option<&str>,
) -> Option<Coordinates> {
    let top = response.locations.first()?;
    let address = &top.address;
    if !country_code_matches(expected_country, address.country_code.as_deref()) {
        debug!(returned = ?address.country_code, "structured candidate rejected: country");
        return None;
    }
    if let Some(postal) = requested_postal {
        if !postal_leading_digit_matches(postal, address.postal_code.as_deref()) {
            debug!(requested = postal, returned = ?address.postal_code, "structured candidate rejected: postal");
            return None;
        }
    }
    top.coords()
}

/// Accept the first free-text candidate if its country matches and, when the
/// query named a city, the locality is similar enough or the postal code agrees.
pub fn evaluate_free_text(
    response: &PtvResponse,
    expected_country: Option<&str>,
    requested_postal: Option<&str>,
    requested_city: Option<&str>,
    similarity_cutoff: f64,
) -> Option<Coordinates> {
    let top = response.locations.first()?;
    let address = &top.address;
    if !country_code_matches(expected_country, address.country_code.as_deref()) {
        return None;
    }

    let postal_ok = requested_postal
        .map(|p| postal_leading_digit_matches(p, address.postal_code.as_deref()))
        .unwrap_or(false);

    let accepted = match requested_city {
        Some(city) => {
            let similarity = address
                .city
                .as_deref()
                .map(|returned| locality_similarity(city, returned))
                .unwrap_or(0.0);
            similarity >= similarity_cutoff || postal_ok
        }
        None => requested_postal.is_none() || postal_ok,
    };

    if !accepted {
        debug!(returned_city = ?address.city, returned_postal = ?address.postal_code, "free-text candidate rejected");
        return None;
    }
    top.coords()
}

struct PtvClient {
    agent: ureq::Agent,
    limiter: RateLimiter,
    base_url: String,
    api_key: String,
}

impl PtvClient {
    fn new(config: &LocatorConfig, api_key: String) -> Self {
        Self {
            agent: build_agent(config.request_timeout),
            limiter: RateLimiter::new(config.provider_delay),
            base_url: config.ptv_base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn get(&self, path: &str, params: &[(&str, &str)]) -> LocationResult<PtvResponse> {
        self.limiter.wait();
        let mut request = self
            .agent
            .get(&format!("{}/{}", self.base_url, path))
            .query("apiKey", &self.api_key);
        for (name, value) in params {
            request = request.query(name, value);
        }
        fetch_json(request)
    }
}

/// Queries with discrete country / postal / locality fields.
pub struct StructuredAddressProvider {
    client: PtvClient,
}

impl StructuredAddressProvider {
    pub fn new(config: &LocatorConfig, api_key: String) -> Self {
        Self {
            client: PtvClient::new(config, api_key),
        }
    }
}

struct StructuredAttempt<'a> {
    postal: Option<&'a str>,
    city: Option<&'a str>,
    key: String,
}

impl GeocodingProvider for StructuredAddressProvider {
    fn name(&self) -> &'static str {
        "ptv_structured"
    }

    fn resolve(&self, query: &LocationQuery, log: &mut AttemptLog) -> LocationResult<Option<ProviderHit>> {
        let iso = country_code(&query.country);
        let country_param = iso.unwrap_or(query.country.as_str());
        let postal = Some(query.postal_code.as_str()).filter(|p| !p.is_empty());
        let city = query.usable_city();

        let mut attempts = Vec::new();
        if let (Some(p), Some(c)) = (postal, city) {
            attempts.push(StructuredAttempt { postal: Some(p), city: Some(c), key: variant_key(&query.country, p, c) });
        }
        if let Some(p) = postal {
            attempts.push(StructuredAttempt { postal: Some(p), city: None, key: build_key(&query.country, p) });
        }
        if let Some(c) = city {
            attempts.push(StructuredAttempt { postal: None, city: Some(c), key: city_key(&query.country, c) });
        }

        for attempt in attempts {
            if log.is_cancelled() {
                return Ok(None);
            }
            let description = format!(
                "structured: country={} postalCode={} locality={}",
                country_param,
                attempt.postal.unwrap_or("-"),
                attempt.city.unwrap_or("-")
            );
            log.record(description.clone());

            let mut params = vec![("country", country_param)];
            if let Some(p) = attempt.postal {
                params.push(("postalCode", p));
            }
            if let Some(c) = attempt.city {
                params.push(("locality", c));
            }

            let response = self.client.get("locations/by-address", &params)?;
            if let Some(coords) = evaluate_structured(&response, iso, attempt.postal) {
                return Ok(Some(ProviderHit {
                    location: ResolvedLocation::new(coords, Quality::Structured, Source::StructuredApi),
                    key: attempt.key,
                    query_text: description,
                }));
            }
        }
        Ok(None)
    }
}

/// One free-text search per generated query variant.
pub struct FreeTextProvider {
    client: PtvClient,
    language: String,
    similarity_cutoff: f64,
}

impl FreeTextProvider {
    pub fn new(config: &LocatorConfig, api_key: String) -> Self {
        Self {
            client: PtvClient::new(config, api_key),
            language: config.language.clone(),
            similarity_cutoff: config.similarity_cutoff,
        }
    }
}

impl GeocodingProvider for FreeTextProvider {
    fn name(&self) -> &'static str {
        "ptv_text"
    }

    fn resolve(&self, query: &LocationQuery, log: &mut AttemptLog) -> LocationResult<Option<ProviderHit>> {
        let iso = country_code(&query.country);
        let city = query.usable_city();
        let postal = Some(query.postal_code.as_str()).filter(|p| !p.is_empty());

        for variant in generate_query_variants(&query.country, &query.postal_code, &query.city) {
            if log.is_cancelled() {
                return Ok(None);
            }
            log.record(variant.text.clone());

            let mut params = vec![("searchText", variant.text.as_str()), ("language", self.language.as_str())];
            if let Some(code) = iso {
                params.push(("countryFilter", code));
            }
            let response = self.client.get("locations/by-text", &params)?;

            let requested_postal = postal.filter(|_| variant.uses_postal);
            let requested_city = city.filter(|_| variant.uses_city);
            if let Some(coords) =
                evaluate_free_text(&response, iso, requested_postal, requested_city, self.similarity_cutoff)
            {
                return Ok(Some(ProviderHit {
                    location: ResolvedLocation::new(coords, Quality::FreeText, Source::FreeTextApi),
                    key: variant.key,
                    query_text: variant.text,
                }));
            }
        }
        Ok(None)
    }
}
