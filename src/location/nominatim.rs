//! OpenStreetMap Nominatim as the open-data fallback provider.

use super::normalize::{country_code, generate_query_variants};
use super::providers::{
    build_agent, country_code_matches, fetch_json, postal_leading_digit_matches, AttemptLog,
    GeocodingProvider, ProviderHit, RateLimiter,
};
use super::types::{Coordinates, LocationQuery, LocationResult, Quality, ResolvedLocation, Source};
use crate::config::LocatorConfig;
use crate::geo::{bbox_midpoint, geojson_centroid};
use serde::Deserialize;
use tracing::debug;

#[derive(Deserialize, Debug, Clone)]
pub struct NominatimPlace {
    pub lat: String,
    pub lon: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// `[south, north, west, east]` as strings.
    #[serde(default)]
    pub boundingbox: Option<Vec<String>>,
    #[serde(default)]
    pub geojson: Option<serde_json::Value>,
    #[serde(default)]
    pub address: Option<NominatimAddress>,
    #[serde(default)]
    pub osm_type: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct NominatimAddress {
    #[serde(default)]
    pub postcode: Option<String>,
    #[serde(default)]
    pub country_code: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

impl NominatimPlace {
    fn point(&self) -> Option<Coordinates> {
        Coordinates::from_parts(self.lat.trim().parse().ok(), self.lon.trim().parse().ok())
    }

    fn bbox_center(&self) -> Option<Coordinates> {
        let bbox = self.boundingbox.as_ref()?;
        if bbox.len() != 4 {
            return None;
        }
        let v: Vec<f64> = bbox.iter().filter_map(|s| s.trim().parse().ok()).collect();
        if v.len() != 4 {
            return None;
        }
        Some(bbox_midpoint(v[0], v[1], v[2], v[3]))
    }

    /// Polygon centroid, else bounding-box midpoint, else the raw point.
    pub fn representative_point(&self) -> Option<Coordinates> {
        self.geojson
            .as_ref()
            .and_then(geojson_centroid)
            .or_else(|| self.bbox_center())
            .or_else(|| self.point())
    }
}

/// Accept the first place unless its country or postal prefix disagrees.
pub fn evaluate_places(
    places: &[NominatimPlace],
    expected_country: Option<&str>,
    requested_postal: Option<&str>,
) -> Option<Coordinates> {
    let top = places.first()?;
    let address = top.address.clone().unwrap_or_default();
    if !country_code_matches(expected_country, address.country_code.as_deref()) {
        debug!(returned = ?address.country_code, "nominatim place rejected: country");
        return None;
    }
    if let Some(postal) = requested_postal {
        if !postal_leading_digit_matches(postal, address.postcode.as_deref()) {
            debug!(requested = postal, returned = ?address.postcode, "nominatim place rejected: postal");
            return None;
        }
    }
    top.representative_point()
}

pub struct NominatimProvider {
    agent: ureq::Agent,
    limiter: RateLimiter,
    base_url: String,
    polygon: bool,
}

impl NominatimProvider {
    pub fn new(config: &LocatorConfig) -> Self {
        Self {
            agent: build_agent(config.request_timeout),
            limiter: RateLimiter::new(config.provider_delay),
            base_url: config.nominatim_url.trim_end_matches('/').to_string(),
            polygon: config.nominatim_polygon,
        }
    }

    fn search(&self, text: &str, country: Option<&str>) -> LocationResult<Vec<NominatimPlace>> {
        self.limiter.wait();
        let mut request = self
            .agent
            .get(&format!("{}/search", self.base_url))
            .query("q", text)
            .query("format", "json")
            .query("limit", "1")
            .query("addressdetails", "1");
        if let Some(code) = country {
            request = request.query("countrycodes", &code.to_lowercase());
        }
        if self.polygon {
            request = request.query("polygon_geojson", "1");
        }
        fetch_json(request)
    }
}

impl GeocodingProvider for NominatimProvider {
    fn name(&self) -> &'static str {
        "nominatim"
    }

    fn resolve(&self, query: &LocationQuery, log: &mut AttemptLog) -> LocationResult<Option<ProviderHit>> {
        let iso = country_code(&query.country);
        let postal = Some(query.postal_code.as_str()).filter(|p| !p.is_empty());

        for variant in generate_query_variants(&query.country, &query.postal_code, &query.city) {
            if log.is_cancelled() {
                return Ok(None);
            }
            log.record(format!("nominatim: {}", variant.text));
            let places = self.search(&variant.text, iso)?;
            let requested_postal = postal.filter(|_| variant.uses_postal);
            if let Some(coords) = evaluate_places(&places, iso, requested_postal) {
                return Ok(Some(ProviderHit {
                    location: ResolvedLocation::new(coords, Quality::OpenData, Source::Nominatim),
                    key: variant.key,
                    query_text: variant.text,
                }));
            }
        }
        Ok(None)
    }
}
