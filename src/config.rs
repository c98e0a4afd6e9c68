use std::path::PathBuf;
use std::time::Duration;
use std::{env, io};

use serde::Serialize;
use tracing::debug;

use crate::location::ProviderKind;

/// Distance above which a postal/city pair is a mismatch.
pub const DEFAULT_MISMATCH_THRESHOLD_KM: f64 = 100.0;
/// Secondary "different locality" heuristic.
pub const DEFAULT_LOCALITY_HEURISTIC_KM: f64 = 20.0;
/// Lower bound the heuristic only applies above.
pub const DEFAULT_LOCALITY_MIN_KM: f64 = 5.0;
/// Minimum locality-name similarity for free-text candidates.
pub const DEFAULT_SIMILARITY_CUTOFF: f64 = 0.7;

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_PROVIDER_DELAY_MS: u64 = 100;
const DEFAULT_MAX_CONCURRENCY: usize = 5;
const DEFAULT_PTV_BASE_URL: &str = "https://api.myptv.com/geocoding/v1";
const DEFAULT_NOMINATIM_URL: &str = "https://nominatim.openstreetmap.org";

/// Thresholds the consistency verifier compares distances against.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct VerificationThresholds {
    pub mismatch_km: f64,
    pub locality_heuristic_km: f64,
    pub locality_min_km: f64,
}

impl Default for VerificationThresholds {
    fn default() -> Self {
        Self {
            mismatch_km: DEFAULT_MISMATCH_THRESHOLD_KM,
            locality_heuristic_km: DEFAULT_LOCALITY_HEURISTIC_KM,
            locality_min_km: DEFAULT_LOCALITY_MIN_KM,
        }
    }
}

#[derive(Clone, Debug)]
pub struct LocatorConfig {
    pub cache_path: Option<PathBuf>,
    pub cache_ttl_days: Option<u64>,
    pub gazetteer_path: Option<PathBuf>,
    pub gazetteer_sync: bool,
    pub provider_order: Vec<ProviderKind>,
    pub ptv_api_key: Option<String>,
    pub ptv_base_url: String,
    pub nominatim_url: String,
    pub nominatim_polygon: bool,
    pub language: String,
    pub request_timeout: Duration,
    pub provider_delay: Duration,
    pub max_concurrency: usize,
    pub thresholds: VerificationThresholds,
    pub similarity_cutoff: f64,
}

/// What `locator config` prints: everything except the API key itself.
#[derive(Clone, Debug, Serialize)]
pub struct PublicLocatorConfig {
    pub cache_path: Option<PathBuf>,
    pub cache_ttl_days: Option<u64>,
    pub gazetteer_path: Option<PathBuf>,
    pub gazetteer_sync: bool,
    pub provider_order: Vec<ProviderKind>,
    pub has_ptv_api_key: bool,
    pub nominatim_polygon: bool,
    pub request_timeout_ms: u64,
    pub provider_delay_ms: u64,
    pub max_concurrency: usize,
    pub thresholds: VerificationThresholds,
    pub similarity_cutoff: f64,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl LocatorConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key → value source. Unparseable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let parse_u64 = |key: &str| get(key).and_then(|v| v.parse::<u64>().ok());
        let parse_f64 = |key: &str, default: f64| {
            get(key)
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|v| v.is_finite() && *v >= 0.0)
                .unwrap_or(default)
        };
        let parse_bool = |key: &str, default: bool| {
            get(key)
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True" | "yes"))
                .unwrap_or(default)
        };

        let provider_order = get("LOCATOR_PROVIDER_ORDER")
            .map(|raw| parse_provider_order(&raw))
            .filter(|order| !order.is_empty())
            .unwrap_or_else(|| ProviderKind::DEFAULT_ORDER.to_vec());

        Self {
            cache_path: get("LOCATOR_CACHE_PATH").map(PathBuf::from),
            cache_ttl_days: parse_u64("LOCATOR_CACHE_TTL_DAYS"),
            gazetteer_path: get("LOCATOR_GAZETTEER_PATH").map(PathBuf::from),
            gazetteer_sync: parse_bool("LOCATOR_GAZETTEER_SYNC", true),
            provider_order,
            ptv_api_key: get("PTV_API_KEY"),
            ptv_base_url: get("PTV_BASE_URL").unwrap_or_else(|| DEFAULT_PTV_BASE_URL.to_string()),
            nominatim_url: get("NOMINATIM_URL").unwrap_or_else(|| DEFAULT_NOMINATIM_URL.to_string()),
            nominatim_polygon: parse_bool("LOCATOR_NOMINATIM_POLYGON", true),
            language: get("LOCATOR_LANGUAGE").unwrap_or_else(|| "en".to_string()),
            request_timeout: Duration::from_millis(
                parse_u64("LOCATOR_REQUEST_TIMEOUT_MS").unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS),
            ),
            provider_delay: Duration::from_millis(
                parse_u64("LOCATOR_PROVIDER_DELAY_MS").unwrap_or(DEFAULT_PROVIDER_DELAY_MS),
            ),
            max_concurrency: parse_u64("LOCATOR_MAX_CONCURRENCY")
                .map(|v| v as usize)
                .unwrap_or(DEFAULT_MAX_CONCURRENCY)
                .max(1),
            thresholds: VerificationThresholds {
                mismatch_km: parse_f64("LOCATOR_MISMATCH_THRESHOLD_KM", DEFAULT_MISMATCH_THRESHOLD_KM),
                locality_heuristic_km: parse_f64("LOCATOR_LOCALITY_HEURISTIC_KM", DEFAULT_LOCALITY_HEURISTIC_KM),
                locality_min_km: parse_f64("LOCATOR_LOCALITY_MIN_KM", DEFAULT_LOCALITY_MIN_KM),
            },
            similarity_cutoff: parse_f64("LOCATOR_SIMILARITY_CUTOFF", DEFAULT_SIMILARITY_CUTOFF).min(1.0),
        }
    }

    pub fn public_profile(&self) -> PublicLocatorConfig {
        PublicLocatorConfig {
            cache_path: self.cache_path.clone(),
            cache_ttl_days: self.cache_ttl_days,
            gazetteer_path: self.gazetteer_path.clone(),
            gazetteer_sync: self.gazetteer_sync,
            provider_order: self.provider_order.clone(),
            has_ptv_api_key: self.ptv_api_key.is_some(),
            nominatim_polygon: self.nominatim_polygon,
            request_timeout_ms: self.request_timeout.as_millis() as u64,
            provider_delay_ms: self.provider_delay.as_millis() as u64,
            max_concurrency: self.max_concurrency,
            thresholds: self.thresholds,
            similarity_cutoff: self.similarity_cutoff,
        }
    }
}

fn parse_provider_order(raw: &str) -> Vec<ProviderKind> {
    let mut order = Vec::new();
    for part in raw.split(',').filter(|p| !p.trim().is_empty()) {
        match part.parse::<ProviderKind>() {
            Ok(kind) if !order.contains(&kind) => order.push(kind),
            Ok(_) => {}
            Err(err) => debug!(%err, "ignoring provider order entry"),
        }
    }
    order
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions)
        || env::var("ALLOW_DOTENV")
            .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> LocatorConfig {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        LocatorConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_match_named_constants() {
        let config = config_from(&[]);
        assert_eq!(config.thresholds, VerificationThresholds::default());
        assert_eq!(config.similarity_cutoff, DEFAULT_SIMILARITY_CUTOFF);
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.provider_delay, Duration::from_millis(100));
        assert_eq!(config.provider_order, ProviderKind::DEFAULT_ORDER.to_vec());
        assert!(config.gazetteer_sync);
        assert!(config.ptv_api_key.is_none());
    }

    #[test]
    fn overrides_are_applied() {
        let config = config_from(&[
            ("LOCATOR_PROVIDER_ORDER", "nominatim, structured"),
            ("LOCATOR_GAZETTEER_SYNC", "false"),
            ("LOCATOR_MISMATCH_THRESHOLD_KM", "50"),
            ("LOCATOR_MAX_CONCURRENCY", "8"),
            ("PTV_API_KEY", "secret"),
        ]);
        assert_eq!(config.provider_order, vec![ProviderKind::OpenData, ProviderKind::Structured]);
        assert!(!config.gazetteer_sync);
        assert_eq!(config.thresholds.mismatch_km, 50.0);
        assert_eq!(config.max_concurrency, 8);
    }

    #[test]
    fn invalid_values_fall_back() {
        let config = config_from(&[
            ("LOCATOR_MISMATCH_THRESHOLD_KM", "far"),
            ("LOCATOR_MAX_CONCURRENCY", "0"),
            ("LOCATOR_PROVIDER_ORDER", "pigeon"),
            ("PTV_API_KEY", "   "),
        ]);
        assert_eq!(config.thresholds.mismatch_km, DEFAULT_MISMATCH_THRESHOLD_KM);
        assert_eq!(config.max_concurrency, 1);
        assert_eq!(config.provider_order, ProviderKind::DEFAULT_ORDER.to_vec());
        assert!(config.ptv_api_key.is_none());
    }

    #[test]
    fn public_profile_hides_key() {
        let config = config_from(&[("PTV_API_KEY", "secret")]);
        let public = config.public_profile();
        assert!(public.has_ptv_api_key);
        let json = serde_json::to_string(&public).unwrap();
        assert!(!json.contains("secret"));
    }
}
