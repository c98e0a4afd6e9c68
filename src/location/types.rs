//! Core types for the location subsystem.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// A (country, postal code, optional city) triple as supplied by a shipment row.
///
/// Not persisted; constructed per lookup. Values are stored as given and
/// normalized by [`super::normalize`] when keys or queries are built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocationQuery {
    pub country: String,
    #[serde(rename = "postalCode")]
    pub postal_code: String,
    #[serde(default)]
    pub city: String,
}

impl LocationQuery {
    pub fn new(country: impl Into<String>, postal_code: impl Into<String>, city: impl Into<String>) -> Self {
        Self {
            country: country.into(),
            postal_code: postal_code.into(),
            city: city.into(),
        }
    }

    /// The city, if it carries a usable (non-placeholder) value.
    pub fn usable_city(&self) -> Option<&str> {
        let city = self.city.trim();
        super::normalize::is_usable_city(city).then_some(city)
    }

    pub fn has_postal(&self) -> bool {
        !self.postal_code.trim().is_empty()
    }
}

impl fmt::Display for LocationQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.usable_city() {
            Some(city) => write!(f, "{} {} ({})", self.country, self.postal_code, city),
            None => write!(f, "{} {}", self.country, self.postal_code),
        }
    }
}

/// A latitude/longitude pair. Both halves are always present.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Build from optional halves; a partial pair is treated as absent.
    pub fn from_parts(lat: Option<f64>, lon: Option<f64>) -> Option<Self> {
        match (lat, lon) {
            (Some(lat), Some(lon)) if lat.is_finite() && lon.is_finite() => Some(Self { lat, lon }),
            _ => None,
        }
    }
}

/// How a coordinate was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Quality {
    /// Exact gazetteer key match.
    #[serde(rename = "lookup")]
    Lookup,
    /// Gazetteer hit through a padded, stripped or substring key.
    #[serde(rename = "lookup_partial")]
    LookupPartial,
    #[serde(rename = "PTV API (structured)")]
    Structured,
    #[serde(rename = "PTV API")]
    FreeText,
    #[serde(rename = "Nominatim")]
    OpenData,
    #[serde(rename = "manual")]
    Manual,
    #[serde(rename = "unknown")]
    Unknown,
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lookup => write!(f, "lookup"),
            Self::LookupPartial => write!(f, "lookup_partial"),
            Self::Structured => write!(f, "PTV API (structured)"),
            Self::FreeText => write!(f, "PTV API"),
            Self::OpenData => write!(f, "Nominatim"),
            Self::Manual => write!(f, "manual"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Which collaborator produced a coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Source {
    #[serde(rename = "gazetteer")]
    Gazetteer,
    /// Gazetteer entry pushed into the cache at startup.
    #[serde(rename = "sync")]
    Sync,
    #[serde(rename = "ptv_structured")]
    StructuredApi,
    #[serde(rename = "ptv_text")]
    FreeTextApi,
    #[serde(rename = "nominatim")]
    Nominatim,
    #[serde(rename = "manual")]
    Manual,
    #[serde(rename = "verification")]
    Verification,
    #[serde(rename = "no data")]
    NoData,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gazetteer => write!(f, "gazetteer"),
            Self::Sync => write!(f, "sync"),
            Self::StructuredApi => write!(f, "ptv_structured"),
            Self::FreeTextApi => write!(f, "ptv_text"),
            Self::Nominatim => write!(f, "nominatim"),
            Self::Manual => write!(f, "manual"),
            Self::Verification => write!(f, "verification"),
            Self::NoData => write!(f, "no data"),
        }
    }
}

/// A resolved coordinate with provenance.
///
/// `coords == None` is the explicit "unresolved" state; there is no way to
/// hold a latitude without a longitude.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedLocation {
    pub coords: Option<Coordinates>,
    pub quality: Quality,
    pub source: Source,
}

impl ResolvedLocation {
    pub fn new(coords: Coordinates, quality: Quality, source: Source) -> Self {
        Self {
            coords: Some(coords),
            quality,
            source,
        }
    }

    /// The sentinel cached when every source missed.
    pub fn unresolved() -> Self {
        Self {
            coords: None,
            quality: Quality::Unknown,
            source: Source::NoData,
        }
    }

    pub fn manual(lat: f64, lon: f64) -> Self {
        Self::new(Coordinates::new(lat, lon), Quality::Manual, Source::Manual)
    }

    pub fn is_resolved(&self) -> bool {
        self.coords.is_some()
    }

    pub fn lat(&self) -> Option<f64> {
        self.coords.map(|c| c.lat)
    }

    pub fn lon(&self) -> Option<f64> {
        self.coords.map(|c| c.lon)
    }
}

/// Why a lookup ended without a coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedReason {
    /// Gazetteer and every provider missed.
    Exhausted,
    /// A previous lookup exhausted the chain and cached the sentinel.
    PreviouslyUnresolved,
    /// The batch was cancelled before the chain finished.
    Cancelled,
    /// No provider is configured, so nothing was tried beyond local data.
    Offline,
}

/// Outcome of a single lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved(ResolvedLocation),
    Unresolved {
        reason: UnresolvedReason,
        tried: Vec<String>,
    },
}

impl Resolution {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved(_))
    }

    /// Collapse to a location, using the sentinel for misses.
    pub fn into_location(self) -> ResolvedLocation {
        match self {
            Self::Resolved(loc) => loc,
            Self::Unresolved { .. } => ResolvedLocation::unresolved(),
        }
    }
}

/// Shared cancellation signal for a batch.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Location resolution errors.
#[derive(Debug, Error)]
pub enum LocationError {
    #[error("invalid location input: {0}")]
    InvalidInput(String),
    #[error("cache store failure: {0}")]
    Cache(#[from] std::io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("gazetteer error: {0}")]
    Gazetteer(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
    #[error("batch worker failed: {0}")]
    Worker(String),
}

impl From<csv::Error> for LocationError {
    fn from(err: csv::Error) -> Self {
        Self::Gazetteer(err.to_string())
    }
}

pub type LocationResult<T> = Result<T, LocationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_pair_is_unresolved() {
        assert!(Coordinates::from_parts(Some(52.0), None).is_none());
        assert!(Coordinates::from_parts(None, Some(21.0)).is_none());
        assert!(Coordinates::from_parts(Some(f64::NAN), Some(21.0)).is_none());
        assert_eq!(
            Coordinates::from_parts(Some(52.0), Some(21.0)),
            Some(Coordinates::new(52.0, 21.0))
        );
    }

    #[test]
    fn sentinel_shape() {
        let s = ResolvedLocation::unresolved();
        assert!(!s.is_resolved());
        assert_eq!(s.quality.to_string(), "unknown");
        assert_eq!(s.source.to_string(), "no data");
        assert_eq!(s.lat(), None);
    }

    #[test]
    fn quality_serializes_to_legacy_tags() {
        let json = serde_json::to_string(&Quality::Structured).unwrap();
        assert_eq!(json, "\"PTV API (structured)\"");
        let back: Source = serde_json::from_str("\"no data\"").unwrap();
        assert_eq!(back, Source::NoData);
    }

    #[test]
    fn placeholder_city_is_not_usable() {
        let q = LocationQuery::new("Poland", "00-001", " nan ");
        assert_eq!(q.usable_city(), None);
        let q = LocationQuery::new("Poland", "00-001", " Warszawa ");
        assert_eq!(q.usable_city(), Some("Warszawa"));
    }

    #[test]
    fn cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let other = flag.clone();
        other.cancel();
        assert!(flag.is_cancelled());
    }
}
