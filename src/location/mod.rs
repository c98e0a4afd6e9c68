//! Location resolution and verification.
//!
//! Turns a (country, postal code, optional city) triple into a trusted
//! coordinate using the result cache, a static gazetteer and an ordered
//! chain of external geocoders, and cross-checks postal codes against city
//! names.

pub mod cache;
pub mod gazetteer;
pub mod nominatim;
pub mod normalize;
pub mod providers;
pub mod ptv;
pub mod resolver;
pub mod scoring;
pub mod types;
pub mod verify;

pub use cache::{CacheStore, JsonFileCache, MemoryCache};
pub use gazetteer::Gazetteer;
pub use providers::{GeocodingProvider, ProviderChain, ProviderKind};
pub use resolver::LocationResolver;
pub use types::{
    CancelFlag, Coordinates, LocationError, LocationQuery, LocationResult, Quality, Resolution, ResolvedLocation,
    Source, UnresolvedReason,
};
pub use verify::{ConsistencyVerifier, VerificationResult};
