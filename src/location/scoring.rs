//! Reliability scoring for arbitrating between two coordinates.

use super::types::{Quality, Source};

const BASE_SCORE: i32 = 50;

fn quality_bonus(quality: Quality) -> i32 {
    match quality {
        Quality::Lookup | Quality::Manual => 30,
        Quality::LookupPartial => 20,
        Quality::Structured | Quality::FreeText => 15,
        Quality::OpenData => 5,
        Quality::Unknown => 0,
    }
}

fn source_bonus(source: Source) -> i32 {
    match source {
        Source::Gazetteer | Source::Sync | Source::Manual => 20,
        Source::StructuredApi | Source::FreeTextApi => 15,
        Source::Nominatim => 5,
        Source::Verification | Source::NoData => 0,
    }
}

/// Trust score in `[0, 100]` for a (quality, source) pair.
///
/// Only compares two independently obtained coordinates; a low score never
/// rejects a coordinate on its own.
pub fn score(quality: Quality, source: Source) -> u8 {
    (BASE_SCORE + quality_bonus(quality) + source_bonus(source)).clamp(0, 100) as u8
}
