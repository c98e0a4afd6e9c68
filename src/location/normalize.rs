//! Key normalization: canonical country names, postal codes, cache keys,
//! and the ordered query variants handed to text-based providers.

use super::types::LocationQuery;

/// Values that spreadsheets and dataframes emit for an empty cell.
const NULL_SENTINELS: &[&str] = &["nan", "none", "null"];

struct CountryEntry {
    iso: &'static str,
    name: &'static str,
    aliases: &'static [&'static str],
}

const COUNTRIES: &[CountryEntry] = &[
    CountryEntry { iso: "PL", name: "Poland", aliases: &["polska", "pologne", "polen"] },
    CountryEntry { iso: "DE", name: "Germany", aliases: &["deutschland", "niemcy", "allemagne"] },
    CountryEntry { iso: "CZ", name: "Czech Republic", aliases: &["czechia", "czechy", "česko", "cesko", "tschechien"] },
    CountryEntry { iso: "SK", name: "Slovakia", aliases: &["słowacja", "slowacja", "slovensko", "slowakei"] },
    CountryEntry { iso: "AT", name: "Austria", aliases: &["austria", "österreich", "osterreich"] },
    CountryEntry { iso: "CH", name: "Switzerland", aliases: &["szwajcaria", "schweiz", "suisse", "svizzera"] },
    CountryEntry { iso: "FR", name: "France", aliases: &["francja", "frankreich"] },
    CountryEntry { iso: "BE", name: "Belgium", aliases: &["belgia", "belgique", "belgië", "belgien"] },
    CountryEntry { iso: "NL", name: "Netherlands", aliases: &["holandia", "nederland", "niederlande", "holland", "the netherlands"] },
    CountryEntry { iso: "LU", name: "Luxembourg", aliases: &["luksemburg", "luxemburg"] },
    CountryEntry { iso: "IT", name: "Italy", aliases: &["włochy", "wlochy", "italia", "italien"] },
    CountryEntry { iso: "ES", name: "Spain", aliases: &["hiszpania", "españa", "espana", "spanien"] },
    CountryEntry { iso: "PT", name: "Portugal", aliases: &["portugalia"] },
    CountryEntry { iso: "GB", name: "United Kingdom", aliases: &["uk", "wielka brytania", "great britain", "england", "großbritannien"] },
    CountryEntry { iso: "IE", name: "Ireland", aliases: &["irlandia", "éire", "eire"] },
    CountryEntry { iso: "DK", name: "Denmark", aliases: &["dania", "danmark", "dänemark"] },
    CountryEntry { iso: "SE", name: "Sweden", aliases: &["szwecja", "sverige", "schweden"] },
    CountryEntry { iso: "NO", name: "Norway", aliases: &["norwegia", "norge", "norwegen"] },
    CountryEntry { iso: "FI", name: "Finland", aliases: &["finlandia", "suomi", "finnland"] },
    CountryEntry { iso: "LT", name: "Lithuania", aliases: &["litwa", "lietuva", "litauen"] },
    CountryEntry { iso: "LV", name: "Latvia", aliases: &["łotwa", "lotwa", "latvija", "lettland"] },
    CountryEntry { iso: "EE", name: "Estonia", aliases: &["eesti", "estland"] },
    CountryEntry { iso: "HU", name: "Hungary", aliases: &["węgry", "wegry", "magyarország", "ungarn"] },
    CountryEntry { iso: "RO", name: "Romania", aliases: &["rumunia", "românia", "rumänien"] },
    CountryEntry { iso: "BG", name: "Bulgaria", aliases: &["bułgaria", "bulgarien", "българия"] },
    CountryEntry { iso: "SI", name: "Slovenia", aliases: &["słowenia", "slowenia", "slovenija", "slowenien"] },
    CountryEntry { iso: "HR", name: "Croatia", aliases: &["chorwacja", "hrvatska", "kroatien"] },
    CountryEntry { iso: "RS", name: "Serbia", aliases: &["serbia", "srbija", "serbien"] },
    CountryEntry { iso: "GR", name: "Greece", aliases: &["grecja", "ελλάδα", "griechenland"] },
    CountryEntry { iso: "UA", name: "Ukraine", aliases: &["ukraina", "україна"] },
    CountryEntry { iso: "BY", name: "Belarus", aliases: &["białoruś", "bialorus", "weißrussland"] },
    CountryEntry { iso: "TR", name: "Turkey", aliases: &["turcja", "türkiye", "turkiye", "türkei"] },
];

fn find_country(raw: &str) -> Option<&'static CountryEntry> {
    let needle = raw.trim().to_lowercase();
    if needle.is_empty() {
        return None;
    }
    COUNTRIES.iter().find(|c| {
        c.iso.eq_ignore_ascii_case(&needle)
            || c.name.to_lowercase() == needle
            || c.aliases.contains(&needle.as_str())
    })
}

/// Map ISO codes and localized spellings to one canonical English name.
/// Unknown inputs pass through (trimmed) without error.
pub fn normalize_country(raw: &str) -> String {
    match find_country(raw) {
        Some(entry) => entry.name.to_string(),
        None => raw.trim().to_string(),
    }
}

/// ISO 3166-1 alpha-2 code for any spelling the dictionary knows.
pub fn country_code(raw: &str) -> Option<&'static str> {
    find_country(raw).map(|c| c.iso)
}

/// Trim and uppercase a postal code; spreadsheet floats such as `"50.0"`
/// lose their fractional suffix.
pub fn normalize_postal(raw: &str) -> String {
    let trimmed = raw.trim();
    let cleaned = match trimmed.strip_suffix(".0") {
        Some(head) if !head.is_empty() && head.chars().all(|c| c.is_ascii_digit()) => head,
        _ => trimmed,
    };
    if NULL_SENTINELS.contains(&cleaned.to_lowercase().as_str()) {
        return String::new();
    }
    cleaned.to_uppercase()
}

/// A city is usable only when non-empty after trimming and not a null-like sentinel.
pub fn is_usable_city(raw: &str) -> bool {
    let city = raw.trim();
    !city.is_empty() && !NULL_SENTINELS.contains(&city.to_lowercase().as_str())
}

pub fn normalize_city(raw: &str) -> String {
    if is_usable_city(raw) {
        raw.split_whitespace().collect::<Vec<_>>().join(" ")
    } else {
        String::new()
    }
}

/// `"{country}_{postal}"`.
pub fn build_key(country: &str, postal: &str) -> String {
    format!("{}_{}", country, postal)
}

/// `"{country}_{city}"`, used for city-only lookups.
pub fn city_key(country: &str, city: &str) -> String {
    format!("{}_{}", country, city.trim().to_lowercase())
}

/// `"{country}_{postal}_{city}"`.
pub fn variant_key(country: &str, postal: &str, city: &str) -> String {
    format!("{}_{}_{}", country, postal, city.trim().to_lowercase())
}

pub fn is_short_postal(postal: &str) -> bool {
    postal.chars().count() == 2
}

/// Fully normalized form of a query: canonical country, cleaned postal and city.
pub fn normalize_query(query: &LocationQuery) -> LocationQuery {
    LocationQuery {
        country: normalize_country(&query.country),
        postal_code: normalize_postal(&query.postal_code),
        city: normalize_city(&query.city),
    }
}

/// Primary cache identity. City-only queries key on the city instead.
pub fn canonical_key(query: &LocationQuery) -> String {
    let q = normalize_query(query);
    if q.postal_code.is_empty() {
        city_key(&q.country, &q.city)
    } else {
        build_key(&q.country, &q.postal_code)
    }
}

/// One phrasing of a location for a text-based provider, with the cache key
/// a hit under this phrasing is stored at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryVariant {
    pub text: String,
    pub key: String,
    pub uses_postal: bool,
    pub uses_city: bool,
}

/// Ordered phrasings for text-based providers.
///
/// Two-character postal codes are region prefixes, so country+postal goes
/// first. Longer codes are specific enough to lead with the full triple.
pub fn generate_query_variants(country: &str, postal: &str, city: &str) -> Vec<QueryVariant> {
    let country = normalize_country(country);
    let postal = normalize_postal(postal);
    let city = normalize_city(city);
    let has_city = !city.is_empty();

    let canonical = build_key(&country, &postal);
    let with_city = variant_key(&country, &postal, &city);
    let city_only = city_key(&country, &city);

    let mut variants: Vec<QueryVariant> = Vec::new();
    let mut push = |text: String, key: &str, uses_postal: bool, uses_city: bool| {
        if !variants.iter().any(|v| v.text == text) {
            variants.push(QueryVariant {
                text,
                key: key.to_string(),
                uses_postal,
                uses_city,
            });
        }
    };

    if postal.is_empty() {
        if has_city {
            push(format!("{}, {}", city, country), &city_only, false, true);
        }
        return variants;
    }

    if is_short_postal(&postal) {
        push(format!("{} {}", country, postal), &canonical, true, false);
        if has_city {
            push(format!("{} {}", postal, city), &with_city, true, true);
        }
        return variants;
    }

    if has_city {
        push(format!("{} {} {}", country, postal, city), &with_city, true, true);
        push(format!("{} {} {}", city, postal, country), &with_city, true, true);
        push(format!("{}, {} {}", city, country, postal), &with_city, true, true);
        push(format!("{}, {}", city, country), &city_only, false, true);
    }
    push(format!("{} {}", postal, country), &canonical, true, false);
    variants
}
