use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use freight_locator::batch::{collect_locations, read_rows_from_path, resolve_batch, BatchOptions};
use freight_locator::config::LocatorConfig;
use freight_locator::location::{
    CancelFlag, ConsistencyVerifier, LocationQuery, LocationResolver, ProviderChain, Resolution, ResolvedLocation,
};

/// Freight Locator: trusted coordinates for shipment endpoints.
///
/// Resolves (country, postal code, city) triples through the local cache, the
/// gazetteer and external geocoders, and cross-checks postal codes against
/// city names.
///
/// Examples:
///   locator resolve PL 00-001 --city Warszawa
///   locator verify PL 31-000 Gdańsk --apply
///   locator batch shipments.csv --concurrency 8
///   locator cache set --country PL --postal 99-999 --lat 51.1 --lon 19.2
#[derive(Parser)]
#[command(name = "locator", version, about, long_about = None)]
struct Cli {
    /// Offline mode: only use cache and gazetteer data.
    #[arg(long, global = true)]
    offline: bool,

    /// Cache file override (default: ~/.freight-locator/geocache.json).
    #[arg(long, global = true)]
    cache: Option<PathBuf>,

    /// Gazetteer CSV override (default: built-in dataset).
    #[arg(long, global = true)]
    gazetteer: Option<PathBuf>,

    /// Skip pushing the gazetteer into the cache at startup.
    #[arg(long, global = true)]
    no_sync: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve one location.
    Resolve {
        country: String,
        #[arg(default_value = "")]
        postal: String,
        #[arg(long, default_value = "")]
        city: String,
    },
    /// Check that a postal code and a city name describe the same place.
    Verify {
        country: String,
        postal: String,
        city: String,
        /// Mismatch threshold in km.
        #[arg(long)]
        threshold: Option<f64>,
        /// Store the suggested coordinate for the postal code.
        #[arg(long)]
        apply: bool,
    },
    /// Resolve every endpoint of a shipment CSV.
    Batch {
        file: PathBuf,
        #[arg(long)]
        concurrency: Option<usize>,
        #[arg(long)]
        no_verify: bool,
        /// Store verifier corrections in the cache.
        #[arg(long)]
        apply: bool,
    },
    /// Inspect or edit the result cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Push the gazetteer into the cache.
    Sync,
    /// Print the effective configuration.
    Config,
}

#[derive(Subcommand)]
enum CacheAction {
    Dump,
    Clear,
    ClearUnresolved,
    /// Enter a coordinate by hand.
    Set {
        #[arg(long)]
        country: String,
        #[arg(long)]
        postal: String,
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        lon: f64,
    },
}

#[derive(Serialize)]
struct CacheDumpEntry {
    key: String,
    #[serde(flatten)]
    location: ResolvedLocation,
}

fn init_tracing() {
    let default = if cfg!(debug_assertions) {
        "info,freight_locator=debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("Error: {}", message);
    std::process::exit(1);
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => fail(e),
    }
}

fn build_resolver(config: &LocatorConfig, offline: bool) -> LocationResolver {
    let resolver = LocationResolver::from_config(config).unwrap_or_else(|e| fail(e));
    if offline {
        resolver.with_chain(ProviderChain::offline())
    } else {
        resolver
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    let mut config = LocatorConfig::from_env();
    if cli.cache.is_some() {
        config.cache_path = cli.cache.clone();
    }
    if cli.gazetteer.is_some() {
        config.gazetteer_path = cli.gazetteer.clone();
    }
    if cli.no_sync || matches!(cli.command, Command::Sync | Command::Config) {
        config.gazetteer_sync = false;
    }

    match cli.command {
        Command::Resolve { country, postal, city } => {
            let resolver = build_resolver(&config, cli.offline);
            let query = LocationQuery::new(country, postal, city);
            match resolver.lookup(&query, &CancelFlag::new()) {
                Ok(Resolution::Resolved(location)) => print_json(&location),
                Ok(Resolution::Unresolved { reason, tried }) => {
                    print_json(&serde_json::json!({
                        "country": query.country,
                        "postalCode": query.postal_code,
                        "city": query.city,
                        "reason": reason,
                        "triedQueries": tried,
                    }));
                    std::process::exit(2);
                }
                Err(e) => fail(e),
            }
        }

        Command::Verify {
            country,
            postal,
            city,
            threshold,
            apply,
        } => {
            let resolver = build_resolver(&config, cli.offline);
            let verifier = ConsistencyVerifier::new(&resolver, config.thresholds);
            let threshold = threshold.unwrap_or(config.thresholds.mismatch_km);
            let result = verifier.verify_with_threshold(&country, &postal, &city, threshold);
            if apply {
                match resolver.apply_suggestion(&country, &postal, &result) {
                    Ok(Some(stored)) => eprintln!("  Stored correction: {:?}", stored.coords),
                    Ok(None) => {}
                    Err(e) => fail(e),
                }
            }
            print_json(&result);
        }

        Command::Batch {
            file,
            concurrency,
            no_verify,
            apply,
        } => {
            let rows = read_rows_from_path(&file).unwrap_or_else(|e| fail(e));
            let locations = collect_locations(&rows);
            eprintln!("  {} rows, {} distinct locations", rows.len(), locations.len());

            let resolver = Arc::new(build_resolver(&config, cli.offline));
            let options = BatchOptions {
                max_concurrency: concurrency.unwrap_or(config.max_concurrency),
                verify: !no_verify,
                apply_corrections: apply,
                thresholds: config.thresholds,
            };

            let cancel = CancelFlag::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("  Cancelling; cached results are kept.");
                    on_signal.cancel();
                }
            });

            let report = resolve_batch(resolver, locations, &options, cancel)
                .await
                .unwrap_or_else(|e| fail(e));
            print_json(&report);
            if report.needs_manual_input() {
                eprintln!("  {} location(s) need manual coordinates", report.unresolved.len());
                std::process::exit(2);
            }
        }

        Command::Cache { action } => {
            let resolver = build_resolver(&config, true);
            let cache = resolver.cache();
            match action {
                CacheAction::Dump => {
                    let mut entries: Vec<CacheDumpEntry> = cache
                        .entries()
                        .into_iter()
                        .map(|(key, location)| CacheDumpEntry { key, location })
                        .collect();
                    entries.sort_by(|a, b| a.key.cmp(&b.key));
                    print_json(&entries);
                }
                CacheAction::Clear => {
                    let count = cache.len();
                    cache.clear().unwrap_or_else(|e| fail(e));
                    print_json(&serde_json::json!({ "removed": count }));
                }
                CacheAction::ClearUnresolved => {
                    let count = cache.clear_unresolved().unwrap_or_else(|e| fail(e));
                    print_json(&serde_json::json!({ "removed": count }));
                }
                CacheAction::Set {
                    country,
                    postal,
                    lat,
                    lon,
                } => {
                    let stored = resolver
                        .record_manual(&country, &postal, lat, lon)
                        .unwrap_or_else(|e| fail(e));
                    print_json(&stored);
                }
            }
        }

        Command::Sync => {
            let resolver = build_resolver(&config, true);
            let written = resolver
                .gazetteer()
                .sync_into(resolver.cache())
                .unwrap_or_else(|e| fail(e));
            print_json(&serde_json::json!({
                "gazetteerEntries": resolver.gazetteer().len(),
                "written": written,
            }));
        }

        Command::Config => print_json(&config.public_profile()),
    }
}
