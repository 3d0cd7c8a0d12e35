mod bench;
mod error;

use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use sled_feature_store::{
    parse_all_data, parse_item, DataKind, PersistentDataStore, SledDataStore, StoreConfig,
    StoreItem,
};
use tracing_subscriber::EnvFilter;

use crate::error::CliError;

#[derive(Parser, Debug)]
#[command(name = "fstore")]
#[command(version)]
#[command(about = "Load, inspect and benchmark a sled-backed feature store", long_about = None)]
struct Args {
    /// Path to config file
    #[arg(short = 'c', long = "config", default_value = "fstore.toml", global = true)]
    config: String,

    /// Database path, overrides the config file and FSTORE_PATH
    #[arg(long = "db", global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replace the stored dataset with the contents of a JSON document
    Load {
        /// Dataset file: {"features": {...}, "segments": {...}}
        dataset: PathBuf,
    },
    /// Print a single record
    Get {
        /// Data kind (features or segments)
        kind: DataKind,
        key: String,
    },
    /// Print every record of a kind
    List {
        /// Data kind (features or segments)
        kind: DataKind,
    },
    /// Write a record unless a newer version is already stored
    Upsert {
        /// Data kind (features or segments)
        kind: DataKind,
        /// JSON file holding the record
        record: PathBuf,
    },
    /// Store a tombstone for a key
    Delete {
        /// Data kind (features or segments)
        kind: DataKind,
        key: String,
        /// Version of the tombstone, must exceed the stored version
        #[arg(long = "version")]
        version: u64,
    },
    /// Show whether the store is initialized and how many records it holds
    Status,
    /// Time repeated point reads of one key
    Bench {
        /// Data kind (features or segments)
        kind: DataKind,
        key: String,
        /// Number of reads
        #[arg(short = 'n', long = "iterations", default_value_t = 1000, value_parser = clap::value_parser!(u32).range(1..))]
        iterations: u32,
    },
}

fn open_store(config_path: &str, db_arg: Option<PathBuf>) -> Result<SledDataStore, CliError> {
    let mut config = StoreConfig::load(config_path)?;
    config.apply_env_overrides()?;
    if let Some(path) = db_arg {
        config.path = path;
    }
    tracing::debug!(config = config_path, ?config, "resolved store configuration");
    let db = config.open_db()?;
    Ok(SledDataStore::new(db)?.with_flush_on_write(config.flush_on_write))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value).map_err(CliError::Output)?;
    println!("{}", rendered);
    Ok(())
}

fn run_load(store: &SledDataStore, dataset: &Path) -> Result<(), CliError> {
    let content = std::fs::read(dataset)?;
    let all_data = parse_all_data(&content)?;
    let counts: Vec<String> = all_data
        .iter()
        .map(|(kind, items)| format!("{} {}", items.len(), kind))
        .collect();
    store.init(all_data)?;
    println!("Loaded {} from {}", counts.join(", "), dataset.display());
    Ok(())
}

fn run_get(store: &SledDataStore, kind: DataKind, key: &str) -> Result<(), CliError> {
    match store.get(kind, key)? {
        Some(item) => print_json(&item),
        None => {
            eprintln!("{} {:?} not found", kind, key);
            process::exit(1);
        }
    }
}

fn run_list(store: &SledDataStore, kind: DataKind) -> Result<(), CliError> {
    let items: std::collections::BTreeMap<String, StoreItem> =
        store.get_all(kind)?.into_iter().collect();
    print_json(&items)
}

fn run_upsert(store: &SledDataStore, kind: DataKind, item: StoreItem) -> Result<(), CliError> {
    let incoming = item.clone();
    let result = store.upsert(kind, item)?;
    if result == incoming {
        println!("applied version {}", result.version());
    } else {
        println!(
            "rejected version {}: version {} is already stored",
            incoming.version(),
            result.version()
        );
    }
    print_json(&result)
}

fn run_status(store: &SledDataStore) -> Result<(), CliError> {
    println!("initialized: {}", store.is_initialized()?);
    println!("cache ttl:   {:?}", store.cache_ttl());
    for kind in DataKind::ALL {
        let items = store.get_all(kind)?;
        let deleted = items.values().filter(|item| item.is_deleted()).count();
        println!(
            "{:<12} {} records ({} deleted)",
            format!("{}:", kind),
            items.len(),
            deleted
        );
    }
    Ok(())
}

fn run(args: Args) -> Result<(), CliError> {
    let store = open_store(&args.config, args.db)?;
    match args.cmd {
        Command::Load { dataset } => run_load(&store, &dataset),
        Command::Get { kind, key } => run_get(&store, kind, &key),
        Command::List { kind } => run_list(&store, kind),
        Command::Upsert { kind, record } => {
            let content = std::fs::read(&record)?;
            run_upsert(&store, kind, parse_item(kind, &content)?)
        }
        Command::Delete { kind, key, version } => {
            run_upsert(&store, kind, StoreItem::tombstone(kind, &key, version))
        }
        Command::Status => run_status(&store),
        Command::Bench {
            kind,
            key,
            iterations,
        } => Ok(bench::run_bench(&store, kind, &key, iterations)?),
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sled_feature_store::StoreError;
    use std::collections::HashMap;

    #[test]
    fn test_print_json_failure_is_an_output_error() {
        // JSON object keys must be strings
        let value: HashMap<(u8, u8), u8> = HashMap::from([((1, 2), 3)]);
        let err = print_json(&value).unwrap_err();
        assert!(matches!(err, CliError::Output(_)));
        assert!(err.to_string().starts_with("failed to render output"));
    }

    #[test]
    fn test_store_errors_keep_their_message() {
        let err = CliError::from(StoreError::UnknownKind("flags".to_string()));
        assert_eq!(err.to_string(), "unknown data kind: flags");
    }
}
