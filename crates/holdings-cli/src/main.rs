//! holdings - load quarterly holdings filings into partitioned PostgreSQL
//!
//! # Usage
//!
//! ```bash
//! # Load an extract, creating missing quarter partitions
//! holdings -c holdings.yaml load --input extract/holdings.csv
//!
//! # Only some periods
//! holdings load --input extract/holdings.csv --period 2024Q1 --period 2024Q2
//!
//! # Show the partitions a file would need, without touching the database
//! holdings plan --input extract/holdings.csv
//!
//! # Create partitions ahead of time
//! holdings ensure --period 2025Q1
//!
//! # Validate configuration
//! holdings -c holdings.yaml validate
//! ```
//!
//! Without a config file the database settings come from `DB_HOST`,
//! `DB_PORT`, `DB_NAME`, `DB_USER` and `DB_PASSWORD`.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use holdings_load::prelude::*;

const DEFAULT_CONFIG: &str = "holdings.yaml";

#[derive(Parser)]
#[command(name = "holdings")]
#[command(version, about = "Partitioned bulk loader for quarterly holdings filings")]
struct Cli {
    /// Path to configuration file [default: holdings.yaml, falls back to DB_* env vars]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read records and load them
    Load {
        /// Input file (.csv, .jsonl); defaults to the configured source
        #[arg(short, long)]
        input: Option<PathBuf>,
        /// Only load these periods (e.g. 2024Q1); defaults to the configured periods
        #[arg(long = "period")]
        periods: Vec<PartitionKey>,
        /// Concurrent transfers, overriding the config
        #[arg(long)]
        concurrency: Option<usize>,
        /// Keep `value_per_share` as read instead of deriving missing values
        #[arg(long)]
        no_derive: bool,
        /// Give up after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Print the partitions an input needs, without connecting
    Plan {
        /// Input file (.csv, .jsonl); defaults to the configured source
        #[arg(short, long)]
        input: Option<PathBuf>,
    },
    /// Create the parent table and partitions only
    Ensure {
        /// Periods to create (e.g. 2024Q1); defaults to the configured periods
        #[arg(long = "period")]
        periods: Vec<PartitionKey>,
    },
    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;

    let mut logging = config.logging.clone();
    if cli.verbose {
        logging.level = "debug".to_string();
    }
    if cli.json_logs {
        logging.format = LogFormat::Json;
    }
    let _guard = init_logging(&logging).context("Failed to initialize logging")?;

    match cli.command {
        Commands::Load {
            input,
            periods,
            concurrency,
            no_derive,
            timeout_secs,
        } => {
            let options = LoadOptions {
                input,
                periods,
                concurrency,
                derive: !no_derive,
                timeout: timeout_secs.map(Duration::from_secs),
            };
            run_load(config, options).await
        }
        Commands::Plan { input } => plan(config, input),
        Commands::Ensure { periods } => ensure(config, periods).await,
        Commands::Validate => validate_config(&config),
    }
}

fn load_config(path: Option<&Path>) -> Result<LoaderConfig> {
    match path {
        Some(path) => LoaderConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None if Path::new(DEFAULT_CONFIG).exists() => LoaderConfig::from_file(DEFAULT_CONFIG)
            .with_context(|| format!("Failed to load config from {}", DEFAULT_CONFIG)),
        None => LoaderConfig::from_env().context("Failed to read DB_* environment"),
    }
}

struct LoadOptions {
    input: Option<PathBuf>,
    periods: Vec<PartitionKey>,
    concurrency: Option<usize>,
    derive: bool,
    timeout: Option<Duration>,
}

fn source_for(config: &LoaderConfig, input: Option<PathBuf>) -> Result<SourceConfig> {
    match (input, &config.source) {
        (Some(path), _) => Ok(SourceConfig::from_path(path)),
        (None, Some(source)) => Ok(source.clone()),
        (None, None) => bail!("no input: pass --input or configure a source"),
    }
}

fn periods_for(config: &LoaderConfig, requested: Vec<PartitionKey>) -> Vec<PartitionKey> {
    if requested.is_empty() {
        config.periods.clone()
    } else {
        requested
    }
}

fn extract(source: &SourceConfig, periods: &[PartitionKey]) -> Result<Batch> {
    let mut reader = source.open()?;
    reader
        .extract(periods)
        .with_context(|| format!("Failed to read {}", source.path().display()))
}

async fn run_load(config: LoaderConfig, options: LoadOptions) -> Result<()> {
    let source = source_for(&config, options.input)?;
    let periods = periods_for(&config, options.periods);

    let mut batch = extract(&source, &periods)?;
    if batch.is_empty() {
        warn!(path = %source.path().display(), "no records to load");
    }
    if options.derive {
        batch.iter_mut().for_each(HoldingRecord::derive_value_per_share);
    }

    let mut loader = config.orchestrator(Arc::new(PgConnectionFactory))?;
    if let Some(n) = options.concurrency {
        loader = loader.with_max_concurrency(n);
    }

    info!(
        table = %loader.table(),
        records = batch.len(),
        concurrency = loader.max_concurrency(),
        "starting load"
    );

    let report = match options.timeout {
        Some(limit) => tokio::time::timeout(limit, loader.load(batch))
            .await
            .with_context(|| format!("Load did not finish within {}s", limit.as_secs()))?,
        None => loader.load(batch).await,
    }
    .context("Load failed")?;

    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.is_complete() {
        bail!(
            "{} of {} partitions were not loaded: {:?}",
            report.failed_keys().len(),
            report.outcomes.len(),
            report
                .failed_keys()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
        );
    }
    Ok(())
}

fn plan(config: LoaderConfig, input: Option<PathBuf>) -> Result<()> {
    let source = source_for(&config, input)?;
    let batch = extract(&source, &config.periods)?;
    let table = config.target.table()?;

    let groups = PartitionRouter::new().route(batch)?;

    println!("Target: {}", table);
    if groups.is_empty() {
        println!("  (no records)");
        return Ok(());
    }
    for (key, rows) in &groups {
        let spec = table.partition_for(*key);
        println!(
            "  {}  {:<24} [{}, {})  {} rows",
            key,
            spec.name,
            spec.start,
            spec.end,
            rows.len()
        );
    }
    Ok(())
}

async fn ensure(config: LoaderConfig, requested: Vec<PartitionKey>) -> Result<()> {
    let periods = periods_for(&config, requested);
    if periods.is_empty() {
        bail!("no periods: pass --period or configure periods");
    }
    let keys: BTreeSet<PartitionKey> = periods.into_iter().collect();

    let loader = config.orchestrator(Arc::new(PgConnectionFactory))?;
    let report = loader
        .ensure_schema(&keys)
        .await
        .context("Failed to ensure partitions")?;

    for key in &report.created {
        println!("  created   {}", key.partition_name(&loader.table().name));
    }
    for key in &report.existing {
        println!("  existing  {}", key.partition_name(&loader.table().name));
    }
    for (key, reason) in &report.failed {
        println!("  failed    {}: {}", key.partition_name(&loader.table().name), reason);
    }

    if !report.is_complete() {
        bail!("{} partitions could not be created", report.failed.len());
    }
    Ok(())
}

fn validate_config(config: &LoaderConfig) -> Result<()> {
    config.check()?;
    let connection = config.database.connection_config()?;
    let table = config.target.table()?;

    println!("✓ Configuration valid!\n");

    println!("Database:");
    println!("  URL: {}", connection.redacted_url());
    println!("  Connect timeout: {}ms", connection.connect_timeout_ms);
    println!();

    println!("Target:");
    println!("  Table: {}", table);
    println!("  Max concurrency: {}", config.load.max_concurrency);
    if config.periods.is_empty() {
        println!("  Periods: (all)");
    } else {
        let periods: Vec<String> = config.periods.iter().map(ToString::to_string).collect();
        println!("  Periods: {}", periods.join(", "));
    }
    println!();

    match &config.source {
        Some(source) => println!("Source: {}", source.path().display()),
        None => println!("Source: (none, pass --input)"),
    }
    match &config.logging.directory {
        Some(dir) => println!(
            "Logs: {} (keeping {})",
            dir.display(),
            config.logging.max_files
        ),
        None => println!("Logs: console only"),
    }
    Ok(())
}
