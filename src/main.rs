//! pipeguard CLI - recovery tooling for checkpointed pipelines.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pipeguard::{
    validate_pipeline_name, CheckpointFilter, CheckpointRecord, CheckpointScope, CheckpointStatus,
    CheckpointStore, Config, LocalObjectStore, TransactionManager,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "pipeguard")]
#[command(version)]
#[command(about = "Inspect and repair pipeline checkpoints and staged writes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "pipeguard.toml")]
    config: PathBuf,

    /// Pipeline name, overrides `pipeline.name`
    #[arg(short, long, global = true)]
    pipeline: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List failed or unfinished checkpoints
    ListFailed {
        #[arg(long)]
        scope: Option<CheckpointScope>,
    },

    /// List completed checkpoints, most recent first
    ListCompleted {
        #[arg(long)]
        scope: Option<CheckpointScope>,

        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Clear one checkpoint so the next run reprocesses it
    Retry {
        #[arg(long)]
        scope: CheckpointScope,

        #[arg(long)]
        key: String,
    },

    /// Clear checkpoints matching the filters
    Clear {
        #[arg(long)]
        scope: Option<CheckpointScope>,

        #[arg(long)]
        key: Option<String>,

        #[arg(long)]
        status: Option<CheckpointStatus>,

        /// Required to clear every checkpoint of the pipeline
        #[arg(long)]
        all: bool,
    },

    /// Show checkpoint counts by status and scope
    Stats {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Re-hash source files of completed checkpoints
    Verify {
        #[arg(long, default_value = "file")]
        scope: CheckpointScope,

        #[arg(long)]
        key: Option<String>,

        #[arg(long, default_value = "100")]
        limit: usize,
    },

    /// Delete staged objects left behind by crashed transactions
    SweepStaging,

    /// Validate configuration file
    Validate,

    /// Show example configuration
    Example,
}

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set subscriber")
}

fn print_example_config() {
    let example = r#"# pipeguard configuration file

[pipeline]
name = "ingest"
# ${VAR} placeholders are expanded
checkpoint_dir = ".checkpoints"

[retry]
max_attempts = 3
initial_delay_secs = 1.0
max_delay_secs = 60.0
exponential_base = 2.0
jitter = true

[circuit_breaker]
failure_threshold = 5
timeout_secs = 60

[transaction]
staging_prefix = "staging"
# Delete newly created targets again when a commit fails part way
compensate_partial_commit = true
# sweep-staging only removes staging of transactions older than this
orphan_min_age_secs = 86400

[storage]
root = "data/objects"
"#;
    println!("{example}");
}

/// Load the config file, or defaults when the default path does not exist.
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = if cli.config.exists() {
        Config::from_file(&cli.config)
            .with_context(|| format!("Failed to load config from {:?}", cli.config))?
    } else {
        warn!(path = %cli.config.display(), "Config file not found, using defaults");
        Config::default()
    };

    if let Some(name) = &cli.pipeline {
        validate_pipeline_name(name)?;
        config.pipeline.name = name.clone();
    }
    Ok(config)
}

fn open_store(config: &Config) -> Result<CheckpointStore> {
    CheckpointStore::open(&config.pipeline.name, &config.checkpoint_dir())
        .context("Failed to open checkpoint store")
}

fn print_record(record: &CheckpointRecord) {
    println!("{}:{}", record.scope, record.key);
    println!("  Status:    {}", record.status);
    println!("  File:      {}", record.file_path.as_deref().unwrap_or("N/A"));
    println!("  Checksum:  {}", record.checksum.as_deref().unwrap_or("N/A"));
    if let Some(error) = &record.error_message {
        println!("  Error:     {error}");
    }
    if let Some(completed) = record.completed_at {
        println!("  Completed: {}", completed.to_rfc3339());
    }
    println!("  Created:   {}", record.created_at.to_rfc3339());
    println!("  Updated:   {}", record.updated_at.to_rfc3339());
    println!();
}

fn filter_for(scope: Option<CheckpointScope>) -> CheckpointFilter {
    CheckpointFilter {
        scope,
        ..Default::default()
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    match &cli.command {
        Commands::Example => {
            print_example_config();
        }

        Commands::Validate => {
            let config = Config::from_file(&cli.config)
                .with_context(|| format!("Failed to load config from {:?}", cli.config))?;

            info!("Configuration is valid");
            info!("  Pipeline: {}", config.pipeline.name);
            info!("  Checkpoints: {}", config.checkpoint_dir().display());
            info!(
                "  Retry: {} attempts, {}s initial, {}s max",
                config.retry.max_attempts,
                config.retry.initial_delay_secs,
                config.retry.max_delay_secs
            );
            info!(
                "  Circuit breaker: {} failures, {}s timeout",
                config.circuit_breaker.failure_threshold, config.circuit_breaker.timeout_secs
            );
            info!("  Staging prefix: {}", config.transaction.staging_prefix);
        }

        Commands::ListFailed { scope } => {
            let config = load_config(&cli)?;
            let store = open_store(&config)?;
            let pending = store.get_pending(&filter_for(*scope))?;

            if pending.is_empty() {
                info!("No failed or pending checkpoints");
                return Ok(());
            }
            println!("\n=== {} failed/pending checkpoint(s) ===\n", pending.len());
            pending.iter().for_each(print_record);
        }

        Commands::ListCompleted { scope, limit } => {
            let config = load_config(&cli)?;
            let store = open_store(&config)?;
            let completed = store.get_completed(&filter_for(*scope))?;

            if completed.is_empty() {
                info!("No completed checkpoints");
                return Ok(());
            }
            let shown = completed.len().min(*limit);
            println!("\n=== {shown} most recent completed checkpoint(s) ===\n");
            completed.iter().take(*limit).for_each(print_record);
        }

        Commands::Retry { scope, key } => {
            let config = load_config(&cli)?;
            let store = open_store(&config)?;

            let Some(status) = store.get_status(*scope, key)? else {
                warn!(%scope, key = %key, "No checkpoint found");
                return Ok(());
            };
            info!(%scope, key = %key, %status, "Current status");
            store.clear_checkpoint(*scope, key)?;
            info!("Checkpoint cleared, run the pipeline again to retry this operation");
        }

        Commands::Clear {
            scope,
            key,
            status,
            all,
        } => {
            let config = load_config(&cli)?;
            let store = open_store(&config)?;
            let filter = CheckpointFilter {
                scope: *scope,
                key: key.clone(),
                status: *status,
            };

            if filter.is_empty() && !all {
                bail!(
                    "Refusing to clear every checkpoint of '{}' without --all",
                    config.pipeline.name
                );
            }
            let count = store.clear_all_checkpoints(&filter)?;
            info!(count, "Cleared checkpoints");
        }

        Commands::Stats { json } => {
            let config = load_config(&cli)?;
            let store = open_store(&config)?;
            let stats = store.get_statistics()?;

            if *json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
                return Ok(());
            }

            println!("\nPipeline: {}\n", stats.pipeline_name);
            if stats.total == 0 {
                println!("No checkpoints found");
                return Ok(());
            }
            for (status, summary) in &stats.by_status {
                println!("{}:", status.as_str().to_uppercase());
                println!("  Count:         {}", summary.count);
                println!("  First created: {}", summary.first_created.to_rfc3339());
                println!("  Last updated:  {}", summary.last_updated.to_rfc3339());
            }
            println!("\nBy scope:");
            for (scope, count) in &stats.by_scope {
                println!("  {scope:<10} {count}");
            }
            println!("\nTotal: {}", stats.total);
        }

        Commands::Verify { scope, key, limit } => {
            let config = load_config(&cli)?;
            let store = open_store(&config)?;
            let mut filter = filter_for(Some(*scope));
            filter.key = key.clone();

            let completed: Vec<_> = store
                .get_completed(&filter)?
                .into_iter()
                .take(*limit)
                .collect();
            if completed.is_empty() {
                info!("No completed checkpoints to verify");
                return Ok(());
            }

            let mut mismatches = Vec::new();
            for (i, record) in completed.iter().enumerate() {
                let Some(file_path) = &record.file_path else {
                    continue;
                };
                let path = Path::new(file_path);
                let ok = store.is_completed(record.scope, &record.key, Some(path), true)?;
                println!(
                    "[{}/{}] {file_path} ... {}",
                    i + 1,
                    completed.len(),
                    if ok { "OK" } else { "MISMATCH" }
                );
                if !ok {
                    mismatches.push(file_path.clone());
                }
            }

            if mismatches.is_empty() {
                info!("All checksums verified");
            } else {
                warn!(count = mismatches.len(), "Checksum mismatches found");
                for path in &mismatches {
                    warn!("  - {path}");
                }
                info!("Clear their checkpoints and run the pipeline again to reprocess them");
            }
        }

        Commands::SweepStaging => {
            let config = load_config(&cli)?;
            let store = LocalObjectStore::new(config.storage_root())
                .context("Failed to open object store")?;
            let manager = TransactionManager::new(Arc::new(store), config.transaction.clone());

            let removed = manager.cleanup_orphaned_staging()?;
            info!(
                removed,
                min_age_secs = config.transaction.orphan_min_age_secs,
                "Staging sweep finished"
            );
        }
    }

    Ok(())
}
