use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;

use photostash::backup::{BackupTracker, S3ObjectStore};
use photostash::config::{Config, ExtractorKind};
use photostash::db::Database;
use photostash::export::{self, ExportFormat};
use photostash::indexer::{self, asset_from_metadata, IndexOptions, Indexer, MetadataExtractor};
use photostash::ingest::{IngestOptions, IngestOutcome, Ingestor};
use photostash::{logging, placement};

#[derive(Parser)]
#[command(name = "photostash")]
#[command(version, about = "Ingest, index and back up a home photo library", long_about = None)]
struct Cli {
    /// Path to config file (default: $XDG_CONFIG_HOME/photostash/config.toml)
    #[arg(long, short, global = true, env = "PHOTOSTASH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy new photos from removable media into the corpus
    Ingest {
        /// Ingest from this directory instead of detecting a mounted card
        #[arg(long)]
        source: Option<PathBuf>,

        /// Leave the source mounted
        #[arg(long)]
        no_eject: bool,

        /// Date folder for files whose name carries no date (YYYY-MM-DD, default today)
        #[arg(long)]
        date: Option<NaiveDate>,
    },

    /// Extract metadata for new or incomplete images into the index
    Index {
        /// Stop after this many files (0 = no limit)
        #[arg(long)]
        limit: Option<usize>,

        /// Files per batch
        #[arg(long)]
        batch_size: Option<usize>,

        /// Scan these roots instead of the configured tiers
        #[arg(long = "root")]
        roots: Vec<PathBuf>,
    },

    /// Upload, verify and reconcile the S3 backup
    Backup {
        /// Log what would be uploaded or tombstoned without writing anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Show which tier would receive the next ingestion
    Tier,

    /// Summarize the index and backup state
    Status,

    /// Export the deletion audit trail
    Audit {
        #[arg(long, value_enum, default_value = "csv")]
        format: ExportFormat,

        /// Output file or directory (default: stdout)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Print the metadata extracted from one file
    Inspect {
        file: PathBuf,

        /// Use exiftool regardless of the configured extractor
        #[arg(long)]
        exiftool: bool,
    },

    /// Full-text search over indexed metadata
    Search {
        query: String,

        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

fn open_database(config: &Config) -> Result<Database> {
    let db = Database::open(&config.database)?;
    db.initialize()?;
    Ok(db)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Journald on Linux, file fallback otherwise; echoed to stderr either way.
    logging::init(None, true)?;

    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Ingest {
            source,
            no_eject,
            date,
        } => run_ingest(&config, source, no_eject, date),
        Commands::Index {
            limit,
            batch_size,
            roots,
        } => {
            if let Some(limit) = limit {
                config.indexer.limit = limit;
            }
            if let Some(batch_size) = batch_size {
                config.indexer.batch_size = batch_size;
            }
            run_index(&config, roots)
        }
        Commands::Backup { dry_run } => run_backup(&config, dry_run),
        Commands::Tier => run_tier(&config),
        Commands::Status => run_status(&config),
        Commands::Audit { format, output } => run_audit(&config, format, output),
        Commands::Inspect { file, exiftool } => {
            if exiftool {
                config.indexer.extractor = ExtractorKind::Exiftool;
            }
            run_inspect(&config, &file)
        }
        Commands::Search { query, limit } => run_search(&config, &query, limit),
    }
}

fn run_ingest(
    config: &Config,
    source: Option<PathBuf>,
    no_eject: bool,
    date: Option<NaiveDate>,
) -> Result<()> {
    let options = IngestOptions {
        source,
        no_eject,
        fallback_date: date,
    };

    match Ingestor::new(config).run(&options)? {
        IngestOutcome::Completed(summary) => {
            println!(
                "Copied {} file(s), skipped {} duplicate(s), {} failure(s)",
                summary.copied,
                summary.skipped,
                summary.failed.len()
            );
            if let (Some(tier), Some(destination)) = (summary.tier, &summary.destination) {
                println!("Destination: {} ({})", destination.display(), tier);
            }
            for (path, error) in &summary.failed {
                println!("  failed: {}: {}", path.display(), error);
            }
            if summary.ejected {
                println!("Source media ejected");
            }
        }
        IngestOutcome::LockHeld { pid } => match pid {
            Some(pid) => println!("Another ingestion (pid {pid}) is running; nothing to do"),
            None => println!("Another ingestion is running; nothing to do"),
        },
        IngestOutcome::NoSource => println!("No source media found"),
    }
    Ok(())
}

fn run_index(config: &Config, roots: Vec<PathBuf>) -> Result<()> {
    let db = open_database(config)?;
    let extractor = indexer::extractor_for(config);
    let roots = if roots.is_empty() {
        config.storage.tier_roots()
    } else {
        roots
    };

    let summary = Indexer::new(&db, extractor.as_ref(), &config.scanner)
        .run(&roots, IndexOptions::from_config(config))?;

    println!(
        "Seen {}, already complete {}, inserted {}, updated {}, unchanged {}, failed {}",
        summary.seen,
        summary.complete,
        summary.inserted,
        summary.updated,
        summary.unchanged,
        summary.failed
    );
    Ok(())
}

fn run_backup(config: &Config, dry_run: bool) -> Result<()> {
    let db = open_database(config)?;
    let store = S3ObjectStore::from_config(&config.backup)?;

    let summary = BackupTracker::new(&db, &store, config)
        .dry_run(dry_run)
        .run()?;

    let prefix = if dry_run { "[dry run] " } else { "" };
    println!(
        "{prefix}Uploaded {}, skipped {}, errors {}, verified {}, demoted {}, tombstoned {}",
        summary.uploaded,
        summary.skipped,
        summary.erred,
        summary.verified,
        summary.demoted,
        summary.tombstoned
    );
    if summary.tombstone_failed > 0 {
        println!("{} tombstone(s) rolled back, will retry", summary.tombstone_failed);
    }
    Ok(())
}

fn run_tier(config: &Config) -> Result<()> {
    let storage = &config.storage;
    let free = placement::available_space(&storage.primary_root);
    println!(
        "Primary {}: {} free (threshold {})",
        storage.primary_root.display(),
        free.map(format_size).unwrap_or_else(|| "unknown".to_string()),
        format_size(storage.min_free_bytes)
    );

    match placement::resolve_destination_root(storage) {
        Ok((tier, root)) => println!("Next ingestion goes to {} ({})", tier, root.display()),
        Err(e) => println!("{e}"),
    }
    Ok(())
}

fn run_status(config: &Config) -> Result<()> {
    let db = open_database(config)?;

    println!("Indexed assets: {}", db.count_assets()?);
    for (status, count) in db.backup_status_counts()? {
        println!("Backups {status}: {count}");
    }
    println!("Tombstoned backups: {}", db.count_deleted_backups()?);
    println!(
        "Next ingestion tier: {}",
        placement::choose_tier(&config.storage.primary_root, config.storage.min_free_bytes)
    );
    Ok(())
}

fn run_audit(config: &Config, format: ExportFormat, output: Option<PathBuf>) -> Result<()> {
    let db = open_database(config)?;
    let output = output.map(|path| export::resolve_output_path(&path, format));
    let count = export::export_deleted_backups(&db, output.as_deref(), format)?;
    if let Some(path) = &output {
        info!(count, format = format.name(), path = %path.display(), "audit trail exported");
        eprintln!("Exported {count} record(s) to {}", path.display());
    }
    Ok(())
}

fn run_inspect(config: &Config, file: &Path) -> Result<()> {
    let extractor = indexer::extractor_for(config);
    let raw = extractor
        .extract(file)
        .with_context(|| format!("Failed to extract metadata from {}", file.display()))?;
    let record = asset_from_metadata(&file.to_string_lossy(), &raw);

    let show = |label: &str, value: Option<String>| {
        println!("{:<14} {}", label, value.unwrap_or_else(|| "-".to_string()));
    };
    show("File:", Some(record.file_path.clone()));
    show("Date taken:", record.date_taken.clone());
    show("Camera make:", record.camera_make.clone());
    show("Camera model:", record.camera_model.clone());
    show("Lens:", record.lens.clone());
    show("Shutter:", record.shutter_speed.clone());
    show("ISO:", record.iso.map(|v| v.to_string()));
    show("Aperture:", record.aperture.map(|v| format!("f/{v}")));
    show("Focal length:", record.focal_length.map(|v| format!("{v} mm")));

    println!();
    println!("All fields ({}):", raw.len());
    println!("{}", serde_json::to_string_pretty(&raw)?);
    Ok(())
}

fn run_search(config: &Config, query: &str, limit: usize) -> Result<()> {
    let db = open_database(config)?;
    let results = db.search_assets(query, limit)?;
    if results.is_empty() {
        println!("No matches");
    }
    for asset in results {
        println!(
            "{}  {}  {}",
            asset.date_taken.as_deref().unwrap_or("-"),
            asset.camera_model.as_deref().unwrap_or("-"),
            asset.file_path
        );
    }
    Ok(())
}

fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.1} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.1} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.1} KB", size as f64 / KB as f64)
    } else {
        format!("{} bytes", size)
    }
}
