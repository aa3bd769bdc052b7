//! Photostash daemon: periodic index and backup cycles.
//!
//! Each cycle brings the metadata index up to date for both storage tiers,
//! then uploads, verifies and reconciles the S3 backup. Ingestion is not
//! part of the cycle; it is triggered per inserted card (udev, systemd path
//! unit) with `photostash ingest`.
//!
//! ## Usage
//!
//! ```bash
//! photostash-daemon              # Run in foreground, one cycle per hour
//! photostash-daemon --once       # Run a single cycle and exit
//! ```

use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use tracing::{error, info};

use photostash::backup::S3ObjectStore;
use photostash::config::Config;
use photostash::db::Database;
use photostash::logging;
use photostash::schedule::{is_open_now, run_cycle, wait_for_database};
use photostash::wait::WaitPolicy;

/// Database readiness checks at startup, covering a slow boot.
const DB_WAIT_ATTEMPTS: u32 = 30;
const DB_WAIT_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "photostash-daemon")]
#[command(version, about = "Background index and backup cycles for photostash", long_about = None)]
struct DaemonArgs {
    /// Run one cycle and exit
    #[arg(long)]
    once: bool,

    /// Seconds between cycles
    #[arg(long, short, default_value = "3600")]
    interval: u64,

    /// Path to config file
    #[arg(long, short, env = "PHOTOSTASH_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = DaemonArgs::parse();

    logging::init(None, false)?;
    info!("photostash daemon starting");

    let config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let Some(db) = wait_for_database(
        &config.database,
        WaitPolicy::new(DB_WAIT_ATTEMPTS, DB_WAIT_INTERVAL),
    ) else {
        bail!(
            "database not reachable after {:?}",
            WaitPolicy::new(DB_WAIT_ATTEMPTS, DB_WAIT_INTERVAL).budget()
        );
    };
    info!("database ready");

    let store = S3ObjectStore::from_config(&config.backup)?;

    if args.once {
        info!("running in single-shot mode");
        run_cycle(&db, &store, &config)?;
    } else {
        info!("running in daemon mode, one cycle every {} seconds", args.interval);
        run_daemon_loop(&db, &store, &config, args.interval);
    }

    info!("photostash daemon stopped");
    Ok(())
}

fn run_daemon_loop(db: &Database, store: &S3ObjectStore, config: &Config, interval: u64) -> ! {
    loop {
        if is_open_now(&config.schedule) {
            if let Err(e) = run_cycle(db, store, config) {
                error!("cycle failed: {:#}", e);
            }
        } else {
            info!("outside hours of operation, skipping this cycle");
        }

        thread::sleep(Duration::from_secs(interval));
    }
}
