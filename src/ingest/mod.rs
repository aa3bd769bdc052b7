//! One end-to-end ingestion run: removable media into the tiered corpus.
//!
//! ```text
//! idle -> lock-acquired -> source-detected -> destination-chosen -> copying -> ejecting -> idle
//! ```
//!
//! Files are laid out by capture date under the chosen tier root:
//! ```text
//! <tier root>/
//! └── 2024/
//!     └── 06/
//!         └── 15/
//!             └── IMG_20240615_103000.jpg
//! ```

pub mod capture_date;
pub mod eject;
pub mod lock;
pub mod volume;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dedup::{NameIndex, Resolution};
use crate::placement::{self, Tier};
use crate::scanner::discover_images;

pub use capture_date::{date_from_filename, dated_dir};
pub use eject::EjectOutcome;
pub use lock::{LockAttempt, RunLock};
pub use volume::SourceVolume;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestState {
    Idle,
    LockAcquired,
    SourceDetected,
    DestinationChosen,
    Copying,
    Ejecting,
}

#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    /// Ingest from this directory instead of detecting a removable volume.
    pub source: Option<PathBuf>,
    /// Skip unmount and eject even when the config enables them.
    pub no_eject: bool,
    /// Date used for files whose name carries none; defaults to today.
    pub fallback_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default)]
pub struct IngestSummary {
    pub copied: usize,
    pub skipped: usize,
    pub failed: Vec<(PathBuf, String)>,
    pub tier: Option<Tier>,
    pub destination: Option<PathBuf>,
    pub ejected: bool,
}

#[derive(Debug)]
pub enum IngestOutcome {
    Completed(IngestSummary),
    /// Another run holds the lock; nothing was touched.
    LockHeld { pid: Option<u32> },
    /// No source appeared within the polling budget.
    NoSource,
}

pub struct Ingestor<'a> {
    config: &'a Config,
    state: IngestState,
}

impl<'a> Ingestor<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self {
            config,
            state: IngestState::Idle,
        }
    }

    pub fn state(&self) -> IngestState {
        self.state
    }

    fn transition(&mut self, next: IngestState) {
        debug!(from = ?self.state, to = ?next, "ingest state");
        self.state = next;
    }

    /// Run once. The lock is released on every exit path.
    pub fn run(&mut self, options: &IngestOptions) -> Result<IngestOutcome> {
        let outcome = self.run_locked(options);
        self.transition(IngestState::Idle);
        outcome
    }

    fn run_locked(&mut self, options: &IngestOptions) -> Result<IngestOutcome> {
        let _lock = match RunLock::acquire(&self.config.ingest.lock_path)? {
            LockAttempt::Acquired(lock) => {
                debug!(lock = %lock.path().display(), "ingest lock acquired");
                lock
            }
            LockAttempt::Held { pid, alive } => {
                info!(?pid, alive, "another ingestion run holds the lock, exiting");
                return Ok(IngestOutcome::LockHeld { pid });
            }
        };
        self.transition(IngestState::LockAcquired);

        let source = match &options.source {
            Some(path) => volume::wait_for_source(path, &self.config.ingest),
            None => volume::detect_source(&self.config.ingest),
        };
        let Some(source) = source else {
            warn!("no source media found, nothing to ingest");
            return Ok(IngestOutcome::NoSource);
        };
        self.transition(IngestState::SourceDetected);

        let (tier, destination) = placement::resolve_destination_root(&self.config.storage)?;
        info!(%tier, destination = %destination.display(), "destination chosen");
        self.transition(IngestState::DestinationChosen);

        self.transition(IngestState::Copying);
        let mut index = NameIndex::build(&self.config.storage.corpus_roots());
        let fallback_date = options
            .fallback_date
            .unwrap_or_else(|| Local::now().date_naive());
        let mut summary = copy_new_files(
            &source.root,
            &destination,
            &self.config.ingest.camera_dir,
            &self.config.scanner.image_extensions,
            &mut index,
            fallback_date,
        );
        summary.tier = Some(tier);
        summary.destination = Some(destination);

        if self.config.ingest.eject && !options.no_eject {
            self.transition(IngestState::Ejecting);
            summary.ejected = eject::release(&source).ejected;
        }

        info!(
            copied = summary.copied,
            skipped = summary.skipped,
            failed = summary.failed.len(),
            tier = %tier,
            "ingestion complete"
        );
        Ok(IngestOutcome::Completed(summary))
    }
}

/// Directory to copy from: the camera directory when present, else the whole volume.
pub fn media_root(source_root: &Path, camera_dir: &str) -> PathBuf {
    let camera = source_root.join(camera_dir);
    if camera.is_dir() {
        camera
    } else {
        source_root.to_path_buf()
    }
}

/// Copy every not-yet-present image from `source_root` into dated folders under `destination`.
///
/// Per-file failures are collected, not raised.
pub fn copy_new_files(
    source_root: &Path,
    destination: &Path,
    camera_dir: &str,
    extensions: &[String],
    index: &mut NameIndex,
    fallback_date: NaiveDate,
) -> IngestSummary {
    let mut summary = IngestSummary::default();
    let root = media_root(source_root, camera_dir);

    for source in discover_images(&root, extensions) {
        let Some(filename) = source.file_name() else {
            continue;
        };
        let date = date_from_filename(&filename.to_string_lossy()).unwrap_or(fallback_date);
        let target_dir = dated_dir(destination, date);

        match index.resolve(&target_dir, filename) {
            Resolution::Skip { existing } => {
                debug!(file = %source.display(), existing = %existing.display(), "already in corpus");
                summary.skipped += 1;
            }
            Resolution::Write(target) => match copy_file(&source, &target) {
                Ok(()) => {
                    debug!(from = %source.display(), to = %target.display(), "copied");
                    index.record(&target);
                    summary.copied += 1;
                }
                Err(e) => {
                    warn!(file = %source.display(), "copy failed: {:#}", e);
                    summary.failed.push((source.clone(), format!("{:#}", e)));
                }
            },
        }
    }

    summary
}

/// Copy through a hidden `.partial` sibling so `target` never holds a truncated file.
fn copy_file(source: &Path, target: &Path) -> Result<()> {
    let dir = target
        .parent()
        .context("Destination has no parent directory")?;
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory {}", dir.display()))?;

    let name = target
        .file_name()
        .context("Destination has no file name")?;
    let mut partial_name = std::ffi::OsString::from(".");
    partial_name.push(name);
    partial_name.push(".partial");
    let partial = dir.join(partial_name);

    let result = fs::copy(source, &partial)
        .context("Copy failed")
        .and_then(|_| fs::rename(&partial, target).context("Rename failed"));
    if result.is_err() {
        let _ = fs::remove_file(&partial);
    }
    result
}
