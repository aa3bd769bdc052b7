//! Scan the corpus and bring the asset index up to date.
//!
//! Each image is classified against the index as new, incomplete (some
//! scalar still null) or complete. Complete files are skipped without being
//! read; the rest are extracted and upserted one row at a time, in bounded
//! batches. Rows are never deleted and populated fields never overwritten,
//! so the scan can be re-run at any point.

pub mod extract;

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{Config, ExtractorKind, ScannerConfig};
use crate::db::{Database, UpsertOutcome};
use crate::scanner::walk_images;

pub use extract::{
    asset_from_metadata, ExifExtractor, ExifToolExtractor, MetadataExtractor, RawMetadata,
};

#[derive(Debug, Clone, Copy)]
pub struct IndexOptions {
    /// Files per batch, at least one.
    pub batch_size: usize,
    /// Stop after this many extracted files, 0 for no limit.
    pub limit: usize,
}

impl IndexOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            batch_size: config.indexer.batch_size,
            limit: config.indexer.limit,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexSummary {
    pub seen: usize,
    pub complete: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub batches: usize,
}

impl IndexSummary {
    pub fn writes(&self) -> usize {
        self.inserted + self.updated
    }
}

/// The extractor selected in the configuration.
pub fn extractor_for(config: &Config) -> Box<dyn MetadataExtractor> {
    let exiftool = ExifToolExtractor::new(Duration::from_secs(config.indexer.exiftool_timeout_secs));
    match config.indexer.extractor {
        ExtractorKind::Exif => Box::new(ExifExtractor::with_fallback(exiftool)),
        ExtractorKind::Exiftool => Box::new(exiftool),
    }
}

pub struct Indexer<'a> {
    db: &'a Database,
    extractor: &'a dyn MetadataExtractor,
    scanner: &'a ScannerConfig,
}

impl<'a> Indexer<'a> {
    pub fn new(db: &'a Database, extractor: &'a dyn MetadataExtractor, scanner: &'a ScannerConfig) -> Self {
        Self {
            db,
            extractor,
            scanner,
        }
    }

    /// Index every image under `roots`. Store errors abort the run; extraction errors skip the file.
    pub fn run(&self, roots: &[PathBuf], options: IndexOptions) -> Result<IndexSummary> {
        let batch_size = options.batch_size.max(1);
        let complete = self.db.complete_asset_paths()?;
        debug!(complete = complete.len(), "loaded complete asset paths");

        let mut summary = IndexSummary::default();
        let mut batch: Vec<PathBuf> = Vec::with_capacity(batch_size);
        let mut queued = 0usize;

        'roots: for root in roots {
            if !root.is_dir() {
                debug!(root = %root.display(), "index root missing, skipped");
                continue;
            }
            for path in walk_images(root, self.scanner) {
                summary.seen += 1;
                if complete.contains(path.to_string_lossy().as_ref()) {
                    summary.complete += 1;
                    continue;
                }

                batch.push(path);
                queued += 1;
                if batch.len() >= batch_size {
                    self.process_batch(&mut batch, &mut summary)?;
                }
                if options.limit > 0 && queued >= options.limit {
                    break 'roots;
                }
            }
        }
        if !batch.is_empty() {
            self.process_batch(&mut batch, &mut summary)?;
        }

        info!(
            seen = summary.seen,
            inserted = summary.inserted,
            updated = summary.updated,
            unchanged = summary.unchanged,
            failed = summary.failed,
            "index run complete"
        );
        Ok(summary)
    }

    fn process_batch(&self, batch: &mut Vec<PathBuf>, summary: &mut IndexSummary) -> Result<()> {
        summary.batches += 1;
        debug!(batch = summary.batches, files = batch.len(), "processing batch");

        for path in batch.drain(..) {
            match self.index_file(&path)? {
                Some(UpsertOutcome::Inserted) => summary.inserted += 1,
                Some(UpsertOutcome::Updated) => summary.updated += 1,
                Some(UpsertOutcome::Unchanged) => summary.unchanged += 1,
                None => summary.failed += 1,
            }
        }
        Ok(())
    }

    /// `Ok(None)` when extraction failed for this file only.
    fn index_file(&self, path: &Path) -> Result<Option<UpsertOutcome>> {
        // The file may have vanished since the walk.
        if !path.exists() {
            return Ok(None);
        }
        let raw = match self.extractor.extract(path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(file = %path.display(), "could not extract metadata: {:#}", e);
                return Ok(None);
            }
        };
        let record = asset_from_metadata(&path.to_string_lossy(), &raw);
        Ok(Some(self.db.upsert_asset(&record)?))
    }
}
