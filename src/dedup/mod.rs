//! Filename-based duplicate detection across the whole corpus.
//!
//! Matching is byte-exact on the file name only. Contents, sizes and
//! timestamps are never compared: a renamed copy of an existing photo is
//! ingested again, and a different photo that happens to reuse an existing
//! name is skipped.
//!
//! Looking a name up means knowing every name in the corpus. Rather than
//! walking the tree once per incoming file, a run builds a [`NameIndex`] with
//! a single walk and keeps it current as it writes.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Where an incoming file should go, if anywhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// A file with this name already exists somewhere in the corpus.
    Skip { existing: PathBuf },
    /// Write the incoming file here.
    Write(PathBuf),
}

/// Every file name in the corpus, mapped to one location holding it.
#[derive(Debug, Default)]
pub struct NameIndex {
    names: HashMap<OsString, PathBuf>,
}

impl NameIndex {
    /// Walk all `roots` once. Missing roots are skipped.
    pub fn build(roots: &[PathBuf]) -> Self {
        let mut index = Self::default();
        for root in roots {
            if !root.exists() {
                debug!(root = %root.display(), "corpus root missing, not indexed");
                continue;
            }
            for entry in WalkDir::new(root)
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
            {
                index.record(entry.path());
            }
        }
        debug!(names = index.len(), "corpus name index built");
        index
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn lookup(&self, filename: &OsStr) -> Option<&Path> {
        self.names.get(filename).map(PathBuf::as_path)
    }

    /// Note a file now present in the corpus.
    pub fn record(&mut self, path: &Path) {
        if let Some(name) = path.file_name() {
            self.names
                .entry(name.to_os_string())
                .or_insert_with(|| path.to_path_buf());
        }
    }

    /// Decide the fate of `filename` destined for `target_dir`.
    pub fn resolve(&self, target_dir: &Path, filename: &OsStr) -> Resolution {
        if let Some(existing) = self.lookup(filename) {
            return Resolution::Skip {
                existing: existing.to_path_buf(),
            };
        }
        Resolution::Write(unique_in_dir(target_dir, filename))
    }
}

/// One-shot resolution that walks the corpus itself.
pub fn resolve_destination(corpus_root: &Path, target_dir: &Path, filename: &OsStr) -> Resolution {
    NameIndex::build(&[corpus_root.to_path_buf()]).resolve(target_dir, filename)
}

/// `filename` inside `target_dir`, suffixed `_1`, `_2`, ... until nothing there has that name.
fn unique_in_dir(target_dir: &Path, filename: &OsStr) -> PathBuf {
    let mut candidate = target_dir.join(filename);
    let mut n = 1u32;
    while candidate.exists() {
        candidate = target_dir.join(suffixed_name(filename, n));
        n += 1;
    }
    candidate
}

/// Insert `_n` between stem and extension: `IMG_001.JPG` -> `IMG_001_1.JPG`.
pub fn suffixed_name(filename: &OsStr, n: u32) -> OsString {
    let path = Path::new(filename);
    let mut name = path.file_stem().map(OsStr::to_os_string).unwrap_or_default();
    name.push(format!("_{n}"));
    if let Some(ext) = path.extension() {
        name.push(".");
        name.push(ext);
    }
    name
}
