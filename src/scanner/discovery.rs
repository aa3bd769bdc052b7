use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

use crate::config::ScannerConfig;

/// Whether `path` carries one of the configured image extensions (case-insensitive).
pub fn has_image_extension(path: &Path, extensions: &[String]) -> bool {
    match path.extension() {
        Some(ext) => {
            let ext_lower = ext.to_string_lossy().to_lowercase();
            extensions.iter().any(|e| e.to_lowercase() == ext_lower)
        }
        None => false,
    }
}

fn is_excluded(entry: &DirEntry, exclude_dirs: &[String]) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && exclude_dirs
            .iter()
            .any(|d| entry.file_name().to_string_lossy() == d.as_str())
}

/// Lazily walk `root` for image files, pruning excluded directories.
///
/// Unreadable entries are skipped; a missing root yields nothing.
pub fn walk_images<'a>(
    root: &Path,
    scanner: &'a ScannerConfig,
) -> impl Iterator<Item = PathBuf> + 'a {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(move |e| !is_excluded(e, &scanner.exclude_dirs))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(move |p| has_image_extension(p, &scanner.image_extensions))
}

/// Collect all image files under `directory`, sorted for stable ordering.
pub fn discover_images(directory: &Path, extensions: &[String]) -> Vec<PathBuf> {
    let mut images: Vec<PathBuf> = WalkDir::new(directory)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| has_image_extension(p, extensions))
        .collect();

    images.sort();
    images
}
