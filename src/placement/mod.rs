//! Capacity-aware choice of the storage tier that receives new files.
//!
//! Callers must ask again before every ingestion run; free space changes
//! between runs and nothing here is cached.

use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::StorageConfig;
use crate::error::StashError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Primary,
    Secondary,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Primary => "primary",
            Tier::Secondary => "secondary",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tier for a given amount of free primary space.
pub fn tier_for_free_space(free_bytes: u64, threshold: u64) -> Tier {
    if free_bytes < threshold {
        Tier::Secondary
    } else {
        Tier::Primary
    }
}

/// Pick the tier for new files based on the primary filesystem's free space.
///
/// An unqueryable primary filesystem counts as full.
pub fn choose_tier(primary_root: &Path, threshold: u64) -> Tier {
    let free = match available_space(primary_root) {
        Some(bytes) => bytes,
        None => {
            warn!(path = %primary_root.display(), "cannot query primary tier free space, treating as full");
            0
        }
    };
    let tier = tier_for_free_space(free, threshold);
    debug!(free, threshold, %tier, "tier chosen");
    tier
}

/// Resolve the directory that receives this run's copies.
///
/// Fails when the secondary tier is needed but not reachable, so nothing is
/// ever written to an unknown location.
pub fn resolve_destination_root(storage: &StorageConfig) -> Result<(Tier, PathBuf), StashError> {
    match choose_tier(&storage.primary_root, storage.min_free_bytes) {
        Tier::Primary => Ok((Tier::Primary, storage.primary_root.clone())),
        Tier::Secondary => {
            if storage.secondary_root.is_dir() {
                Ok((Tier::Secondary, storage.secondary_root.clone()))
            } else {
                Err(StashError::NoDestination {
                    primary: storage.primary_root.clone(),
                    secondary: storage.secondary_root.clone(),
                })
            }
        }
    }
}

/// Bytes available to unprivileged users on the filesystem holding `path`.
#[cfg(unix)]
pub fn available_space(path: &Path) -> Option<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if ret != 0 {
        debug!("statvfs failed: {}", std::io::Error::last_os_error());
        return None;
    }

    // Field widths differ between Linux and macOS.
    #[allow(clippy::unnecessary_cast)]
    let avail = (stat.f_bavail as u64).checked_mul(stat.f_frsize as u64)?;
    Some(avail)
}

#[cfg(not(unix))]
pub fn available_space(_path: &Path) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GIB;
    use tempfile::tempdir;

    #[test]
    fn test_threshold_boundary() {
        let threshold = 10 * GIB;
        assert_eq!(tier_for_free_space(threshold - 1, threshold), Tier::Secondary);
        assert_eq!(tier_for_free_space(threshold, threshold), Tier::Primary);
        assert_eq!(tier_for_free_space(threshold + 1, threshold), Tier::Primary);
        assert_eq!(tier_for_free_space(0, threshold), Tier::Secondary);
    }

    #[test]
    fn test_unreadable_primary_falls_to_secondary() {
        let tier = choose_tier(Path::new("/definitely/not/a/mount/point"), 1);
        assert_eq!(tier, Tier::Secondary);
    }

    #[cfg(unix)]
    #[test]
    fn test_available_space_on_tempdir() {
        let dir = tempdir().unwrap();
        assert!(available_space(dir.path()).is_some());
    }

    #[test]
    fn test_zero_threshold_keeps_primary() {
        let dir = tempdir().unwrap();
        let storage = StorageConfig {
            primary_root: dir.path().to_path_buf(),
            secondary_root: dir.path().join("missing"),
            unified_root: None,
            upload_root: dir.path().join("upload"),
            min_free_bytes: 0,
        };
        let (tier, root) = resolve_destination_root(&storage).unwrap();
        assert_eq!(tier, Tier::Primary);
        assert_eq!(root, dir.path());
    }

    #[test]
    fn test_full_primary_with_missing_secondary_is_fatal() {
        let dir = tempdir().unwrap();
        let storage = StorageConfig {
            primary_root: dir.path().to_path_buf(),
            secondary_root: dir.path().join("unmounted"),
            unified_root: None,
            upload_root: dir.path().join("upload"),
            min_free_bytes: u64::MAX,
        };
        let err = resolve_destination_root(&storage).unwrap_err();
        assert!(matches!(err, StashError::NoDestination { .. }));
    }

    #[test]
    fn test_full_primary_with_mounted_secondary() {
        let dir = tempdir().unwrap();
        let secondary = dir.path().join("external");
        std::fs::create_dir(&secondary).unwrap();
        let storage = StorageConfig {
            primary_root: dir.path().to_path_buf(),
            secondary_root: secondary.clone(),
            unified_root: None,
            upload_root: dir.path().join("upload"),
            min_free_bytes: u64::MAX,
        };
        let (tier, root) = resolve_destination_root(&storage).unwrap();
        assert_eq!(tier, Tier::Secondary);
        assert_eq!(root, secondary);
    }
}
