//! Finding the removable volume to ingest from.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::IngestConfig;
use crate::wait::{wait_for, WaitPolicy};

/// A source directory, with its backing device when it is a mount point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceVolume {
    pub root: PathBuf,
    pub device: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub mount_point: PathBuf,
}

/// Parse `/proc/self/mounts` style content (`device mountpoint fstype opts ...`).
pub fn parse_mount_table(contents: &str) -> Vec<MountEntry> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            Some(MountEntry {
                device: unescape_mount_field(device),
                mount_point: PathBuf::from(unescape_mount_field(mount_point)),
            })
        })
        .collect()
}

/// The kernel writes space, tab, newline and backslash as three-digit octal escapes.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            if let Some(digits) = bytes.get(i + 1..i + 4) {
                if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                    let value = digits
                        .iter()
                        .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                    if let Ok(byte) = u8::try_from(value) {
                        out.push(byte);
                        i += 4;
                        continue;
                    }
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// First mount sitting directly under one of `bases` (e.g. `/media/alice/SD_CARD`).
pub fn find_removable_mount(bases: &[PathBuf], mounts: &[MountEntry]) -> Option<SourceVolume> {
    mounts
        .iter()
        .find(|m| {
            m.mount_point
                .parent()
                .map(|parent| bases.iter().any(|b| b == parent))
                .unwrap_or(false)
        })
        .map(|m| SourceVolume {
            root: m.mount_point.clone(),
            device: Some(m.device.clone()),
        })
}

fn read_mounts(table: &Path) -> Vec<MountEntry> {
    match std::fs::read_to_string(table) {
        Ok(contents) => parse_mount_table(&contents),
        Err(e) => {
            debug!(table = %table.display(), "cannot read mount table: {}", e);
            Vec::new()
        }
    }
}

fn policy(config: &IngestConfig) -> WaitPolicy {
    WaitPolicy::new(
        config.mount_attempts,
        Duration::from_millis(config.mount_interval_ms),
    )
}

/// Poll the mount table until a removable volume shows up or attempts run out.
pub fn detect_source(config: &IngestConfig) -> Option<SourceVolume> {
    let found = wait_for(policy(config), |attempt| {
        let mounts = read_mounts(&config.mount_table);
        let found = find_removable_mount(&config.mount_bases, &mounts);
        if found.is_none() {
            debug!(attempt, "no removable volume mounted yet");
        }
        found
    });
    if let Some(volume) = &found {
        info!(root = %volume.root.display(), device = ?volume.device, "removable volume detected");
    }
    found
}

/// Wait for an explicitly named source directory to appear.
pub fn wait_for_source(path: &Path, config: &IngestConfig) -> Option<SourceVolume> {
    wait_for(policy(config), |_| path.is_dir().then_some(()))?;
    let device = read_mounts(&config.mount_table)
        .into_iter()
        .find(|m| m.mount_point == path)
        .map(|m| m.device);
    Some(SourceVolume {
        root: path.to_path_buf(),
        device,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const TABLE: &str = "\
sysfs /sys sysfs rw,nosuid,nodev,noexec,relatime 0 0
/dev/nvme0n1p2 / ext4 rw,relatime 0 0
/dev/sda1 /mnt/external-storage ext4 rw,relatime 0 0
/dev/sdb1 /media/alice/EOS\\040DIGITAL vfat rw,nosuid,nodev 0 0
";

    #[test]
    fn test_parse_decodes_escapes() {
        let mounts = parse_mount_table(TABLE);
        assert_eq!(mounts.len(), 4);
        assert_eq!(mounts[3].mount_point, PathBuf::from("/media/alice/EOS DIGITAL"));
        assert_eq!(mounts[3].device, "/dev/sdb1");
    }

    #[test]
    fn test_unescape_leaves_plain_backslashes() {
        assert_eq!(unescape_mount_field("a\\134b"), "a\\b");
        assert_eq!(unescape_mount_field("tail\\"), "tail\\");
        assert_eq!(unescape_mount_field("x\\9yz"), "x\\9yz");
    }

    #[test]
    fn test_only_direct_children_of_bases_count() {
        let mounts = parse_mount_table(TABLE);
        let bases = vec![PathBuf::from("/media/alice"), PathBuf::from("/run/media/alice")];
        let volume = find_removable_mount(&bases, &mounts).unwrap();
        assert_eq!(volume.root, PathBuf::from("/media/alice/EOS DIGITAL"));
        assert_eq!(volume.device.as_deref(), Some("/dev/sdb1"));

        let bases = vec![PathBuf::from("/media/bob")];
        assert!(find_removable_mount(&bases, &mounts).is_none());
    }

    #[test]
    fn test_detect_gives_up_without_mount() {
        let dir = tempdir().unwrap();
        let table = dir.path().join("mounts");
        std::fs::write(&table, "/dev/sda1 / ext4 rw 0 0\n").unwrap();

        let config = IngestConfig {
            mount_table: table,
            mount_bases: vec![PathBuf::from("/media/alice")],
            mount_attempts: 3,
            mount_interval_ms: 1,
            ..Default::default()
        };
        assert!(detect_source(&config).is_none());
    }

    #[test]
    fn test_explicit_source_is_waited_for() {
        let dir = tempdir().unwrap();
        let config = IngestConfig {
            mount_table: dir.path().join("no-table"),
            mount_attempts: 2,
            mount_interval_ms: 1,
            ..Default::default()
        };

        let volume = wait_for_source(dir.path(), &config).unwrap();
        assert_eq!(volume.root, dir.path());
        assert_eq!(volume.device, None);

        assert!(wait_for_source(&dir.path().join("missing"), &config).is_none());
    }
}
