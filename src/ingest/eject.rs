//! Best-effort release of the source media after a run.

use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

use super::volume::SourceVolume;

/// What happened while releasing the volume. Failures are reported, never raised.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EjectOutcome {
    pub unmounted: bool,
    pub ejected: bool,
}

fn run(program: &str, args: &[&str]) -> bool {
    match Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
    {
        Ok(output) if output.status.success() => true,
        Ok(output) => {
            debug!(
                program,
                status = ?output.status.code(),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "release command failed"
            );
            false
        }
        Err(e) => {
            debug!(program, "release command unavailable: {}", e);
            false
        }
    }
}

fn unmount(root: &Path, device: Option<&str>) -> bool {
    let root = root.to_string_lossy();
    if run("umount", &[&root]) {
        return true;
    }
    match device {
        Some(dev) => run("udisksctl", &["unmount", "--no-user-interaction", "-b", dev]),
        None => false,
    }
}

fn eject(device: &str) -> bool {
    run("eject", &[device])
        || run("udisksctl", &["power-off", "--no-user-interaction", "-b", device])
}

/// Unmount the volume, then eject its device. Only mounted volumes are touched.
pub fn release(volume: &SourceVolume) -> EjectOutcome {
    let Some(device) = volume.device.as_deref() else {
        debug!(root = %volume.root.display(), "source is not a mount point, nothing to eject");
        return EjectOutcome::default();
    };

    let unmounted = unmount(&volume.root, Some(device));
    if !unmounted {
        warn!(
            root = %volume.root.display(),
            device,
            "could not unmount source volume, skipping eject"
        );
        return EjectOutcome::default();
    }

    let ejected = eject(device);
    if ejected {
        info!(device, "source media ejected");
    } else {
        warn!(device, "unmounted source volume but could not eject it");
    }
    EjectOutcome { unmounted, ejected }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_plain_directory_is_left_alone() {
        let outcome = release(&SourceVolume {
            root: PathBuf::from("/tmp"),
            device: None,
        });
        assert_eq!(outcome, EjectOutcome::default());
    }

    #[test]
    fn test_failed_unmount_skips_eject() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = release(&SourceVolume {
            root: dir.path().to_path_buf(),
            device: Some("/dev/photostash-no-such-device".to_string()),
        });
        assert!(!outcome.unmounted);
        assert!(!outcome.ejected);
    }

    #[test]
    fn test_missing_program_counts_as_failure() {
        assert!(!run("photostash-no-such-program", &[]));
    }
}
