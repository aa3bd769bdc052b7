//! Single-instance guard for ingestion runs.
//!
//! The lock is an advisory `flock` on the lock file, so checking and taking it
//! is one atomic step and a crashed holder releases it automatically. The file
//! also carries the holder's PID on one line for operators, and is removed
//! when the run finishes.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Outcome of trying to take the run lock.
#[derive(Debug)]
pub enum LockAttempt {
    Acquired(RunLock),
    /// Another process holds the lock. `alive` reports whether the recorded PID is running.
    Held { pid: Option<u32>, alive: bool },
}

/// Held for the whole run; dropping it removes the file and releases the lock.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    // Closing the descriptor releases the flock.
    file: File,
}

impl RunLock {
    pub fn acquire(path: &Path) -> Result<LockAttempt> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create lock directory {}", parent.display()))?;
        }

        loop {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)
                .with_context(|| format!("Failed to open lock file {}", path.display()))?;

            if !try_lock_exclusive(&file)? {
                let pid = read_pid(&mut file);
                let alive = pid.map(process_alive).unwrap_or(false);
                return Ok(LockAttempt::Held { pid, alive });
            }

            // A finishing holder unlinks the file before releasing it; if we
            // locked an unlinked inode, start over on the current one.
            if !refers_to_same_file(&file, path) {
                continue;
            }

            if let Some(previous) = read_pid(&mut file) {
                if previous != std::process::id() {
                    if process_alive(previous) {
                        warn!(pid = previous, "lock file names a running process that holds no lock, taking over");
                    } else {
                        info!(pid = previous, "clearing stale ingest lock");
                    }
                }
            }

            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            writeln!(file, "{}", std::process::id())?;
            file.sync_all()?;

            return Ok(LockAttempt::Acquired(RunLock {
                path: path.to_path_buf(),
                file,
            }));
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        // Unlink while still locked; the flock goes when `file` closes.
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), "failed to remove lock file: {}", e);
        }
        let _ = self.file.flush();
    }
}

fn try_lock_exclusive(file: &File) -> Result<bool> {
    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if ret == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.kind() == std::io::ErrorKind::WouldBlock {
        Ok(false)
    } else {
        Err(err).context("flock on ingest lock file failed")
    }
}

fn refers_to_same_file(file: &File, path: &Path) -> bool {
    match (file.metadata(), fs::metadata(path)) {
        (Ok(open), Ok(named)) => open.dev() == named.dev() && open.ino() == named.ino(),
        _ => false,
    }
}

fn read_pid(file: &mut File) -> Option<u32> {
    let mut content = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut content).ok()?;
    content.lines().next()?.trim().parse().ok()
}

/// Whether a process with this PID exists (signal 0 checks without delivering).
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    let ret = unsafe { libc::kill(pid, 0) };
    ret == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_acquire_writes_pid_and_release_removes_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ingest.lock");

        let lock = match RunLock::acquire(&path).unwrap() {
            LockAttempt::Acquired(lock) => lock,
            other => panic!("expected lock, got {:?}", other),
        };
        assert_eq!(lock.path(), path.as_path());
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());

        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn test_second_acquire_is_refused_and_file_untouched() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ingest.lock");

        let _held = match RunLock::acquire(&path).unwrap() {
            LockAttempt::Acquired(lock) => lock,
            other => panic!("expected lock, got {:?}", other),
        };
        let before = fs::read(&path).unwrap();

        match RunLock::acquire(&path).unwrap() {
            LockAttempt::Held { pid, alive } => {
                assert_eq!(pid, Some(std::process::id()));
                assert!(alive);
            }
            LockAttempt::Acquired(_) => panic!("lock acquired twice"),
        }

        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[test]
    fn test_stale_pid_file_is_taken_over() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ingest.lock");
        fs::write(&path, "4194304000\n").unwrap();

        match RunLock::acquire(&path).unwrap() {
            LockAttempt::Acquired(_lock) => {
                let content = fs::read_to_string(&path).unwrap();
                assert_eq!(content.trim(), std::process::id().to_string());
            }
            other => panic!("expected lock, got {:?}", other),
        }
    }

    #[test]
    fn test_process_alive() {
        assert!(process_alive(std::process::id()));
        assert!(!process_alive(0));
    }
}
