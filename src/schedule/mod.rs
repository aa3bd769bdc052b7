//! Periodic index + backup cycles for the daemon.

use anyhow::Result;
use chrono::{Local, NaiveTime, Timelike};
use tracing::{info, warn};

use crate::backup::{BackupSummary, BackupTracker, ObjectStore};
use crate::config::{Config, DatabaseConfig, ScheduleConfig};
use crate::db::Database;
use crate::indexer::{extractor_for, IndexOptions, IndexSummary, Indexer};
use crate::wait::{wait_for, WaitPolicy};

/// Whether `hour` falls inside `[start, end)`.
///
/// `start > end` is an overnight range (22-6). Missing bounds mean always open.
pub fn within_hours(start: Option<u8>, end: Option<u8>, hour: u8) -> bool {
    let (start, end) = match (start, end) {
        (Some(s), Some(e)) => (s, e),
        _ => return true,
    };

    if start <= end {
        hour >= start && hour < end
    } else {
        hour >= start || hour < end
    }
}

pub fn is_open_at(schedule: &ScheduleConfig, time: NaiveTime) -> bool {
    within_hours(schedule.hours_start, schedule.hours_end, time.hour() as u8)
}

pub fn is_open_now(schedule: &ScheduleConfig) -> bool {
    is_open_at(schedule, Local::now().time())
}

/// Open and initialize the store, retrying until it answers or the policy runs out.
pub fn wait_for_database(config: &DatabaseConfig, policy: WaitPolicy) -> Option<Database> {
    wait_for(policy, |attempt| {
        match Database::open(config).and_then(|db| db.initialize().map(|_| db)) {
            Ok(db) => Some(db),
            Err(e) => {
                warn!(attempt, "database not reachable yet: {:#}", e);
                None
            }
        }
    })
}

#[derive(Debug, Clone, Default)]
pub struct CycleSummary {
    pub index: IndexSummary,
    pub backup: BackupSummary,
}

/// One daemon cycle: bring the index up to date, then the backups.
///
/// The backup half runs even if indexing failed; the first error is returned afterwards.
pub fn run_cycle(db: &Database, store: &dyn ObjectStore, config: &Config) -> Result<CycleSummary> {
    let mut summary = CycleSummary::default();

    let extractor = extractor_for(config);
    let index_result = Indexer::new(db, extractor.as_ref(), &config.scanner)
        .run(&config.storage.tier_roots(), IndexOptions::from_config(config));
    match &index_result {
        Ok(index) => summary.index = index.clone(),
        Err(e) => warn!("index pass failed: {:#}", e),
    }

    summary.backup = BackupTracker::new(db, store, config).run()?;
    index_result?;

    info!(
        indexed = summary.index.writes(),
        uploaded = summary.backup.uploaded,
        tombstoned = summary.backup.tombstoned,
        "cycle complete"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::MemoryObjectStore;
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_within_hours() {
        assert!(within_hours(None, None, 3));
        assert!(within_hours(Some(9), None, 3));

        assert!(within_hours(Some(9), Some(17), 9));
        assert!(within_hours(Some(9), Some(17), 16));
        assert!(!within_hours(Some(9), Some(17), 17));
        assert!(!within_hours(Some(9), Some(17), 3));

        assert!(within_hours(Some(22), Some(6), 23));
        assert!(within_hours(Some(22), Some(6), 2));
        assert!(!within_hours(Some(22), Some(6), 6));
        assert!(!within_hours(Some(22), Some(6), 12));
    }

    #[test]
    fn test_is_open_at() {
        let schedule = ScheduleConfig {
            hours_start: Some(1),
            hours_end: Some(5),
        };
        assert!(is_open_at(&schedule, NaiveTime::from_hms_opt(1, 30, 0).unwrap()));
        assert!(!is_open_at(&schedule, NaiveTime::from_hms_opt(5, 0, 0).unwrap()));
    }

    #[test]
    fn test_wait_for_database_gives_up() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"").unwrap();
        let config = DatabaseConfig {
            sqlite_path: blocker.join("sub").join("index.db"),
            ..Default::default()
        };
        let db = wait_for_database(&config, WaitPolicy::new(2, Duration::from_millis(1)));
        assert!(db.is_none());
    }

    #[test]
    fn test_cycle_indexes_and_backs_up() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.storage.primary_root = dir.path().join("images");
        config.storage.secondary_root = dir.path().join("external");
        config.storage.upload_root = dir.path().join("upload");
        config.storage.unified_root = None;
        config.database.sqlite_path = dir.path().join("index.db");
        fs::create_dir_all(&config.storage.primary_root).unwrap();
        // Not an image kamadak-exif can parse; it is still backed up.
        fs::write(config.storage.primary_root.join("a.jpg"), b"not really a jpeg").unwrap();

        let db = wait_for_database(&config.database, WaitPolicy::new(1, Duration::ZERO)).unwrap();
        let store = MemoryObjectStore::new("archive");
        let summary = run_cycle(&db, &store, &config).unwrap();

        assert_eq!(summary.index.seen, 1);
        assert_eq!(summary.backup.uploaded, 1);
        assert_eq!(store.keys(), vec!["internal/a.jpg".to_string()]);
    }
}
