//! Track every corpus file through its life in the object store.
//!
//! Per file the tracker moves through `unseen -> uploaded | error`, may swing
//! between `uploaded` and `error` on re-verification or retry, and ends up in
//! `deleted_backups` once the local file is gone. Per-file failures are
//! recorded in the row and counted; only store failures abort a run.

pub mod object_store;
pub mod retry;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db::Database;
use crate::scanner::{file_md5, walk_images};

pub use crate::db::{BackupRecord, BackupStatus, DeletedBackupRecord, SourceType};
pub use object_store::{
    resolve_credentials, MemoryObjectStore, ObjectInfo, ObjectMetadata, ObjectStore,
    S3ObjectStore,
};

/// `<source_type>/<path relative to root>`, or just the file name when `path`
/// is not under `root`.
pub fn s3_key(source_type: SourceType, root: &Path, path: &Path) -> String {
    let relative = match path.strip_prefix(root) {
        Ok(rel) if !rel.as_os_str().is_empty() => rel.to_string_lossy().replace('\\', "/"),
        _ => path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
    };
    format!("{}/{}", source_type.as_str(), relative)
}

/// What a run does with one file.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Upload,
    Verify,
    Skip,
}

/// Decide what to do with a file given its current row, if any.
pub fn classify(existing: Option<&BackupRecord>, now: DateTime<Utc>, window: Duration) -> Action {
    let Some(record) = existing else {
        return Action::Upload;
    };
    match record.status {
        BackupStatus::Error => Action::Upload,
        BackupStatus::Uploaded => match record.last_verified_at.or(record.uploaded_at) {
            Some(at) if now - at < window => Action::Skip,
            _ => Action::Verify,
        },
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupSummary {
    pub uploaded: usize,
    pub skipped: usize,
    pub erred: usize,
    pub verified: usize,
    /// Uploaded files whose remote copy no longer matched.
    pub demoted: usize,
    pub tombstoned: usize,
    /// Tombstones rolled back because the remote delete failed.
    pub tombstone_failed: usize,
    /// Source roots that were not mounted.
    pub sources_skipped: usize,
}

pub struct BackupTracker<'a> {
    db: &'a Database,
    store: &'a dyn ObjectStore,
    config: &'a Config,
    dry_run: bool,
}

impl<'a> BackupTracker<'a> {
    pub fn new(db: &'a Database, store: &'a dyn ObjectStore, config: &'a Config) -> Self {
        Self {
            db,
            store,
            config,
            dry_run: false,
        }
    }

    /// Log what would be uploaded or tombstoned without writing anything.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Back up every configured source, then reconcile deletions for each.
    pub fn run(&self) -> Result<BackupSummary> {
        let mut summary = BackupSummary::default();

        for (source_type, root) in self.config.storage.backup_sources() {
            if !root.is_dir() {
                info!(source = %source_type, root = %root.display(), "source not accessible, skipped");
                summary.sources_skipped += 1;
                continue;
            }
            self.scan_source(source_type, &root, &mut summary)?;
            self.reconcile_deletions(source_type, &root, &mut summary)?;
        }

        info!(
            dry_run = self.dry_run,
            uploaded = summary.uploaded,
            skipped = summary.skipped,
            erred = summary.erred,
            verified = summary.verified,
            demoted = summary.demoted,
            tombstoned = summary.tombstoned,
            "backup run complete"
        );
        Ok(summary)
    }

    fn scan_source(&self, source_type: SourceType, root: &Path, summary: &mut BackupSummary) -> Result<()> {
        info!(source = %source_type, root = %root.display(), "scanning backup source");
        let now = Utc::now();
        let window = self.config.backup.verify_window();

        for path in walk_images(root, &self.config.scanner) {
            let file_path = path.to_string_lossy().to_string();
            let existing = self.db.get_backup(&file_path)?;

            match classify(existing.as_ref(), now, window) {
                Action::Skip => summary.skipped += 1,
                Action::Upload => self.upload(source_type, root, &path, existing.as_ref(), summary)?,
                Action::Verify => {
                    if let Some(record) = existing {
                        self.verify(&path, &record, summary)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn upload(
        &self,
        source_type: SourceType,
        root: &Path,
        path: &Path,
        existing: Option<&BackupRecord>,
        summary: &mut BackupSummary,
    ) -> Result<()> {
        let file_path = path.to_string_lossy().to_string();
        // A row keeps the key and source type it was first recorded with.
        let (key, source_type) = match existing {
            Some(record) => (record.s3_key.clone(), record.source_type),
            None => (s3_key(source_type, root, path), source_type),
        };

        if self.dry_run {
            info!(file = %file_path, key = %key, "[dry run] would upload");
            summary.uploaded += 1;
            return Ok(());
        }

        match self.put(source_type, path, &key) {
            Ok((size, md5)) => {
                let now = Utc::now();
                self.db.record_upload(&BackupRecord {
                    file_path: file_path.clone(),
                    s3_key: key.clone(),
                    source_type,
                    file_size: Some(size as i64),
                    uploaded_at: Some(now),
                    last_verified_at: Some(now),
                    checksum: Some(md5),
                    status: BackupStatus::Uploaded,
                    last_error: None,
                })?;
                info!(file = %file_path, key = %key, "uploaded");
                summary.uploaded += 1;
            }
            Err(e) if is_gone(path) => {
                debug!(file = %file_path, "file removed before upload: {:#}", e);
                summary.skipped += 1;
            }
            Err(e) => {
                warn!(file = %file_path, key = %key, "upload failed: {:#}", e);
                let size = std::fs::metadata(path).ok().map(|m| m.len() as i64);
                self.db
                    .record_backup_error(&file_path, &key, source_type, size, &format!("{e:#}"))?;
                summary.erred += 1;
            }
        }
        Ok(())
    }

    fn put(&self, source_type: SourceType, path: &Path, key: &str) -> Result<(u64, String)> {
        let size = std::fs::metadata(path)?.len();
        let md5 = file_md5(path)?;
        let metadata = ObjectMetadata {
            source_type: source_type.as_str().to_string(),
            upload_date: Utc::now().to_rfc3339(),
            file_size: size,
            original_path: path.to_string_lossy().to_string(),
            md5: md5.clone(),
        };
        self.store.put_file(key, path, &metadata)?;
        Ok((size, md5))
    }

    fn verify(&self, path: &Path, record: &BackupRecord, summary: &mut BackupSummary) -> Result<()> {
        if self.dry_run {
            debug!(file = %record.file_path, "[dry run] would verify");
            summary.skipped += 1;
            return Ok(());
        }

        let local = match file_md5(path) {
            Ok(sum) => sum,
            Err(e) => {
                // Gone or unreadable: reconciliation or the next run deals with it.
                warn!(file = %record.file_path, "could not hash file for verification: {:#}", e);
                summary.skipped += 1;
                return Ok(());
            }
        };

        let problem = match self.remote_checksum(&record.s3_key) {
            Ok(Some(remote)) if remote == local => None,
            Ok(Some(_)) => Some("checksum mismatch".to_string()),
            Ok(None) => Some("remote object missing".to_string()),
            Err(e) => Some(format!("verification failed: {e:#}")),
        };

        match problem {
            None => {
                self.db.mark_verified(&record.file_path, Utc::now())?;
                debug!(file = %record.file_path, "verified");
                summary.verified += 1;
            }
            Some(problem) => {
                warn!(file = %record.file_path, key = %record.s3_key, "{}", problem);
                self.db.record_backup_error(
                    &record.file_path,
                    &record.s3_key,
                    record.source_type,
                    record.file_size,
                    &problem,
                )?;
                summary.demoted += 1;
            }
        }
        Ok(())
    }

    /// Remote MD5 from object metadata or ETag, downloading only as a last resort.
    fn remote_checksum(&self, key: &str) -> Result<Option<String>> {
        use md5::{Digest, Md5};

        let Some(info) = self.store.head(key)? else {
            return Ok(None);
        };
        if let Some(sum) = info.checksum() {
            return Ok(Some(sum));
        }
        Ok(self
            .store
            .get(key)?
            .map(|data| format!("{:x}", Md5::digest(&data))))
    }

    fn reconcile_deletions(
        &self,
        source_type: SourceType,
        root: &Path,
        summary: &mut BackupSummary,
    ) -> Result<()> {
        let bucket = self.store.bucket_name();
        let delete_remote = self.config.backup.delete_remote_on_removal;

        for record in self.db.backups_for_source(source_type)? {
            let path = PathBuf::from(&record.file_path);
            if !path.starts_with(root) || !is_gone(&path) {
                continue;
            }

            if self.dry_run {
                info!(file = %record.file_path, key = %record.s3_key, "[dry run] would tombstone");
                summary.tombstoned += 1;
                continue;
            }

            // Remote first, outside any transaction. A failure leaves the row
            // for the next run; a repeated delete of a gone object succeeds.
            if delete_remote {
                if let Err(e) = self.store.delete(&record.s3_key) {
                    warn!(file = %record.file_path, key = %record.s3_key, "remote delete failed, will retry: {:#}", e);
                    summary.tombstone_failed += 1;
                    continue;
                }
            }

            match self.db.tombstone_backup(&record.file_path, bucket)? {
                Some(deleted) => {
                    info!(
                        file = %deleted.file_path,
                        original_status = %deleted.original_status,
                        "file removed locally, backup tombstoned"
                    );
                    summary.tombstoned += 1;
                }
                None => debug!(file = %record.file_path, "already tombstoned by another run"),
            }
        }
        Ok(())
    }
}

/// Only a definite "not found" counts; permission errors leave the row alone.
fn is_gone(path: &Path) -> bool {
    matches!(std::fs::symlink_metadata(path), Err(e) if e.kind() == std::io::ErrorKind::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use std::fs;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        config: Config,
        db: Database,
        store: MemoryObjectStore,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.storage.primary_root = dir.path().join("images");
        config.storage.secondary_root = dir.path().join("external");
        config.storage.upload_root = dir.path().join("upload");
        config.storage.unified_root = None;
        for root in config.storage.tier_roots() {
            fs::create_dir_all(root.join("2024/06/15")).unwrap();
        }
        fs::create_dir_all(&config.storage.upload_root).unwrap();

        let db = Database::open(&DatabaseConfig {
            sqlite_path: dir.path().join("index.db"),
            ..Default::default()
        })
        .unwrap();
        db.initialize().unwrap();

        Fixture {
            _dir: dir,
            config,
            db,
            store: MemoryObjectStore::new("family-archive"),
        }
    }

    impl Fixture {
        fn photo(&self, root: &Path, name: &str, contents: &[u8]) -> PathBuf {
            let path = root.join("2024/06/15").join(name);
            fs::write(&path, contents).unwrap();
            path
        }

        fn run(&self) -> BackupSummary {
            BackupTracker::new(&self.db, &self.store, &self.config).run().unwrap()
        }

        fn record(&self, path: &Path) -> Option<BackupRecord> {
            self.db.get_backup(&path.to_string_lossy()).unwrap()
        }

        /// Pretend the last verification happened long ago.
        fn age(&self, path: &Path) {
            let mut record = self.record(path).unwrap();
            record.last_verified_at = Some(Utc::now() - Duration::days(45));
            self.db.record_upload(&record).unwrap();
        }
    }

    #[test]
    fn test_s3_key() {
        let root = Path::new("/srv/images");
        assert_eq!(
            s3_key(SourceType::Internal, root, Path::new("/srv/images/2024/06/15/a.jpg")),
            "internal/2024/06/15/a.jpg"
        );
        assert_eq!(
            s3_key(SourceType::ImmichUpload, root, Path::new("/elsewhere/b.jpg")),
            "immich_upload/b.jpg"
        );
    }

    #[test]
    fn test_classify() {
        let now = Utc::now();
        let window = Duration::days(30);
        let mut record = BackupRecord {
            file_path: "/srv/a.jpg".to_string(),
            s3_key: "internal/a.jpg".to_string(),
            source_type: SourceType::Internal,
            file_size: Some(1),
            uploaded_at: Some(now - Duration::days(60)),
            last_verified_at: Some(now - Duration::days(1)),
            checksum: None,
            status: BackupStatus::Uploaded,
            last_error: None,
        };

        assert_eq!(classify(None, now, window), Action::Upload);
        assert_eq!(classify(Some(&record), now, window), Action::Skip);

        record.last_verified_at = Some(now - Duration::days(31));
        assert_eq!(classify(Some(&record), now, window), Action::Verify);

        record.last_verified_at = None;
        assert_eq!(classify(Some(&record), now, window), Action::Verify);

        record.status = BackupStatus::Error;
        assert_eq!(classify(Some(&record), now, window), Action::Upload);
    }

    #[test]
    fn test_upload_then_skip() {
        let f = fixture();
        let path = f.photo(&f.config.storage.primary_root, "a.jpg", b"hello world");

        let first = f.run();
        assert_eq!(first.uploaded, 1);

        let record = f.record(&path).unwrap();
        assert_eq!(record.status, BackupStatus::Uploaded);
        assert_eq!(record.s3_key, "internal/2024/06/15/a.jpg");
        assert_eq!(record.checksum.as_deref(), Some("5eb63bbbe01eeed093cb22bb8f5acdc3"));
        assert_eq!(record.file_size, Some(11));

        let object = f.store.object("internal/2024/06/15/a.jpg").unwrap();
        assert_eq!(object.metadata["source_type"], "internal");
        assert_eq!(object.metadata["md5"], "5eb63bbbe01eeed093cb22bb8f5acdc3");

        let second = f.run();
        assert_eq!(second.uploaded, 0);
        assert_eq!(second.skipped, 1);
    }

    #[test]
    fn test_source_type_follows_root() {
        let f = fixture();
        f.photo(&f.config.storage.secondary_root, "b.jpg", b"b");
        fs::write(f.config.storage.upload_root.join("c.jpg"), b"c").unwrap();

        f.run();
        let keys = f.store.keys();
        assert!(keys.contains(&"external/2024/06/15/b.jpg".to_string()));
        assert!(keys.contains(&"immich_upload/c.jpg".to_string()));
    }

    #[test]
    fn test_mismatch_demotes_then_tombstone_keeps_error_status() {
        let f = fixture();
        let path = f.photo(&f.config.storage.primary_root, "a.jpg", b"hello world");
        f.run();

        f.store.corrupt("internal/2024/06/15/a.jpg", b"bit rot");
        f.age(&path);
        let summary = f.run();
        assert_eq!(summary.demoted, 1);
        let record = f.record(&path).unwrap();
        assert_eq!(record.status, BackupStatus::Error);
        assert_eq!(record.last_error.as_deref(), Some("checksum mismatch"));

        fs::remove_file(&path).unwrap();
        let summary = f.run();
        assert_eq!(summary.tombstoned, 1);
        assert!(f.record(&path).is_none());

        let deleted = f.db.deleted_backups().unwrap();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].original_status, "error");
        assert_eq!(
            deleted[0].s3_full_path.as_deref(),
            Some("s3://family-archive/internal/2024/06/15/a.jpg")
        );
        assert!(f.store.object("internal/2024/06/15/a.jpg").is_none());

        // A later run finds nothing left to move.
        assert_eq!(f.run().tombstoned, 0);
        assert_eq!(f.db.count_deleted_backups().unwrap(), 1);
    }

    #[test]
    fn test_intact_object_is_reverified() {
        let f = fixture();
        let path = f.photo(&f.config.storage.primary_root, "a.jpg", b"hello world");
        f.run();
        f.age(&path);

        let summary = f.run();
        assert_eq!(summary.verified, 1);
        let record = f.record(&path).unwrap();
        assert_eq!(record.status, BackupStatus::Uploaded);
        assert!(Utc::now() - record.last_verified_at.unwrap() < Duration::minutes(5));
    }

    #[test]
    fn test_missing_remote_object_demotes() {
        let f = fixture();
        let path = f.photo(&f.config.storage.primary_root, "a.jpg", b"x");
        f.run();
        f.store.remove("internal/2024/06/15/a.jpg");
        f.age(&path);

        assert_eq!(f.run().demoted, 1);
        assert_eq!(
            f.record(&path).unwrap().last_error.as_deref(),
            Some("remote object missing")
        );
        // Next run retries the upload.
        assert_eq!(f.run().uploaded, 1);
        assert!(f.store.object("internal/2024/06/15/a.jpg").is_some());
    }

    #[test]
    fn test_upload_failure_is_recorded_and_retried() {
        let f = fixture();
        let a = f.photo(&f.config.storage.primary_root, "a.jpg", b"a");
        f.photo(&f.config.storage.primary_root, "b.jpg", b"b");

        f.store.set_fail_puts(true);
        let summary = f.run();
        assert_eq!(summary.erred, 2);
        assert_eq!(summary.uploaded, 0);
        let record = f.record(&a).unwrap();
        assert_eq!(record.status, BackupStatus::Error);
        assert!(record.last_error.unwrap().contains("injected failure"));

        f.store.set_fail_puts(false);
        let summary = f.run();
        assert_eq!(summary.uploaded, 2);
        let record = f.record(&a).unwrap();
        assert_eq!(record.status, BackupStatus::Uploaded);
        assert_eq!(record.last_error, None);
    }

    #[test]
    fn test_unmounted_source_is_not_tombstoned() {
        let f = fixture();
        let path = f.photo(&f.config.storage.secondary_root, "b.jpg", b"b");
        f.run();

        fs::remove_dir_all(&f.config.storage.secondary_root).unwrap();
        let summary = f.run();
        assert_eq!(summary.tombstoned, 0);
        assert_eq!(summary.sources_skipped, 1);
        assert!(f.record(&path).is_some());
    }

    #[test]
    fn test_failed_remote_delete_keeps_row() {
        let f = fixture();
        let path = f.photo(&f.config.storage.primary_root, "a.jpg", b"a");
        f.run();
        fs::remove_file(&path).unwrap();

        f.store.set_fail_deletes(true);
        let summary = f.run();
        assert_eq!(summary.tombstone_failed, 1);
        assert!(f.record(&path).is_some());
        assert_eq!(f.db.count_deleted_backups().unwrap(), 0);

        f.store.set_fail_deletes(false);
        assert_eq!(f.run().tombstoned, 1);
        assert!(f.record(&path).is_none());
    }

    type Hook<'a> = Box<dyn Fn(&Path) -> Result<()> + 'a>;

    /// Runs a hook before each put or delete reaches the wrapped store.
    struct HookedStore<'a> {
        inner: &'a MemoryObjectStore,
        before_put: Hook<'a>,
        before_delete: Hook<'a>,
    }

    impl<'a> HookedStore<'a> {
        fn new(inner: &'a MemoryObjectStore) -> Self {
            Self {
                inner,
                before_put: Box::new(|_: &Path| Ok(())),
                before_delete: Box::new(|_: &Path| Ok(())),
            }
        }
    }

    impl ObjectStore for HookedStore<'_> {
        fn put_file(&self, key: &str, path: &Path, metadata: &ObjectMetadata) -> Result<()> {
            (self.before_put)(path)?;
            self.inner.put_file(key, path, metadata)
        }

        fn head(&self, key: &str) -> Result<Option<ObjectInfo>> {
            self.inner.head(key)
        }

        fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.inner.get(key)
        }

        fn delete(&self, key: &str) -> Result<()> {
            (self.before_delete)(Path::new(key))?;
            self.inner.delete(key)
        }

        fn bucket_name(&self) -> Option<&str> {
            self.inner.bucket_name()
        }
    }

    #[test]
    fn test_database_writable_during_remote_delete() {
        let f = fixture();
        let path = f.photo(&f.config.storage.primary_root, "a.jpg", b"a");
        f.run();
        fs::remove_file(&path).unwrap();

        let other = Database::open(&DatabaseConfig {
            sqlite_path: f._dir.path().join("index.db"),
            busy_timeout_ms: 100,
            ..Default::default()
        })
        .unwrap();
        let mut store = HookedStore::new(&f.store);
        store.before_delete = Box::new(|_: &Path| {
            other.record_backup_error(
                "/elsewhere/b.jpg",
                "internal/b.jpg",
                SourceType::Internal,
                None,
                "written during remote delete",
            )
        });
        let summary = BackupTracker::new(&f.db, &store, &f.config).run().unwrap();

        assert_eq!(summary.tombstoned, 1);
        assert_eq!(summary.tombstone_failed, 0);
        assert!(f.db.get_backup("/elsewhere/b.jpg").unwrap().is_some());
        assert!(f.store.object("internal/2024/06/15/a.jpg").is_none());
    }

    #[test]
    fn test_file_removed_before_upload_leaves_no_trace() {
        let f = fixture();
        let path = f.photo(&f.config.storage.primary_root, "a.jpg", b"a");

        let mut store = HookedStore::new(&f.store);
        store.before_put = Box::new(|path: &Path| {
            fs::remove_file(path)?;
            Ok(())
        });
        let summary = BackupTracker::new(&f.db, &store, &f.config).run().unwrap();

        assert_eq!(summary.erred, 0);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.tombstoned, 0);
        assert!(f.record(&path).is_none());
        assert_eq!(f.db.count_deleted_backups().unwrap(), 0);
        assert!(f.store.keys().is_empty());
    }

    #[test]
    fn test_remote_kept_when_configured() {
        let mut f = fixture();
        f.config.backup.delete_remote_on_removal = false;
        let path = f.photo(&f.config.storage.primary_root, "a.jpg", b"a");
        f.run();
        fs::remove_file(&path).unwrap();

        assert_eq!(f.run().tombstoned, 1);
        assert!(f.store.object("internal/2024/06/15/a.jpg").is_some());
    }

    #[test]
    fn test_audit_trail_is_complete() {
        let f = fixture();
        let root = f.config.storage.primary_root.clone();
        let paths: Vec<PathBuf> = (0..4)
            .map(|i| f.photo(&root, &format!("IMG_{i:03}.JPG"), format!("photo {i}").as_bytes()))
            .collect();
        f.run();
        let before: Vec<BackupRecord> = paths[..2].iter().map(|p| f.record(p).unwrap()).collect();

        for path in &paths[..2] {
            fs::remove_file(path).unwrap();
        }
        assert_eq!(f.run().tombstoned, 2);

        let deleted = f.db.deleted_backups().unwrap();
        assert_eq!(deleted.len(), 2);
        for original in &before {
            let row = deleted
                .iter()
                .find(|d| d.file_path == original.file_path)
                .unwrap();
            assert_eq!(row.s3_key, original.s3_key);
            assert_eq!(row.checksum, original.checksum);
            assert_eq!(row.file_size, original.file_size);
            assert_eq!(row.source_type, "internal");
            assert_eq!(row.original_status, "uploaded");
        }
        assert!(f.record(&paths[2]).is_some());
        assert!(f.record(&paths[3]).is_some());
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let f = fixture();
        let path = f.photo(&f.config.storage.primary_root, "a.jpg", b"a");

        let summary = BackupTracker::new(&f.db, &f.store, &f.config)
            .dry_run(true)
            .run()
            .unwrap();
        assert_eq!(summary.uploaded, 1);
        assert!(f.store.keys().is_empty());
        assert!(f.record(&path).is_none());

        f.run();
        fs::remove_file(&path).unwrap();
        let summary = BackupTracker::new(&f.db, &f.store, &f.config)
            .dry_run(true)
            .run()
            .unwrap();
        assert_eq!(summary.tombstoned, 1);
        assert!(f.record(&path).is_some());
        assert_eq!(f.db.count_deleted_backups().unwrap(), 0);
    }
}
