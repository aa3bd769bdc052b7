use anyhow::Result;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::{tempdir, TempDir};

use photostash::backup::{BackupStatus, BackupTracker, MemoryObjectStore};
use photostash::config::Config;
use photostash::db::Database;
use photostash::indexer::{IndexOptions, Indexer, MetadataExtractor, RawMetadata};
use photostash::ingest::{IngestOptions, IngestOutcome, Ingestor};
use photostash::schedule::wait_for_database;
use photostash::wait::WaitPolicy;

/// Every file is a Fujifilm frame taken at the date in its name.
struct CameraExtractor;

impl MetadataExtractor for CameraExtractor {
    fn extract(&self, _path: &Path) -> Result<RawMetadata> {
        let value = json!({
            "DateTimeOriginal": "2024:06:15 10:30:00",
            "Make": "FUJIFILM",
            "Model": "X-T5",
            "LensModel": "XF23mmF2 R WR",
            "ExposureTime": "1/250",
            "ISO": 200,
            "FNumber": 2.8,
            "FocalLength": "23.0 mm"
        });
        match value {
            serde_json::Value::Object(map) => Ok(map),
            _ => unreachable!(),
        }
    }
}

struct Setup {
    _dir: TempDir,
    config: Config,
    card: PathBuf,
}

fn setup() -> Setup {
    let dir = tempdir().unwrap();
    let card = dir.path().join("card");
    fs::create_dir_all(card.join("DCIM/100_FUJI")).unwrap();

    let mut config = Config::default();
    config.storage.primary_root = dir.path().join("images");
    config.storage.secondary_root = dir.path().join("external");
    config.storage.upload_root = dir.path().join("upload");
    config.storage.unified_root = None;
    config.storage.min_free_bytes = 0;
    config.ingest.lock_path = dir.path().join("ingest.lock");
    config.ingest.mount_table = dir.path().join("mounts");
    config.ingest.mount_attempts = 1;
    config.ingest.mount_interval_ms = 1;
    config.database.sqlite_path = dir.path().join("photostash.db");
    fs::create_dir_all(&config.storage.primary_root).unwrap();
    fs::write(&config.ingest.mount_table, "").unwrap();

    Setup {
        _dir: dir,
        config,
        card,
    }
}

fn ingest(setup: &Setup) -> IngestOutcome {
    Ingestor::new(&setup.config)
        .run(&IngestOptions {
            source: Some(setup.card.clone()),
            no_eject: true,
            fallback_date: None,
        })
        .unwrap()
}

fn open_db(config: &Config) -> Database {
    wait_for_database(&config.database, WaitPolicy::new(1, Duration::ZERO)).unwrap()
}

#[test]
fn test_card_to_backup() {
    let setup = setup();
    let camera = setup.card.join("DCIM/100_FUJI");
    fs::write(camera.join("DSCF_20240615_0001.RAF"), b"raw one").unwrap();
    fs::write(camera.join("DSCF_20240615_0002.JPG"), b"jpeg two").unwrap();

    let IngestOutcome::Completed(summary) = ingest(&setup) else {
        panic!("ingestion did not complete");
    };
    assert_eq!(summary.copied, 2);

    let dated = setup.config.storage.primary_root.join("2024/06/15");
    assert!(dated.join("DSCF_20240615_0001.RAF").is_file());
    assert!(dated.join("DSCF_20240615_0002.JPG").is_file());

    let db = open_db(&setup.config);
    let extractor = CameraExtractor;
    let indexer = Indexer::new(&db, &extractor, &setup.config.scanner);
    let roots = setup.config.storage.tier_roots();
    let index = indexer.run(&roots, IndexOptions::from_config(&setup.config)).unwrap();
    assert_eq!(index.inserted, 2);
    assert_eq!(db.count_assets().unwrap(), 2);

    let store = MemoryObjectStore::new("family-archive");
    let backup = BackupTracker::new(&db, &store, &setup.config).run().unwrap();
    assert_eq!(backup.uploaded, 2);
    assert_eq!(
        store.keys(),
        vec![
            "internal/2024/06/15/DSCF_20240615_0001.RAF".to_string(),
            "internal/2024/06/15/DSCF_20240615_0002.JPG".to_string(),
        ]
    );

    // Re-inserting the same card changes nothing anywhere.
    let IngestOutcome::Completed(again) = ingest(&setup) else {
        panic!("second ingestion did not complete");
    };
    assert_eq!(again.copied, 0);
    assert_eq!(again.skipped, 2);
    assert_eq!(indexer.run(&roots, IndexOptions::from_config(&setup.config)).unwrap().writes(), 0);
    let backup = BackupTracker::new(&db, &store, &setup.config).run().unwrap();
    assert_eq!(backup.uploaded, 0);
    assert_eq!(backup.skipped, 2);

    // Deleting a photo from the library tombstones its backup.
    let removed = dated.join("DSCF_20240615_0001.RAF");
    fs::remove_file(&removed).unwrap();
    let backup = BackupTracker::new(&db, &store, &setup.config).run().unwrap();
    assert_eq!(backup.tombstoned, 1);
    assert!(db.get_backup(&removed.to_string_lossy()).unwrap().is_none());

    let deleted = db.deleted_backups().unwrap();
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0].original_status, BackupStatus::Uploaded.as_str());
    assert_eq!(store.keys().len(), 1);

    // The index keeps its rows; it never deletes.
    assert_eq!(db.count_assets().unwrap(), 2);
}

#[test]
fn test_missing_card_touches_nothing() {
    let setup = setup();
    fs::remove_dir_all(&setup.card).unwrap();

    assert!(matches!(ingest(&setup), IngestOutcome::NoSource));
    assert!(fs::read_dir(&setup.config.storage.primary_root)
        .unwrap()
        .next()
        .is_none());
    assert!(!setup.config.ingest.lock_path.exists());
}
