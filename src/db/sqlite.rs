//! SQLite backend implementation.

use anyhow::Result;
use chrono::Utc;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use super::assets::{AssetRecord, UpsertOutcome};
use super::backups::{
    backup_from_columns, format_timestamp, BackupRecord, DeletedBackupRecord, SourceType,
};
use super::schema::SCHEMA;
use super::{fts_query, s3_full_path};

pub struct SqliteDb {
    pub(crate) conn: Connection,
}

const BACKUP_COLUMNS: &str = "file_path, s3_key, source_type, file_size, uploaded_at, \
                              last_verified_at, checksum, status, last_error";

fn row_to_backup(row: &rusqlite::Row<'_>) -> rusqlite::Result<BackupRecord> {
    Ok(backup_from_columns(
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn row_to_asset(row: &rusqlite::Row<'_>) -> rusqlite::Result<AssetRecord> {
    Ok(AssetRecord {
        file_path: row.get(0)?,
        date_taken: row.get(1)?,
        camera_make: row.get(2)?,
        camera_model: row.get(3)?,
        lens: row.get(4)?,
        shutter_speed: row.get(5)?,
        iso: row.get(6)?,
        aperture: row.get(7)?,
        focal_length: row.get(8)?,
        metadata_json: row.get(9)?,
        created_at: row.get(10)?,
    })
}

impl SqliteDb {
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Ok(Self { conn })
    }

    pub fn initialize(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    pub fn ping(&self) -> Result<()> {
        self.conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    // ========================================================================
    // Asset operations
    // ========================================================================

    /// Paths whose every scalar attribute is already populated.
    pub fn complete_asset_paths(&self) -> Result<HashSet<String>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT file_path FROM assets
            WHERE date_taken IS NOT NULL
              AND camera_make IS NOT NULL
              AND camera_model IS NOT NULL
              AND lens IS NOT NULL
              AND shutter_speed IS NOT NULL
              AND iso IS NOT NULL
              AND aperture IS NOT NULL
              AND focal_length IS NOT NULL
            "#,
        )?;
        let paths = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<HashSet<_>>>()?;
        Ok(paths)
    }

    pub fn get_asset(&self, path: &str) -> Result<Option<AssetRecord>> {
        let result = self.conn.query_row(
            r#"
            SELECT file_path, date_taken, camera_make, camera_model, lens,
                   shutter_speed, iso, aperture, focal_length, metadata_json, created_at
            FROM assets
            WHERE file_path = ?
            "#,
            [path],
            row_to_asset,
        );
        match result {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Insert a new row, or fill the empty fields of an existing one.
    ///
    /// Populated fields are never overwritten, and a row with nothing to fill
    /// is not written at all.
    pub fn upsert_asset(&self, record: &AssetRecord) -> Result<UpsertOutcome> {
        let existing = self.get_asset(&record.file_path)?;
        if let Some(existing) = &existing {
            if !existing.would_fill(record) {
                return Ok(UpsertOutcome::Unchanged);
            }
        }

        let changed = self.conn.execute(
            r#"
            INSERT INTO assets (file_path, date_taken, camera_make, camera_model, lens,
                                shutter_speed, iso, aperture, focal_length, metadata_json, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(file_path) DO UPDATE SET
                date_taken = COALESCE(assets.date_taken, excluded.date_taken),
                camera_make = COALESCE(assets.camera_make, excluded.camera_make),
                camera_model = COALESCE(assets.camera_model, excluded.camera_model),
                lens = COALESCE(assets.lens, excluded.lens),
                shutter_speed = COALESCE(assets.shutter_speed, excluded.shutter_speed),
                iso = COALESCE(assets.iso, excluded.iso),
                aperture = COALESCE(assets.aperture, excluded.aperture),
                focal_length = COALESCE(assets.focal_length, excluded.focal_length),
                metadata_json = COALESCE(assets.metadata_json, excluded.metadata_json)
            WHERE (assets.date_taken IS NULL AND excluded.date_taken IS NOT NULL)
               OR (assets.camera_make IS NULL AND excluded.camera_make IS NOT NULL)
               OR (assets.camera_model IS NULL AND excluded.camera_model IS NOT NULL)
               OR (assets.lens IS NULL AND excluded.lens IS NOT NULL)
               OR (assets.shutter_speed IS NULL AND excluded.shutter_speed IS NOT NULL)
               OR (assets.iso IS NULL AND excluded.iso IS NOT NULL)
               OR (assets.aperture IS NULL AND excluded.aperture IS NOT NULL)
               OR (assets.focal_length IS NULL AND excluded.focal_length IS NOT NULL)
               OR (assets.metadata_json IS NULL AND excluded.metadata_json IS NOT NULL)
            "#,
            rusqlite::params![
                record.file_path,
                record.date_taken,
                record.camera_make,
                record.camera_model,
                record.lens,
                record.shutter_speed,
                record.iso,
                record.aperture,
                record.focal_length,
                record.metadata_json,
                format_timestamp(Utc::now()),
            ],
        )?;

        Ok(match (changed, existing) {
            (0, _) => UpsertOutcome::Unchanged,
            (_, None) => UpsertOutcome::Inserted,
            (_, Some(_)) => UpsertOutcome::Updated,
        })
    }

    pub fn count_assets(&self) -> Result<i64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM assets", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Full-text search over file paths and raw metadata.
    pub fn search_assets(&self, query: &str, limit: usize) -> Result<Vec<AssetRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT a.file_path, a.date_taken, a.camera_make, a.camera_model, a.lens,
                   a.shutter_speed, a.iso, a.aperture, a.focal_length, a.metadata_json, a.created_at
            FROM assets_fts
            JOIN assets a ON a.id = assets_fts.rowid
            WHERE assets_fts MATCH ?1
            ORDER BY rank
            LIMIT ?2
            "#,
        )?;
        let results = stmt
            .query_map(rusqlite::params![fts_query(query), limit as i64], row_to_asset)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(results)
    }

    // ========================================================================
    // Backup operations
    // ========================================================================

    pub fn get_backup(&self, path: &str) -> Result<Option<BackupRecord>> {
        let sql = format!("SELECT {BACKUP_COLUMNS} FROM backups WHERE file_path = ?");
        match self.conn.query_row(&sql, [path], row_to_backup) {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn backups_for_source(&self, source_type: SourceType) -> Result<Vec<BackupRecord>> {
        let sql = format!(
            "SELECT {BACKUP_COLUMNS} FROM backups WHERE source_type = ? ORDER BY file_path"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let results = stmt
            .query_map([source_type.as_str()], row_to_backup)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(results)
    }

    /// Store a successful upload. `source_type` is kept from the first sighting.
    pub fn record_upload(&self, record: &BackupRecord) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO backups (file_path, s3_key, source_type, file_size, uploaded_at,
                                 last_verified_at, checksum, status, last_error)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL)
            ON CONFLICT(file_path) DO UPDATE SET
                s3_key = excluded.s3_key,
                file_size = excluded.file_size,
                uploaded_at = excluded.uploaded_at,
                last_verified_at = excluded.last_verified_at,
                checksum = excluded.checksum,
                status = excluded.status,
                last_error = NULL
            "#,
            rusqlite::params![
                record.file_path,
                record.s3_key,
                record.source_type.as_str(),
                record.file_size,
                record.uploaded_at.map(format_timestamp),
                record.last_verified_at.map(format_timestamp),
                record.checksum,
                record.status.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Mark a file `error`, creating its row on first sighting.
    pub fn record_backup_error(
        &self,
        path: &str,
        s3_key: &str,
        source_type: SourceType,
        file_size: Option<i64>,
        error: &str,
    ) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO backups (file_path, s3_key, source_type, file_size, status, last_error)
            VALUES (?1, ?2, ?3, ?4, 'error', ?5)
            ON CONFLICT(file_path) DO UPDATE SET
                status = 'error',
                last_error = excluded.last_error
            "#,
            rusqlite::params![path, s3_key, source_type.as_str(), file_size, error],
        )?;
        Ok(())
    }

    pub fn mark_verified(&self, path: &str, at: chrono::DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "UPDATE backups SET last_verified_at = ?1 WHERE file_path = ?2",
            rusqlite::params![format_timestamp(at), path],
        )?;
        Ok(())
    }

    /// Move one backup row into the audit table.
    ///
    /// Runs under `BEGIN IMMEDIATE`, so a concurrent run blocks (up to the
    /// busy timeout) and then finds the row gone. Nothing else happens while
    /// the write lock is held.
    pub fn tombstone_backup(
        &self,
        path: &str,
        bucket: Option<&str>,
    ) -> Result<Option<DeletedBackupRecord>> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;

        let sql = format!("SELECT {BACKUP_COLUMNS} FROM backups WHERE file_path = ?");
        let record = match tx.query_row(&sql, [path], row_to_backup) {
            Ok(record) => record,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let deleted = DeletedBackupRecord {
            file_path: record.file_path.clone(),
            s3_key: record.s3_key.clone(),
            s3_full_path: bucket.map(|b| s3_full_path(b, &record.s3_key)),
            source_type: record.source_type.as_str().to_string(),
            file_size: record.file_size,
            uploaded_at: record.uploaded_at.map(format_timestamp),
            checksum: record.checksum.clone(),
            original_status: record.status.as_str().to_string(),
            deleted_at: format_timestamp(Utc::now()),
        };

        tx.execute(
            r#"
            INSERT INTO deleted_backups (file_path, s3_key, s3_full_path, source_type, file_size,
                                         uploaded_at, checksum, original_status, deleted_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            rusqlite::params![
                deleted.file_path,
                deleted.s3_key,
                deleted.s3_full_path,
                deleted.source_type,
                deleted.file_size,
                deleted.uploaded_at,
                deleted.checksum,
                deleted.original_status,
                deleted.deleted_at,
            ],
        )?;
        tx.execute("DELETE FROM backups WHERE file_path = ?", [path])?;
        tx.commit()?;
        Ok(Some(deleted))
    }

    pub fn deleted_backups(&self) -> Result<Vec<DeletedBackupRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT file_path, s3_key, s3_full_path, source_type, file_size,
                   uploaded_at, checksum, original_status, deleted_at
            FROM deleted_backups
            ORDER BY deleted_at, id
            "#,
        )?;
        let results = stmt
            .query_map([], |row| {
                Ok(DeletedBackupRecord {
                    file_path: row.get(0)?,
                    s3_key: row.get(1)?,
                    s3_full_path: row.get(2)?,
                    source_type: row.get(3)?,
                    file_size: row.get(4)?,
                    uploaded_at: row.get(5)?,
                    checksum: row.get(6)?,
                    original_status: row.get(7)?,
                    deleted_at: row.get(8)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(results)
    }

    /// `(status, count)` pairs over `backups`.
    pub fn backup_status_counts(&self) -> Result<Vec<(String, i64)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM backups GROUP BY status ORDER BY status")?;
        let results = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(results)
    }

    pub fn count_deleted_backups(&self) -> Result<i64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM deleted_backups", [], |row| row.get(0))?;
        Ok(count)
    }
}
