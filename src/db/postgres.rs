//! PostgreSQL backend implementation.

use anyhow::Result;
use chrono::Utc;
use postgres::NoTls;
use r2d2::Pool;
use r2d2_postgres::PostgresConnectionManager;
use std::collections::HashSet;

use super::assets::{AssetRecord, UpsertOutcome};
use super::backups::{
    backup_from_columns, format_timestamp, BackupRecord, DeletedBackupRecord, SourceType,
};
use super::postgres_schema::POSTGRES_SCHEMA;
use super::s3_full_path;

pub struct PgDb {
    pool: Pool<PostgresConnectionManager<NoTls>>,
}

const BACKUP_COLUMNS: &str = "file_path, s3_key, source_type, file_size, uploaded_at, \
                              last_verified_at, checksum, status, last_error";

const ASSET_COLUMNS: &str = "file_path, date_taken, camera_make, camera_model, lens, \
                             shutter_speed, iso, aperture, focal_length, metadata_json::text, created_at";

fn row_to_backup(row: &postgres::Row) -> BackupRecord {
    backup_from_columns(
        row.get(0),
        row.get(1),
        row.get(2),
        row.get(3),
        row.get(4),
        row.get(5),
        row.get(6),
        row.get(7),
        row.get(8),
    )
}

fn row_to_asset(row: &postgres::Row) -> AssetRecord {
    AssetRecord {
        file_path: row.get(0),
        date_taken: row.get(1),
        camera_make: row.get(2),
        camera_model: row.get(3),
        lens: row.get(4),
        shutter_speed: row.get(5),
        iso: row.get(6),
        aperture: row.get(7),
        focal_length: row.get(8),
        metadata_json: row.get(9),
        created_at: row.get(10),
    }
}

impl PgDb {
    pub fn open(url: &str, pool_size: u32) -> Result<Self> {
        let manager = PostgresConnectionManager::new(url.parse()?, NoTls);
        let pool = Pool::builder()
            .max_size(pool_size)
            .build(manager)?;
        Ok(Self { pool })
    }

    pub fn initialize(&self) -> Result<()> {
        let mut client = self.pool.get()?;
        client.batch_execute(POSTGRES_SCHEMA)?;
        Ok(())
    }

    pub fn ping(&self) -> Result<()> {
        let mut client = self.pool.get()?;
        client.query_one("SELECT 1", &[])?;
        Ok(())
    }

    // ========================================================================
    // Asset operations
    // ========================================================================

    pub fn complete_asset_paths(&self) -> Result<HashSet<String>> {
        let mut client = self.pool.get()?;
        let rows = client.query(
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
            &[],
        )?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    pub fn get_asset(&self, path: &str) -> Result<Option<AssetRecord>> {
        let mut client = self.pool.get()?;
        let sql = format!("SELECT {ASSET_COLUMNS} FROM assets WHERE file_path = $1");
        let row = client.query_opt(&sql, &[&path])?;
        Ok(row.as_ref().map(row_to_asset))
    }

    pub fn upsert_asset(&self, record: &AssetRecord) -> Result<UpsertOutcome> {
        let existing = self.get_asset(&record.file_path)?;
        if let Some(existing) = &existing {
            if !existing.would_fill(record) {
                return Ok(UpsertOutcome::Unchanged);
            }
        }

        let mut client = self.pool.get()?;
        let changed = client.execute(
            r#"
            INSERT INTO assets (file_path, date_taken, camera_make, camera_model, lens,
                                shutter_speed, iso, aperture, focal_length, metadata_json, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10::text::jsonb, $11)
            ON CONFLICT (file_path) DO UPDATE SET
                date_taken = COALESCE(assets.date_taken, EXCLUDED.date_taken),
                camera_make = COALESCE(assets.camera_make, EXCLUDED.camera_make),
                camera_model = COALESCE(assets.camera_model, EXCLUDED.camera_model),
                lens = COALESCE(assets.lens, EXCLUDED.lens),
                shutter_speed = COALESCE(assets.shutter_speed, EXCLUDED.shutter_speed),
                iso = COALESCE(assets.iso, EXCLUDED.iso),
                aperture = COALESCE(assets.aperture, EXCLUDED.aperture),
                focal_length = COALESCE(assets.focal_length, EXCLUDED.focal_length),
                metadata_json = COALESCE(assets.metadata_json, EXCLUDED.metadata_json)
            WHERE (assets.date_taken IS NULL AND EXCLUDED.date_taken IS NOT NULL)
               OR (assets.camera_make IS NULL AND EXCLUDED.camera_make IS NOT NULL)
               OR (assets.camera_model IS NULL AND EXCLUDED.camera_model IS NOT NULL)
               OR (assets.lens IS NULL AND EXCLUDED.lens IS NOT NULL)
               OR (assets.shutter_speed IS NULL AND EXCLUDED.shutter_speed IS NOT NULL)
               OR (assets.iso IS NULL AND EXCLUDED.iso IS NOT NULL)
               OR (assets.aperture IS NULL AND EXCLUDED.aperture IS NOT NULL)
               OR (assets.focal_length IS NULL AND EXCLUDED.focal_length IS NOT NULL)
               OR (assets.metadata_json IS NULL AND EXCLUDED.metadata_json IS NOT NULL)
            "#,
            &[
                &record.file_path,
                &record.date_taken,
                &record.camera_make,
                &record.camera_model,
                &record.lens,
                &record.shutter_speed,
                &record.iso,
                &record.aperture,
                &record.focal_length,
                &record.metadata_json,
                &format_timestamp(Utc::now()),
            ],
        )?;

        Ok(match (changed, existing) {
            (0, _) => UpsertOutcome::Unchanged,
            (_, None) => UpsertOutcome::Inserted,
            (_, Some(_)) => UpsertOutcome::Updated,
        })
    }

    pub fn count_assets(&self) -> Result<i64> {
        let mut client = self.pool.get()?;
        let row = client.query_one("SELECT COUNT(*) FROM assets", &[])?;
        Ok(row.get(0))
    }

    pub fn search_assets(&self, query: &str, limit: usize) -> Result<Vec<AssetRecord>> {
        let mut client = self.pool.get()?;
        let sql = format!(
            r#"
            SELECT {ASSET_COLUMNS} FROM assets
            WHERE to_tsvector('simple', file_path || ' ' || COALESCE(metadata_json::text, ''))
                  @@ plainto_tsquery('simple', $1)
            ORDER BY file_path
            LIMIT $2
            "#
        );
        let rows = client.query(&sql, &[&query, &(limit as i64)])?;
        Ok(rows.iter().map(row_to_asset).collect())
    }

    // ========================================================================
    // Backup operations
    // ========================================================================

    pub fn get_backup(&self, path: &str) -> Result<Option<BackupRecord>> {
        let mut client = self.pool.get()?;
        let sql = format!("SELECT {BACKUP_COLUMNS} FROM backups WHERE file_path = $1");
        let row = client.query_opt(&sql, &[&path])?;
        Ok(row.as_ref().map(row_to_backup))
    }

    pub fn backups_for_source(&self, source_type: SourceType) -> Result<Vec<BackupRecord>> {
        let mut client = self.pool.get()?;
        let sql = format!(
            "SELECT {BACKUP_COLUMNS} FROM backups WHERE source_type = $1 ORDER BY file_path"
        );
        let rows = client.query(&sql, &[&source_type.as_str()])?;
        Ok(rows.iter().map(row_to_backup).collect())
    }

    pub fn record_upload(&self, record: &BackupRecord) -> Result<()> {
        let mut client = self.pool.get()?;
        client.execute(
            r#"
            INSERT INTO backups (file_path, s3_key, source_type, file_size, uploaded_at,
                                 last_verified_at, checksum, status, last_error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NULL)
            ON CONFLICT (file_path) DO UPDATE SET
                s3_key = EXCLUDED.s3_key,
                file_size = EXCLUDED.file_size,
                uploaded_at = EXCLUDED.uploaded_at,
                last_verified_at = EXCLUDED.last_verified_at,
                checksum = EXCLUDED.checksum,
                status = EXCLUDED.status,
                last_error = NULL
            "#,
            &[
                &record.file_path,
                &record.s3_key,
                &record.source_type.as_str(),
                &record.file_size,
                &record.uploaded_at.map(format_timestamp),
                &record.last_verified_at.map(format_timestamp),
                &record.checksum,
                &record.status.as_str(),
            ],
        )?;
        Ok(())
    }

    pub fn record_backup_error(
        &self,
        path: &str,
        s3_key: &str,
        source_type: SourceType,
        file_size: Option<i64>,
        error: &str,
    ) -> Result<()> {
        let mut client = self.pool.get()?;
        client.execute(
            r#"
            INSERT INTO backups (file_path, s3_key, source_type, file_size, status, last_error)
            VALUES ($1, $2, $3, $4, 'error', $5)
            ON CONFLICT (file_path) DO UPDATE SET
                status = 'error',
                last_error = EXCLUDED.last_error
            "#,
            &[&path, &s3_key, &source_type.as_str(), &file_size, &error],
        )?;
        Ok(())
    }

    pub fn mark_verified(&self, path: &str, at: chrono::DateTime<Utc>) -> Result<()> {
        let mut client = self.pool.get()?;
        client.execute(
            "UPDATE backups SET last_verified_at = $1 WHERE file_path = $2",
            &[&format_timestamp(at), &path],
        )?;
        Ok(())
    }

    /// Row-locked variant of the SQLite move: `FOR UPDATE` makes a concurrent
    /// run wait for our commit and then see no row.
    pub fn tombstone_backup(
        &self,
        path: &str,
        bucket: Option<&str>,
    ) -> Result<Option<DeletedBackupRecord>> {
        let mut client = self.pool.get()?;
        let mut tx = client.transaction()?;

        let sql = format!("SELECT {BACKUP_COLUMNS} FROM backups WHERE file_path = $1 FOR UPDATE");
        let record = match tx.query_opt(&sql, &[&path])? {
            Some(row) => row_to_backup(&row),
            None => return Ok(None),
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
            &[
                &deleted.file_path,
                &deleted.s3_key,
                &deleted.s3_full_path,
                &deleted.source_type,
                &deleted.file_size,
                &deleted.uploaded_at,
                &deleted.checksum,
                &deleted.original_status,
                &deleted.deleted_at,
            ],
        )?;
        tx.execute("DELETE FROM backups WHERE file_path = $1", &[&path])?;
        tx.commit()?;
        Ok(Some(deleted))
    }

    pub fn deleted_backups(&self) -> Result<Vec<DeletedBackupRecord>> {
        let mut client = self.pool.get()?;
        let rows = client.query(
            r#"
            SELECT file_path, s3_key, s3_full_path, source_type, file_size,
                   uploaded_at, checksum, original_status, deleted_at
            FROM deleted_backups
            ORDER BY deleted_at, id
            "#,
            &[],
        )?;
        Ok(rows
            .iter()
            .map(|row| DeletedBackupRecord {
                file_path: row.get(0),
                s3_key: row.get(1),
                s3_full_path: row.get(2),
                source_type: row.get(3),
                file_size: row.get(4),
                uploaded_at: row.get(5),
                checksum: row.get(6),
                original_status: row.get(7),
                deleted_at: row.get(8),
            })
            .collect())
    }

    pub fn backup_status_counts(&self) -> Result<Vec<(String, i64)>> {
        let mut client = self.pool.get()?;
        let rows = client.query(
            "SELECT status, COUNT(*) FROM backups GROUP BY status ORDER BY status",
            &[],
        )?;
        Ok(rows.iter().map(|row| (row.get(0), row.get(1))).collect())
    }

    pub fn count_deleted_backups(&self) -> Result<i64> {
        let mut client = self.pool.get()?;
        let row = client.query_one("SELECT COUNT(*) FROM deleted_backups", &[])?;
        Ok(row.get(0))
    }
}
