mod schema;
pub mod assets;
pub mod backups;
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "postgres")]
pub mod postgres_schema;

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::time::Duration;

pub use assets::{AssetRecord, UpsertOutcome};
pub use backups::{BackupRecord, BackupStatus, DeletedBackupRecord, SourceType};
pub use schema::SCHEMA;

use crate::config::DatabaseConfig;
#[cfg(feature = "postgres")]
use crate::config::DatabaseType;
use crate::error::StashError;

/// `s3://bucket/key`, as recorded in the audit trail.
pub fn s3_full_path(bucket: &str, key: &str) -> String {
    format!("s3://{bucket}/{key}")
}

/// Quote each whitespace-separated term so FTS5 treats user input literally.
fn fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Macro to dispatch a method call to the active backend variant.
macro_rules! dispatch {
    // No arguments beyond self
    ($self:expr, $method:ident()) => {
        match &$self.inner {
            DatabaseInner::Sqlite(db) => db.$method(),
            #[cfg(feature = "postgres")]
            DatabaseInner::Postgres(db) => db.$method(),
        }
    };
    // With arguments
    ($self:expr, $method:ident($($arg:expr),+ $(,)?)) => {
        match &$self.inner {
            DatabaseInner::Sqlite(db) => db.$method($($arg),+),
            #[cfg(feature = "postgres")]
            DatabaseInner::Postgres(db) => db.$method($($arg),+),
        }
    };
}

enum DatabaseInner {
    Sqlite(sqlite::SqliteDb),
    #[cfg(feature = "postgres")]
    Postgres(postgres::PgDb),
}

/// The relational store shared by the indexer and the backup tracker.
pub struct Database {
    inner: DatabaseInner,
}

impl Database {
    /// Open a database connection based on the provided configuration.
    ///
    /// Any failure here is reported as [`StashError::StoreUnavailable`].
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        #[cfg(feature = "postgres")]
        {
            if config.backend == DatabaseType::Postgresql {
                let url = config
                    .postgresql_url
                    .as_deref()
                    .ok_or_else(|| StashError::Config("PostgreSQL URL not configured".into()))?;
                let pool_size = config.pool_size.unwrap_or(4);
                let pg = postgres::PgDb::open(url, pool_size)
                    .map_err(|e| StashError::StoreUnavailable(e.to_string()))?;
                return Ok(Self { inner: DatabaseInner::Postgres(pg) });
            }
        }

        let db = sqlite::SqliteDb::open(
            &config.sqlite_path,
            Duration::from_millis(config.busy_timeout_ms),
        )
        .map_err(|e| {
            StashError::StoreUnavailable(format!("{}: {}", config.sqlite_path.display(), e))
        })?;
        Ok(Self { inner: DatabaseInner::Sqlite(db) })
    }

    pub fn initialize(&self) -> Result<()> {
        dispatch!(self, initialize())
    }

    /// Round-trip a trivial query to prove the store is reachable.
    pub fn ping(&self) -> Result<()> {
        dispatch!(self, ping())
    }

    // ========================================================================
    // Asset operations
    // ========================================================================

    pub fn complete_asset_paths(&self) -> Result<HashSet<String>> {
        dispatch!(self, complete_asset_paths())
    }

    pub fn get_asset(&self, path: &str) -> Result<Option<AssetRecord>> {
        dispatch!(self, get_asset(path))
    }

    pub fn upsert_asset(&self, record: &AssetRecord) -> Result<UpsertOutcome> {
        dispatch!(self, upsert_asset(record))
    }

    pub fn count_assets(&self) -> Result<i64> {
        dispatch!(self, count_assets())
    }

    pub fn search_assets(&self, query: &str, limit: usize) -> Result<Vec<AssetRecord>> {
        dispatch!(self, search_assets(query, limit))
    }

    // ========================================================================
    // Backup operations
    // ========================================================================

    pub fn get_backup(&self, path: &str) -> Result<Option<BackupRecord>> {
        dispatch!(self, get_backup(path))
    }

    pub fn backups_for_source(&self, source_type: SourceType) -> Result<Vec<BackupRecord>> {
        dispatch!(self, backups_for_source(source_type))
    }

    pub fn record_upload(&self, record: &BackupRecord) -> Result<()> {
        dispatch!(self, record_upload(record))
    }

    pub fn record_backup_error(
        &self,
        path: &str,
        s3_key: &str,
        source_type: SourceType,
        file_size: Option<i64>,
        error: &str,
    ) -> Result<()> {
        dispatch!(self, record_backup_error(path, s3_key, source_type, file_size, error))
    }

    pub fn mark_verified(&self, path: &str, at: DateTime<Utc>) -> Result<()> {
        dispatch!(self, mark_verified(path, at))
    }

    /// Atomically move a backup row to `deleted_backups`.
    ///
    /// Returns `None` when the row no longer exists (another run moved it).
    /// The transaction covers only the two row writes; remote side effects
    /// belong before the call.
    pub fn tombstone_backup(
        &self,
        path: &str,
        bucket: Option<&str>,
    ) -> Result<Option<DeletedBackupRecord>> {
        dispatch!(self, tombstone_backup(path, bucket))
    }

    pub fn deleted_backups(&self) -> Result<Vec<DeletedBackupRecord>> {
        dispatch!(self, deleted_backups())
    }

    pub fn backup_status_counts(&self) -> Result<Vec<(String, i64)>> {
        dispatch!(self, backup_status_counts())
    }

    pub fn count_deleted_backups(&self) -> Result<i64> {
        dispatch!(self, count_deleted_backups())
    }
}
