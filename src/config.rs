use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::backup::SourceType;
use crate::error::StashError;

pub const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub scanner: ScannerConfig,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub indexer: IndexerConfig,

    #[serde(default)]
    pub backup: BackupConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Fast internal tier.
    #[serde(default = "default_primary_root")]
    pub primary_root: PathBuf,

    /// Overflow tier, usually an external disk.
    #[serde(default = "default_secondary_root")]
    pub secondary_root: PathBuf,

    /// Logical root spanning both tiers (e.g. a union mount). When it exists
    /// it is the tree searched for duplicates; otherwise both tier roots are.
    #[serde(default)]
    pub unified_root: Option<PathBuf>,

    /// Directory where the photo application stores files uploaded through its UI.
    #[serde(default = "default_upload_root")]
    pub upload_root: PathBuf,

    /// Below this many free bytes on the primary tier, new files go to the secondary tier.
    #[serde(default = "default_min_free_bytes")]
    pub min_free_bytes: u64,
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn default_primary_root() -> PathBuf {
    home_dir().join("images")
}

fn default_secondary_root() -> PathBuf {
    PathBuf::from("/mnt/external-storage/images")
}

fn default_upload_root() -> PathBuf {
    home_dir().join("immich-library").join("upload")
}

fn default_min_free_bytes() -> u64 {
    10 * GIB
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            primary_root: default_primary_root(),
            secondary_root: default_secondary_root(),
            unified_root: None,
            upload_root: default_upload_root(),
            min_free_bytes: default_min_free_bytes(),
        }
    }
}

impl StorageConfig {
    /// Roots searched for existing names when deduplicating.
    pub fn corpus_roots(&self) -> Vec<PathBuf> {
        if let Some(unified) = &self.unified_root {
            if unified.is_dir() {
                return vec![unified.clone()];
            }
        }
        vec![self.primary_root.clone(), self.secondary_root.clone()]
    }

    /// Tier roots scanned by the indexer.
    pub fn tier_roots(&self) -> Vec<PathBuf> {
        vec![self.primary_root.clone(), self.secondary_root.clone()]
    }

    /// Backup sources in scan order, tagged with their source type.
    pub fn backup_sources(&self) -> Vec<(SourceType, PathBuf)> {
        vec![
            (SourceType::Internal, self.primary_root.clone()),
            (SourceType::External, self.secondary_root.clone()),
            (SourceType::ImmichUpload, self.upload_root.clone()),
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,

    /// Directory names never descended into (photo-application generated content).
    #[serde(default = "default_exclude_dirs")]
    pub exclude_dirs: Vec<String>,
}

fn default_image_extensions() -> Vec<String> {
    ["jpg", "jpeg", "raw", "cr2", "nef", "arw", "dng", "tif", "tiff", "png", "raf"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_exclude_dirs() -> Vec<String> {
    ["library", "thumbs", "encoded-video", "profiles", "backups"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            image_extensions: default_image_extensions(),
            exclude_dirs: default_exclude_dirs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_lock_path")]
    pub lock_path: PathBuf,

    /// Directories under which removable volumes get mounted.
    #[serde(default = "default_mount_bases")]
    pub mount_bases: Vec<PathBuf>,

    /// Mount table consulted to tell a mounted volume from an empty directory.
    #[serde(default = "default_mount_table")]
    pub mount_table: PathBuf,

    #[serde(default = "default_mount_attempts")]
    pub mount_attempts: u32,

    #[serde(default = "default_mount_interval_ms")]
    pub mount_interval_ms: u64,

    /// Camera image directory searched first on the source volume.
    #[serde(default = "default_camera_dir")]
    pub camera_dir: String,

    #[serde(default = "default_eject")]
    pub eject: bool,
}

fn default_lock_path() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("photostash-ingest.lock")
}

fn default_mount_bases() -> Vec<PathBuf> {
    match std::env::var("USER") {
        Ok(user) if !user.is_empty() => vec![
            PathBuf::from("/media").join(&user),
            PathBuf::from("/run/media").join(&user),
        ],
        _ => vec![PathBuf::from("/media"), PathBuf::from("/run/media")],
    }
}

fn default_mount_table() -> PathBuf {
    PathBuf::from("/proc/self/mounts")
}

fn default_mount_attempts() -> u32 {
    10
}

fn default_mount_interval_ms() -> u64 {
    1000
}

fn default_camera_dir() -> String {
    "DCIM".to_string()
}

fn default_eject() -> bool {
    true
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            lock_path: default_lock_path(),
            mount_bases: default_mount_bases(),
            mount_table: default_mount_table(),
            mount_attempts: default_mount_attempts(),
            mount_interval_ms: default_mount_interval_ms(),
            camera_dir: default_camera_dir(),
            eject: default_eject(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExtractorKind {
    /// In-process EXIF reader.
    #[default]
    Exif,
    /// `exiftool -j` subprocess.
    Exiftool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum files processed per run, 0 for no limit.
    #[serde(default)]
    pub limit: usize,

    #[serde(default)]
    pub extractor: ExtractorKind,

    #[serde(default = "default_exiftool_timeout_secs")]
    pub exiftool_timeout_secs: u64,
}

fn default_batch_size() -> usize {
    50
}

fn default_exiftool_timeout_secs() -> u64 {
    10
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            limit: 0,
            extractor: ExtractorKind::default(),
            exiftool_timeout_secs: default_exiftool_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default)]
    pub bucket: Option<String>,

    #[serde(default = "default_region")]
    pub region: String,

    /// Defaults to the regional AWS endpoint.
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default = "default_storage_class")]
    pub storage_class: String,

    /// Uploaded records older than this are re-verified against the remote checksum.
    #[serde(default = "default_verify_window_days")]
    pub verify_window_days: u32,

    /// Remove the remote object when its source file disappears.
    #[serde(default = "default_delete_remote")]
    pub delete_remote_on_removal: bool,

    #[serde(default)]
    pub access_key_id: Option<String>,

    #[serde(default)]
    pub secret_access_key: Option<String>,

    /// Files at least this large are sent as a multipart upload.
    #[serde(default = "default_multipart_threshold_bytes")]
    pub multipart_threshold_bytes: u64,

    /// Size of each multipart part, raised as needed to stay within 10,000 parts.
    #[serde(default = "default_multipart_part_bytes")]
    pub multipart_part_bytes: u64,

    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_storage_class() -> String {
    "DEEP_ARCHIVE".to_string()
}

fn default_verify_window_days() -> u32 {
    30
}

fn default_delete_remote() -> bool {
    true
}

fn default_multipart_threshold_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_multipart_part_bytes() -> u64 {
    64 * 1024 * 1024
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            bucket: None,
            region: default_region(),
            endpoint: None,
            storage_class: default_storage_class(),
            verify_window_days: default_verify_window_days(),
            delete_remote_on_removal: default_delete_remote(),
            access_key_id: None,
            secret_access_key: None,
            multipart_threshold_bytes: default_multipart_threshold_bytes(),
            multipart_part_bytes: default_multipart_part_bytes(),
            retry: RetryConfig::default(),
        }
    }
}

impl BackupConfig {
    pub fn endpoint_url(&self) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| format!("https://s3.{}.amazonaws.com", self.region))
    }

    pub fn verify_window(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.verify_window_days))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries).
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    /// Initial delay between retries in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

fn default_max_retries() -> usize {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    #[default]
    Sqlite,
    Postgresql,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub backend: DatabaseType,

    #[serde(default = "default_db_path")]
    pub sqlite_path: PathBuf,

    #[serde(default)]
    pub postgresql_url: Option<String>,

    #[serde(default)]
    pub pool_size: Option<u32>,

    /// How long a writer waits on a locked SQLite database.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("photostash")
        .join("photostash.db")
}

fn default_busy_timeout_ms() -> u64 {
    30_000
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: DatabaseType::default(),
            sqlite_path: default_db_path(),
            postgresql_url: None,
            pool_size: None,
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Start hour for daemon hours of operation (0-23).
    #[serde(default)]
    pub hours_start: Option<u8>,

    /// End hour for daemon hours of operation (0-23).
    #[serde(default)]
    pub hours_end: Option<u8>,
}

impl Config {
    /// Load from the default location, falling back to defaults when no file exists.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            toml::from_str::<Config>(&content)
                .map_err(|e| StashError::Config(format!("{}: {}", path.display(), e)))?
        } else {
            Config::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("PHOTOSTASH_CONFIG") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("photostash")
    }

    /// Apply `PHOTOSTASH_*` overrides on top of the file values.
    pub fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = var("PHOTOSTASH_PRIMARY_ROOT") {
            self.storage.primary_root = PathBuf::from(v);
        }
        if let Some(v) = var("PHOTOSTASH_SECONDARY_ROOT") {
            self.storage.secondary_root = PathBuf::from(v);
        }
        if let Some(v) = var("PHOTOSTASH_UNIFIED_ROOT") {
            self.storage.unified_root = Some(PathBuf::from(v));
        }
        if let Some(v) = var("PHOTOSTASH_UPLOAD_ROOT") {
            self.storage.upload_root = PathBuf::from(v);
        }
        if let Some(v) = var("PHOTOSTASH_MIN_FREE_BYTES") {
            self.storage.min_free_bytes = v.trim().parse().map_err(|_| {
                StashError::Config(format!("PHOTOSTASH_MIN_FREE_BYTES is not a byte count: {v}"))
            })?;
        }
        if let Some(v) = var("PHOTOSTASH_S3_BUCKET") {
            self.backup.bucket = Some(v);
        }
        if let Some(v) = var("PHOTOSTASH_S3_REGION") {
            self.backup.region = v;
        }
        if let Some(v) = var("PHOTOSTASH_S3_ENDPOINT") {
            self.backup.endpoint = Some(v);
        }
        if let Some(v) = var("PHOTOSTASH_VERIFY_WINDOW_DAYS") {
            self.backup.verify_window_days = v.trim().parse().map_err(|_| {
                StashError::Config(format!("PHOTOSTASH_VERIFY_WINDOW_DAYS is not a number: {v}"))
            })?;
        }
        if let Some(v) = var("PHOTOSTASH_DATABASE_URL") {
            self.database.backend = DatabaseType::Postgresql;
            self.database.postgresql_url = Some(v);
        }
        Ok(())
    }
}
