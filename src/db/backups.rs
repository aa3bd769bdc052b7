//! Types for backup tracking and the deletion audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which corpus root a file was found under. Fixed at first sighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Internal,
    External,
    ImmichUpload,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Internal => "internal",
            SourceType::External => "external",
            SourceType::ImmichUpload => "immich_upload",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "internal" => Some(SourceType::Internal),
            "external" => Some(SourceType::External),
            "immich_upload" => Some(SourceType::ImmichUpload),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Uploaded,
    Error,
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::Uploaded => "uploaded",
            BackupStatus::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "uploaded" => Some(BackupStatus::Uploaded),
            "error" => Some(BackupStatus::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackupRecord {
    pub file_path: String,
    pub s3_key: String,
    pub source_type: SourceType,
    pub file_size: Option<i64>,
    pub uploaded_at: Option<DateTime<Utc>>,
    pub last_verified_at: Option<DateTime<Utc>>,
    pub checksum: Option<String>,
    pub status: BackupStatus,
    pub last_error: Option<String>,
}

/// A backup row moved out of `backups` because its file disappeared.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeletedBackupRecord {
    pub file_path: String,
    pub s3_key: String,
    pub s3_full_path: Option<String>,
    pub source_type: String,
    pub file_size: Option<i64>,
    pub uploaded_at: Option<String>,
    pub checksum: Option<String>,
    pub original_status: String,
    pub deleted_at: String,
}

/// Store-side timestamp format.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub fn parse_timestamp(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Rebuild a record from raw column values shared by both backends.
#[allow(clippy::too_many_arguments)]
pub(crate) fn backup_from_columns(
    file_path: String,
    s3_key: String,
    source_type: String,
    file_size: Option<i64>,
    uploaded_at: Option<String>,
    last_verified_at: Option<String>,
    checksum: Option<String>,
    status: String,
    last_error: Option<String>,
) -> BackupRecord {
    BackupRecord {
        file_path,
        s3_key,
        // Unknown values only appear if the table was edited by hand.
        source_type: SourceType::from_str(&source_type).unwrap_or(SourceType::Internal),
        file_size,
        uploaded_at: parse_timestamp(uploaded_at),
        last_verified_at: parse_timestamp(last_verified_at),
        checksum,
        status: BackupStatus::from_str(&status).unwrap_or(BackupStatus::Error),
        last_error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_source_type_round_trips_through_store_names() {
        for st in [SourceType::Internal, SourceType::External, SourceType::ImmichUpload] {
            assert_eq!(SourceType::from_str(st.as_str()), Some(st));
        }
        assert_eq!(SourceType::from_str("nas"), None);
    }

    #[test]
    fn test_timestamp_format_parses_back() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 9, 12, 30, 0).unwrap();
        assert_eq!(parse_timestamp(Some(format_timestamp(ts))), Some(ts));
        assert_eq!(parse_timestamp(Some("yesterday".into())), None);
    }

    #[test]
    fn test_unknown_status_reads_as_error() {
        let record = backup_from_columns(
            "/a".into(),
            "internal/a".into(),
            "internal".into(),
            None,
            None,
            None,
            None,
            "pending".into(),
            None,
        );
        assert_eq!(record.status, BackupStatus::Error);
    }
}
