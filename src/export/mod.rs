use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::db::{Database, DeletedBackupRecord};

/// Export format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExportFormat::Json => "JSON",
            ExportFormat::Csv => "CSV",
        }
    }
}

/// Where an export to `requested` lands: a directory gets a
/// `deleted_backups.<ext>` file inside it, anything else is used as given.
pub fn resolve_output_path(requested: &Path, format: ExportFormat) -> PathBuf {
    if requested.is_dir() {
        requested.join(format!("deleted_backups.{}", format.extension()))
    } else {
        requested.to_path_buf()
    }
}

/// Export the deletion audit trail to `output_path`, or stdout when `None`.
pub fn export_deleted_backups(
    db: &Database,
    output_path: Option<&Path>,
    format: ExportFormat,
) -> Result<usize> {
    let records = db.deleted_backups()?;
    let count = records.len();

    match output_path {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            write_records(&records, BufWriter::new(file), format)?;
        }
        None => write_records(&records, std::io::stdout().lock(), format)?,
    }

    Ok(count)
}

pub fn write_records<W: Write>(records: &[DeletedBackupRecord], writer: W, format: ExportFormat) -> Result<()> {
    match format {
        ExportFormat::Json => write_json(records, writer),
        ExportFormat::Csv => write_csv(records, writer),
    }
}

fn write_json<W: Write>(records: &[DeletedBackupRecord], mut writer: W) -> Result<()> {
    serde_json::to_writer_pretty(&mut writer, records)?;
    writeln!(writer)?;
    writer.flush()?;
    Ok(())
}

fn write_csv<W: Write>(records: &[DeletedBackupRecord], writer: W) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);

    wtr.write_record([
        "file_path",
        "s3_key",
        "s3_full_path",
        "source_type",
        "file_size",
        "uploaded_at",
        "checksum",
        "original_status",
        "deleted_at",
    ])?;

    for record in records {
        wtr.write_record([
            record.file_path.as_str(),
            record.s3_key.as_str(),
            record.s3_full_path.as_deref().unwrap_or(""),
            record.source_type.as_str(),
            &record.file_size.map(|v| v.to_string()).unwrap_or_default(),
            record.uploaded_at.as_deref().unwrap_or(""),
            record.checksum.as_deref().unwrap_or(""),
            record.original_status.as_str(),
            record.deleted_at.as_str(),
        ])?;
    }

    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<DeletedBackupRecord> {
        vec![DeletedBackupRecord {
            file_path: "/srv/images/2024/06/15/a, b.jpg".to_string(),
            s3_key: "internal/2024/06/15/a, b.jpg".to_string(),
            s3_full_path: Some("s3://archive/internal/2024/06/15/a, b.jpg".to_string()),
            source_type: "internal".to_string(),
            file_size: Some(2048),
            uploaded_at: Some("2024-06-15T10:30:00+00:00".to_string()),
            checksum: None,
            original_status: "error".to_string(),
            deleted_at: "2024-07-01T08:00:00+00:00".to_string(),
        }]
    }

    #[test]
    fn test_csv_has_header_and_quotes_commas() {
        let mut out = Vec::new();
        write_records(&sample(), &mut out, ExportFormat::Csv).unwrap();
        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "file_path,s3_key,s3_full_path,source_type,file_size,uploaded_at,checksum,original_status,deleted_at"
        );
        let row = lines.next().unwrap();
        assert!(row.starts_with("\"/srv/images/2024/06/15/a, b.jpg\""));
        assert!(row.contains(",2048,"));
        assert!(row.contains(",,error,"));
    }

    #[test]
    fn test_json_is_an_array_of_records() {
        let mut out = Vec::new();
        write_records(&sample(), &mut out, ExportFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value[0]["original_status"], "error");
        assert_eq!(value[0]["file_size"], 2048);
        assert!(value[0]["checksum"].is_null());
    }

    #[test]
    fn test_empty_trail_exports_header_only() {
        let mut out = Vec::new();
        write_records(&[], &mut out, ExportFormat::Csv).unwrap();
        assert_eq!(String::from_utf8(out).unwrap().lines().count(), 1);
    }

    #[test]
    fn test_directory_output_gets_default_name() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            resolve_output_path(dir.path(), ExportFormat::Json),
            dir.path().join("deleted_backups.json")
        );
        let file = dir.path().join("audit-2024.csv");
        assert_eq!(resolve_output_path(&file, ExportFormat::Csv), file);
    }
}
