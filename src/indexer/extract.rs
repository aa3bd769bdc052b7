//! Metadata extraction: a file in, a flat key/value set out.
//!
//! Keys follow exiftool's tag names so both extractors feed the same
//! field mapping in [`asset_from_metadata`].

use anyhow::{bail, Context, Result};
use chrono::NaiveDateTime;
use serde_json::{Map, Number, Value};
use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::debug;

use crate::db::AssetRecord;
use crate::wait::{wait_for, WaitPolicy};

/// Every key/value the extractor could read from one file.
pub type RawMetadata = Map<String, Value>;

/// Reads structured metadata from a single file. Failures are per file.
pub trait MetadataExtractor {
    fn extract(&self, path: &Path) -> Result<RawMetadata>;
}

// ============================================================================
// In-process EXIF reader
// ============================================================================

/// Reads EXIF directly from the file container.
///
/// Fujifilm RAF files are read through their embedded JPEG preview. Other
/// containers kamadak-exif cannot parse go to `fallback` when one is set;
/// without one, or if it fails too, the file keys alone are returned so the
/// asset is still indexed and retried on the next run.
#[derive(Debug, Default, Clone)]
pub struct ExifExtractor {
    fallback: Option<ExifToolExtractor>,
}

impl ExifExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fallback(fallback: ExifToolExtractor) -> Self {
        Self {
            fallback: Some(fallback),
        }
    }

    fn unsupported(&self, path: &Path, meta: RawMetadata, reason: &str) -> RawMetadata {
        let Some(fallback) = &self.fallback else {
            debug!(file = %path.display(), reason, "container not readable in-process, file keys only");
            return meta;
        };
        match fallback.extract(path) {
            Ok(mut full) => {
                for (key, value) in meta {
                    full.entry(key).or_insert(value);
                }
                full
            }
            Err(e) => {
                debug!(file = %path.display(), "exiftool fallback failed, file keys only: {:#}", e);
                meta
            }
        }
    }
}

/// Magic at the start of every Fujifilm RAF file.
const RAF_MAGIC: &[u8] = b"FUJIFILMCCD-RAW";
/// The big-endian offset and length of the JPEG preview sit at bytes 84..92.
const RAF_HEADER_LEN: usize = 92;
const RAF_PREVIEW_MAX: u32 = 64 * 1024 * 1024;

/// The embedded JPEG preview of a RAF file, or `None` for any other file.
/// Leaves `reader` at the start of the file.
fn raf_preview<R: Read + Seek>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>> {
    let mut header = Vec::with_capacity(RAF_HEADER_LEN);
    reader.by_ref().take(RAF_HEADER_LEN as u64).read_to_end(&mut header)?;
    reader.seek(SeekFrom::Start(0))?;
    if header.len() < RAF_HEADER_LEN || !header.starts_with(RAF_MAGIC) {
        return Ok(None);
    }

    let word = |at: usize| u32::from_be_bytes([header[at], header[at + 1], header[at + 2], header[at + 3]]);
    let (offset, length) = (word(84), word(88));
    if length == 0 || length > RAF_PREVIEW_MAX {
        return Ok(None);
    }

    reader.seek(SeekFrom::Start(u64::from(offset)))?;
    let mut preview = Vec::with_capacity(length as usize);
    reader.by_ref().take(u64::from(length)).read_to_end(&mut preview)?;
    reader.seek(SeekFrom::Start(0))?;
    Ok(Some(preview))
}

impl MetadataExtractor for ExifExtractor {
    fn extract(&self, path: &Path) -> Result<RawMetadata> {
        let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let size = file.metadata()?.len();

        let mut meta = RawMetadata::new();
        if let Some(name) = path.file_name() {
            meta.insert("FileName".into(), Value::String(name.to_string_lossy().into_owned()));
        }
        meta.insert("FileSize".into(), Value::from(size));

        let mut bufreader = BufReader::new(file);
        let preview = raf_preview(&mut bufreader)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let read = match preview {
            Some(jpeg) => exif::Reader::new().read_from_container(&mut Cursor::new(jpeg)),
            None => exif::Reader::new().read_from_container(&mut bufreader),
        };
        let exif = match read {
            Ok(exif) => exif,
            // No EXIF block is a valid answer: an empty attribute set.
            Err(exif::Error::NotFound(_)) => return Ok(meta),
            Err(exif::Error::InvalidFormat(reason)) => return Ok(self.unsupported(path, meta, reason)),
            Err(e) => bail!("EXIF read failed for {}: {}", path.display(), e),
        };

        for field in exif.fields().filter(|f| f.ifd_num == exif::In::PRIMARY) {
            let key = field.tag.to_string();
            let value = match field.tag {
                // Keep the fraction form ("1/250") rather than a float.
                exif::Tag::ExposureTime => Some(Value::String(field.display_value().to_string())),
                _ => field_to_json(field),
            };
            if let Some(value) = value {
                meta.insert(key, value);
            }
        }

        // kamadak-exif names ISO by its EXIF 2.3 tag.
        if let Some(iso) = meta.get("PhotographicSensitivity").cloned() {
            meta.entry("ISO").or_insert(iso);
        }

        Ok(meta)
    }
}

fn rational(num: f64, denom: f64) -> Option<Value> {
    if denom == 0.0 {
        return None;
    }
    Number::from_f64(num / denom).map(Value::Number)
}

fn field_to_json(field: &exif::Field) -> Option<Value> {
    match &field.value {
        exif::Value::Ascii(parts) => {
            let text = parts
                .iter()
                .map(|p| String::from_utf8_lossy(p).trim_matches(char::from(0)).trim().to_string())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(" ");
            (!text.is_empty()).then(|| Value::String(text))
        }
        exif::Value::Short(v) if v.len() == 1 => Some(Value::from(v[0])),
        exif::Value::Long(v) if v.len() == 1 => Some(Value::from(v[0])),
        exif::Value::SShort(v) if v.len() == 1 => Some(Value::from(v[0])),
        exif::Value::SLong(v) if v.len() == 1 => Some(Value::from(v[0])),
        exif::Value::Rational(v) if v.len() == 1 => rational(v[0].num as f64, v[0].denom as f64),
        exif::Value::SRational(v) if v.len() == 1 => rational(v[0].num as f64, v[0].denom as f64),
        exif::Value::Float(v) if v.len() == 1 => Number::from_f64(f64::from(v[0])).map(Value::Number),
        exif::Value::Double(v) if v.len() == 1 => Number::from_f64(v[0]).map(Value::Number),
        // Maker notes and other opaque blobs are not useful as attributes.
        exif::Value::Undefined(..) | exif::Value::Unknown(..) | exif::Value::Byte(_) => None,
        _ => Some(Value::String(field.display_value().to_string())),
    }
}

// ============================================================================
// exiftool subprocess
// ============================================================================

/// Shells out to `exiftool -j`, killing it after `timeout`.
#[derive(Debug, Clone)]
pub struct ExifToolExtractor {
    program: String,
    timeout: Duration,
}

impl ExifToolExtractor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            program: "exiftool".to_string(),
            timeout,
        }
    }

    pub fn with_program(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

impl MetadataExtractor for ExifToolExtractor {
    fn extract(&self, path: &Path) -> Result<RawMetadata> {
        let mut child = Command::new(&self.program)
            .arg("-j")
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to run {}", self.program))?;

        // Drain stdout concurrently so a large document cannot stall the child.
        let mut stdout = child.stdout.take().context("exiftool stdout not captured")?;
        let reader = std::thread::spawn(move || {
            let mut out = String::new();
            stdout.read_to_string(&mut out).map(|_| out)
        });

        let policy = WaitPolicy::with_timeout(self.timeout, Duration::from_millis(20));
        let status = wait_for(policy, |_| child.try_wait().ok().flatten());
        let Some(status) = status else {
            let _ = child.kill();
            let _ = child.wait();
            bail!("{} timed out after {:?} on {}", self.program, self.timeout, path.display());
        };

        let output = reader
            .join()
            .map_err(|_| anyhow::anyhow!("exiftool reader thread panicked"))??;
        if !status.success() {
            bail!("{} exited with {} on {}", self.program, status, path.display());
        }
        parse_exiftool_json(&output)
    }
}

/// `exiftool -j` prints a one-element array of objects.
pub fn parse_exiftool_json(output: &str) -> Result<RawMetadata> {
    let mut docs: Vec<RawMetadata> =
        serde_json::from_str(output).context("exiftool output is not a JSON array")?;
    if docs.is_empty() {
        bail!("exiftool returned no entries");
    }
    Ok(docs.swap_remove(0))
}

// ============================================================================
// Field mapping
// ============================================================================

fn text_of(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

/// First key carrying a non-blank value.
fn first_text(meta: &RawMetadata, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| meta.get(*k).and_then(text_of))
}

/// Leading decimal number of a value: `2.8`, `"23.0 mm"`, `"f/4"` all parse.
fn number_of(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let s = s.trim().trim_start_matches("f/");
            let end = s
                .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-'))
                .unwrap_or(s.len());
            s[..end].parse().ok()
        }
        _ => None,
    }
}

fn first_number(meta: &RawMetadata, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| meta.get(*k).and_then(number_of))
}

/// EXIF `YYYY:MM:DD HH:MM:SS`, ignoring any sub-second or zone suffix.
pub fn parse_capture_time(raw: &str) -> Option<NaiveDateTime> {
    let head = raw.trim().get(..19)?;
    NaiveDateTime::parse_from_str(head, "%Y:%m:%d %H:%M:%S").ok()
}

/// Map a raw key/value set onto the indexed scalars.
pub fn asset_from_metadata(file_path: &str, meta: &RawMetadata) -> AssetRecord {
    let date_taken = first_text(meta, &["DateTimeOriginal", "CreateDate"])
        .and_then(|raw| parse_capture_time(&raw))
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S").to_string());

    AssetRecord {
        file_path: file_path.to_string(),
        date_taken,
        camera_make: first_text(meta, &["Make"]),
        camera_model: first_text(meta, &["Model"]),
        lens: first_text(meta, &["Lens", "LensModel", "LensID"]),
        shutter_speed: first_text(meta, &["ShutterSpeed", "ExposureTime", "ShutterSpeedValue"]),
        iso: first_number(meta, &["ISO", "ISOValue"]).map(|v| v.round() as i64),
        aperture: first_number(meta, &["FNumber", "ApertureValue"]),
        focal_length: first_number(meta, &["FocalLength"]),
        metadata_json: serde_json::to_string(meta).ok(),
        created_at: None,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    /// A JPEG whose only EXIF entry is `Make`.
    pub(crate) fn jpeg_with_make(make: &str) -> Vec<u8> {
        let mut value = make.as_bytes().to_vec();
        value.push(0);
        let count = value.len() as u32;

        let mut tiff = b"MM\x00\x2a\x00\x00\x00\x08".to_vec();
        tiff.extend_from_slice(&1u16.to_be_bytes());
        tiff.extend_from_slice(&0x010fu16.to_be_bytes());
        tiff.extend_from_slice(&2u16.to_be_bytes());
        tiff.extend_from_slice(&count.to_be_bytes());
        tiff.extend_from_slice(&26u32.to_be_bytes());
        tiff.extend_from_slice(&0u32.to_be_bytes());
        tiff.extend_from_slice(&value);

        let mut jpeg = vec![0xff, 0xd8, 0xff, 0xe1];
        jpeg.extend_from_slice(&((2 + 6 + tiff.len()) as u16).to_be_bytes());
        jpeg.extend_from_slice(b"Exif\x00\x00");
        jpeg.extend_from_slice(&tiff);
        jpeg.extend_from_slice(&[0xff, 0xd9]);
        jpeg
    }

    /// A RAF container around `preview`.
    pub(crate) fn raf_around(preview: &[u8]) -> Vec<u8> {
        let mut raf = b"FUJIFILMCCD-RAW 0201FF383501".to_vec();
        raf.resize(84, 0);
        raf.extend_from_slice(&(RAF_HEADER_LEN as u32).to_be_bytes());
        raf.extend_from_slice(&(preview.len() as u32).to_be_bytes());
        raf.extend_from_slice(preview);
        raf
    }

    fn meta(value: Value) -> RawMetadata {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_exiftool_document_mapping() {
        let output = r#"[{
            "SourceFile": "/p/DSCF1949.JPG",
            "Make": "FUJIFILM",
            "Model": "X-T5",
            "LensModel": "XF23mmF2 R WR",
            "ExposureTime": "1/250",
            "ISO": 200,
            "FNumber": 2.8,
            "FocalLength": "23.0 mm",
            "DateTimeOriginal": "2024:06:15 10:30:00"
        }]"#;
        let raw = parse_exiftool_json(output).unwrap();
        let record = asset_from_metadata("/p/DSCF1949.JPG", &raw);

        assert_eq!(record.date_taken.as_deref(), Some("2024-06-15T10:30:00"));
        assert_eq!(record.camera_make.as_deref(), Some("FUJIFILM"));
        assert_eq!(record.lens.as_deref(), Some("XF23mmF2 R WR"));
        assert_eq!(record.shutter_speed.as_deref(), Some("1/250"));
        assert_eq!(record.iso, Some(200));
        assert_eq!(record.aperture, Some(2.8));
        assert_eq!(record.focal_length, Some(23.0));
        assert!(record.is_complete());
        assert!(record.metadata_json.unwrap().contains("SourceFile"));
    }

    #[test]
    fn test_fallback_keys_and_blank_values() {
        let raw = meta(json!({
            "Lens": "  ",
            "LensID": "Canon RF 50mm F1.8 STM",
            "CreateDate": "2023:12:31 23:59:59.123+01:00",
            "ISOValue": "800",
            "ApertureValue": "f/4",
            "Make": ""
        }));
        let record = asset_from_metadata("/p/a.cr3", &raw);

        assert_eq!(record.lens.as_deref(), Some("Canon RF 50mm F1.8 STM"));
        assert_eq!(record.date_taken.as_deref(), Some("2023-12-31T23:59:59"));
        assert_eq!(record.iso, Some(800));
        assert_eq!(record.aperture, Some(4.0));
        assert_eq!(record.camera_make, None);
        assert_eq!(record.shutter_speed, None);
    }

    #[test]
    fn test_unparseable_date_is_null() {
        let raw = meta(json!({"DateTimeOriginal": "0000:00:00 00:00:00"}));
        assert_eq!(asset_from_metadata("/p/a.jpg", &raw).date_taken, None);
    }

    #[test]
    fn test_exiftool_output_errors() {
        assert!(parse_exiftool_json("[]").is_err());
        assert!(parse_exiftool_json("Error: File not found").is_err());
    }

    #[test]
    fn test_missing_exiftool_is_per_file_error() {
        let extractor = ExifToolExtractor::with_program("photostash-no-exiftool", Duration::from_secs(1));
        assert!(extractor.extract(Path::new("/p/a.jpg")).is_err());
    }

    #[test]
    fn test_exif_reader_without_exif_returns_file_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blank.png");
        // PNG signature and an IEND chunk, no eXIf chunk.
        std::fs::write(
            &path,
            [
                0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0, 0, 0, 0, b'I', b'E', b'N', b'D',
                0xae, 0x42, 0x60, 0x82,
            ],
        )
        .unwrap();

        let raw = ExifExtractor::new().extract(&path).unwrap();
        assert_eq!(raw.get("FileName"), Some(&json!("blank.png")));
        assert_eq!(raw.get("FileSize"), Some(&json!(20)));
        assert!(!asset_from_metadata("/x", &raw).is_complete());
    }

    #[test]
    fn test_raf_read_through_embedded_preview() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("DSCF0001.RAF");
        std::fs::write(&path, raf_around(&jpeg_with_make("FUJIFILM"))).unwrap();

        let raw = ExifExtractor::new().extract(&path).unwrap();
        assert_eq!(raw.get("Make"), Some(&json!("FUJIFILM")));
        assert_eq!(raw.get("FileName"), Some(&json!("DSCF0001.RAF")));
    }

    #[test]
    fn test_unknown_container_keeps_file_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("IMG_0001.RAW");
        std::fs::write(&path, b"not a container kamadak-exif knows").unwrap();

        let raw = ExifExtractor::new().extract(&path).unwrap();
        assert_eq!(raw.get("FileName"), Some(&json!("IMG_0001.RAW")));
        assert_eq!(raw.len(), 2);

        let missing_tool = ExifToolExtractor::with_program("photostash-no-exiftool", Duration::from_secs(1));
        let raw = ExifExtractor::with_fallback(missing_tool).extract(&path).unwrap();
        assert_eq!(raw.get("FileSize"), Some(&json!(34)));
    }
}
