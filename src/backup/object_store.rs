//! Remote object storage for backups.
//!
//! [`S3ObjectStore`] talks to S3 (or any S3-compatible endpoint) with
//! presigned requests sent over a blocking `ureq` agent. [`MemoryObjectStore`]
//! keeps objects in memory and can be told to fail, for exercising the
//! tracker without a network.

use anyhow::{Context, Result};
use rusty_s3::actions::{CreateMultipartUpload, S3Action};
use rusty_s3::{Bucket, Credentials, UrlStyle};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use super::retry::{is_retryable, retry_call, retry_with};
use crate::config::{BackupConfig, RetryConfig};
use crate::error::StashError;

/// Duration for presigned URL validity.
const PRESIGN_DURATION: Duration = Duration::from_secs(3600);

/// S3 accepts at most this many parts per upload.
const MAX_PARTS: u64 = 10_000;
/// Smallest part S3 accepts, other than the last.
const MIN_PART_BYTES: u64 = 5 * 1024 * 1024;

/// `(part number, offset, length)` for each part of a `size`-byte upload.
///
/// `part_bytes` is raised to the S3 minimum, and further if the file would
/// otherwise need more than 10,000 parts.
pub fn plan_parts(size: u64, part_bytes: u64) -> Vec<(u16, u64, u64)> {
    let part = part_bytes.max(MIN_PART_BYTES).max(size.div_ceil(MAX_PARTS));
    (0..size.div_ceil(part))
        .map(|i| {
            let offset = i * part;
            ((i + 1) as u16, offset, part.min(size - offset))
        })
        .collect()
}

/// User metadata stored with every uploaded object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub source_type: String,
    pub upload_date: String,
    pub file_size: u64,
    pub original_path: String,
    pub md5: String,
}

impl ObjectMetadata {
    /// `(name, value)` pairs, sent as `x-amz-meta-<name>`.
    pub fn pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("source_type", self.source_type.clone()),
            ("upload_date", self.upload_date.clone()),
            ("file_size", self.file_size.to_string()),
            ("original_path", self.original_path.clone()),
            ("md5", self.md5.clone()),
        ]
    }
}

/// What a HEAD request reveals about an object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectInfo {
    pub size: Option<u64>,
    /// `x-amz-meta-md5` when present.
    pub md5: Option<String>,
    pub etag: Option<String>,
}

impl ObjectInfo {
    /// Content MD5 as far as the store can tell without downloading.
    ///
    /// Multipart ETags (`<hash>-<parts>`) are not content hashes.
    pub fn checksum(&self) -> Option<String> {
        if let Some(md5) = &self.md5 {
            return Some(md5.to_ascii_lowercase());
        }
        let etag = self.etag.as_deref()?.trim_matches('"');
        if etag.is_empty() || etag.contains('-') {
            return None;
        }
        Some(etag.to_ascii_lowercase())
    }
}

/// Keyed object storage. Every call may fail independently.
pub trait ObjectStore {
    fn put_file(&self, key: &str, path: &Path, metadata: &ObjectMetadata) -> Result<()>;

    /// `None` when no object exists under `key`.
    fn head(&self, key: &str) -> Result<Option<ObjectInfo>>;

    /// `None` when no object exists under `key`.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Deleting a missing key succeeds.
    fn delete(&self, key: &str) -> Result<()>;

    /// Bucket recorded in the audit trail, if the store has one.
    fn bucket_name(&self) -> Option<&str>;
}

/// Resolve credentials: environment, then configuration, then `~/.aws/credentials`.
pub fn resolve_credentials(
    config: &BackupConfig,
    var: impl Fn(&str) -> Option<String>,
    aws_credentials_file: Option<&Path>,
) -> Result<Credentials, StashError> {
    let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());

    if let (Some(key), Some(secret)) = (
        non_empty(var("AWS_ACCESS_KEY_ID")),
        non_empty(var("AWS_SECRET_ACCESS_KEY")),
    ) {
        return Ok(match non_empty(var("AWS_SESSION_TOKEN")) {
            Some(token) => Credentials::new_with_token(key, secret, token),
            None => Credentials::new(key, secret),
        });
    }

    if let (Some(key), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
        return Ok(Credentials::new(key.clone(), secret.clone()));
    }

    let profile = non_empty(var("AWS_PROFILE")).unwrap_or_else(|| "default".to_string());
    if let Some(path) = aws_credentials_file {
        if let Ok(content) = std::fs::read_to_string(path) {
            if let Some(profile) = parse_aws_profile(&content, &profile) {
                return Ok(match profile.session_token {
                    Some(token) => Credentials::new_with_token(profile.key, profile.secret, token),
                    None => Credentials::new(profile.key, profile.secret),
                });
            }
        }
    }

    Err(StashError::MissingCredentials)
}

pub fn default_aws_credentials_file() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("AWS_SHARED_CREDENTIALS_FILE") {
        return Some(PathBuf::from(path));
    }
    dirs::home_dir().map(|home| home.join(".aws").join("credentials"))
}

#[derive(Debug, PartialEq, Eq)]
struct AwsProfile {
    key: String,
    secret: String,
    session_token: Option<String>,
}

fn parse_aws_profile(content: &str, wanted: &str) -> Option<AwsProfile> {
    let mut in_section = false;
    let mut key = None;
    let mut secret = None;
    let mut session_token = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            in_section = name.trim() == wanted;
            continue;
        }
        if !in_section {
            continue;
        }
        let Some((name, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().to_string();
        match name.trim() {
            "aws_access_key_id" => key = Some(value),
            "aws_secret_access_key" => secret = Some(value),
            "aws_session_token" => session_token = Some(value),
            _ => {}
        }
    }

    Some(AwsProfile {
        key: key?,
        secret: secret?,
        session_token,
    })
}

/// Header values must be visible ASCII; anything else is percent-encoded.
fn header_safe(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        if (0x20..0x7f).contains(&byte) && byte != b'%' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// Failure of an upload attempt: the HTTP call itself, or reopening the file.
#[derive(Debug)]
enum PutError {
    Http(ureq::Error),
    Io(std::io::Error),
}

impl std::fmt::Display for PutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PutError::Http(e) => write!(f, "{e}"),
            PutError::Io(e) => write!(f, "{e}"),
        }
    }
}

pub struct S3ObjectStore {
    bucket: Bucket,
    bucket_name: String,
    credentials: Credentials,
    agent: ureq::Agent,
    storage_class: String,
    multipart_threshold: u64,
    multipart_part_bytes: u64,
    retry: RetryConfig,
}

impl S3ObjectStore {
    /// Build a store from the `[backup]` section, resolving credentials from the environment.
    pub fn from_config(config: &BackupConfig) -> Result<Self, StashError> {
        let credentials = resolve_credentials(
            config,
            |key| std::env::var(key).ok(),
            default_aws_credentials_file().as_deref(),
        )?;
        Self::new(config, credentials)
    }

    pub fn new(config: &BackupConfig, credentials: Credentials) -> Result<Self, StashError> {
        let bucket_name = config
            .bucket
            .clone()
            .ok_or_else(|| StashError::Config("backup.bucket is not set".to_string()))?;

        let endpoint = config.endpoint_url();
        let base_url = endpoint.parse().map_err(|e| {
            StashError::Config(format!("invalid S3 endpoint URL '{endpoint}': {e}"))
        })?;

        // Custom endpoints (MinIO and friends) generally only speak path style.
        let url_style = if config.endpoint.is_some() {
            UrlStyle::Path
        } else {
            UrlStyle::VirtualHost
        };

        let bucket = Bucket::new(base_url, url_style, bucket_name.clone(), config.region.clone())
            .map_err(|e| StashError::Config(format!("failed to create S3 bucket handle: {e}")))?;

        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(300))
            .timeout_write(Duration::from_secs(300))
            .build();

        Ok(Self {
            bucket,
            bucket_name,
            credentials,
            agent,
            storage_class: config.storage_class.clone(),
            multipart_threshold: config.multipart_threshold_bytes,
            multipart_part_bytes: config.multipart_part_bytes,
            retry: config.retry.clone(),
        })
    }

    pub fn uses_multipart(&self, size: u64) -> bool {
        size > 0 && size >= self.multipart_threshold
    }

    fn put_single(&self, key: &str, path: &Path, size: u64, headers: &[(String, String)]) -> Result<()> {
        let mut action = self.bucket.put_object(Some(&self.credentials), key);
        for (name, value) in headers {
            action.headers_mut().insert(name.clone(), value.clone());
        }
        let url = action.sign(PRESIGN_DURATION);

        retry_with(
            &self.retry,
            &format!("PUT {key}"),
            |e: &PutError| matches!(e, PutError::Http(e) if is_retryable(e)),
            || {
                // Reopened per attempt so a retry starts from the first byte.
                let file = File::open(path).map_err(PutError::Io)?;
                let mut request = self
                    .agent
                    .put(url.as_str())
                    .set("Content-Length", &size.to_string());
                for (name, value) in headers {
                    request = request.set(name, value);
                }
                request.send(file).map_err(PutError::Http)
            },
        )
        .map_err(|e| StashError::ObjectStore(format!("PUT {key}: {e}")))?;
        Ok(())
    }

    /// Create, upload parts, complete. Any failure aborts the upload, which
    /// releases the parts already stored.
    fn put_multipart(&self, key: &str, path: &Path, size: u64, headers: &[(String, String)]) -> Result<()> {
        let mut action = self.bucket.create_multipart_upload(Some(&self.credentials), key);
        for (name, value) in headers {
            action.headers_mut().insert(name.clone(), value.clone());
        }
        let url = action.sign(PRESIGN_DURATION);

        let response = retry_call(&self.retry, &format!("CreateMultipartUpload {key}"), || {
            let mut request = self.agent.post(url.as_str());
            for (name, value) in headers {
                request = request.set(name, value);
            }
            request.call()
        })
        .map_err(|e| StashError::ObjectStore(format!("CreateMultipartUpload {key}: {e}")))?;
        let created = CreateMultipartUpload::parse_response_from_reader(response.into_reader())
            .map_err(|e| StashError::ObjectStore(format!("CreateMultipartUpload {key}: {e}")))?;
        let upload_id = created.upload_id();

        let result = self
            .upload_parts(key, path, size, upload_id)
            .and_then(|etags| self.complete_multipart(key, upload_id, &etags));
        if result.is_err() {
            let url = self
                .bucket
                .abort_multipart_upload(Some(&self.credentials), key, upload_id)
                .sign(PRESIGN_DURATION);
            if let Err(e) = self.agent.delete(url.as_str()).call() {
                warn!(key, upload_id, "failed to abort multipart upload: {}", e);
            }
        }
        result
    }

    fn upload_parts(&self, key: &str, path: &Path, size: u64, upload_id: &str) -> Result<Vec<String>> {
        let parts = plan_parts(size, self.multipart_part_bytes);
        let mut etags = Vec::with_capacity(parts.len());

        for (number, offset, length) in parts {
            let url = self
                .bucket
                .upload_part(Some(&self.credentials), key, number, upload_id)
                .sign(PRESIGN_DURATION);
            let response = retry_with(
                &self.retry,
                &format!("UploadPart {key} #{number}"),
                |e: &PutError| matches!(e, PutError::Http(e) if is_retryable(e)),
                || {
                    let mut file = File::open(path).map_err(PutError::Io)?;
                    file.seek(SeekFrom::Start(offset)).map_err(PutError::Io)?;
                    self.agent
                        .put(url.as_str())
                        .set("Content-Length", &length.to_string())
                        .send(file.take(length))
                        .map_err(PutError::Http)
                },
            )
            .map_err(|e| StashError::ObjectStore(format!("UploadPart {key} #{number}: {e}")))?;

            let etag = response.header("ETag").ok_or_else(|| {
                StashError::ObjectStore(format!("UploadPart {key} #{number}: response carries no ETag"))
            })?;
            etags.push(etag.to_string());
            debug!(key, part = number, length, "part uploaded");
        }
        Ok(etags)
    }

    fn complete_multipart(&self, key: &str, upload_id: &str, etags: &[String]) -> Result<()> {
        let action = self.bucket.complete_multipart_upload(
            Some(&self.credentials),
            key,
            upload_id,
            etags.iter().map(String::as_str),
        );
        let url = action.sign(PRESIGN_DURATION);
        let body = action.body();

        let response = retry_call(&self.retry, &format!("CompleteMultipartUpload {key}"), || {
            self.agent.post(url.as_str()).send_string(&body)
        })
        .map_err(|e| StashError::ObjectStore(format!("CompleteMultipartUpload {key}: {e}")))?;

        // S3 may report a failed completion inside a 200 response.
        let text = response
            .into_string()
            .with_context(|| format!("CompleteMultipartUpload {key}: reading body"))?;
        if text.contains("<Error>") {
            return Err(StashError::ObjectStore(format!("CompleteMultipartUpload {key}: {text}")).into());
        }
        Ok(())
    }
}

impl ObjectStore for S3ObjectStore {
    fn put_file(&self, key: &str, path: &Path, metadata: &ObjectMetadata) -> Result<()> {
        let size = std::fs::metadata(path)
            .with_context(|| format!("Failed to stat {}", path.display()))?
            .len();

        let headers: Vec<(String, String)> = std::iter::once((
            "x-amz-storage-class".to_string(),
            self.storage_class.clone(),
        ))
        .chain(
            metadata
                .pairs()
                .into_iter()
                .map(|(name, value)| (format!("x-amz-meta-{name}"), header_safe(&value))),
        )
        .collect();

        if self.uses_multipart(size) {
            self.put_multipart(key, path, size, &headers)?;
        } else {
            self.put_single(key, path, size, &headers)?;
        }

        debug!(key, size, "object uploaded");
        Ok(())
    }

    fn head(&self, key: &str) -> Result<Option<ObjectInfo>> {
        let url = self
            .bucket
            .head_object(Some(&self.credentials), key)
            .sign(PRESIGN_DURATION);

        match retry_call(&self.retry, &format!("HEAD {key}"), || {
            self.agent.head(url.as_str()).call()
        }) {
            Ok(resp) => Ok(Some(ObjectInfo {
                size: resp.header("Content-Length").and_then(|v| v.parse().ok()),
                md5: resp.header("x-amz-meta-md5").map(str::to_string),
                etag: resp.header("ETag").map(str::to_string),
            })),
            Err(ureq::Error::Status(404, _)) => Ok(None),
            Err(e) => Err(StashError::ObjectStore(format!("HEAD {key}: {e}")).into()),
        }
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let url = self
            .bucket
            .get_object(Some(&self.credentials), key)
            .sign(PRESIGN_DURATION);

        match retry_call(&self.retry, &format!("GET {key}"), || {
            self.agent.get(url.as_str()).call()
        }) {
            Ok(resp) => {
                let mut buf = Vec::new();
                resp.into_reader()
                    .read_to_end(&mut buf)
                    .with_context(|| format!("GET {key}: reading body"))?;
                Ok(Some(buf))
            }
            Err(ureq::Error::Status(404, _)) => Ok(None),
            Err(e) => Err(StashError::ObjectStore(format!("GET {key}: {e}")).into()),
        }
    }

    fn delete(&self, key: &str) -> Result<()> {
        let url = self
            .bucket
            .delete_object(Some(&self.credentials), key)
            .sign(PRESIGN_DURATION);

        match retry_call(&self.retry, &format!("DELETE {key}"), || {
            self.agent.delete(url.as_str()).call()
        }) {
            Ok(_) | Err(ureq::Error::Status(404, _)) => Ok(()),
            Err(e) => Err(StashError::ObjectStore(format!("DELETE {key}: {e}")).into()),
        }
    }

    fn bucket_name(&self) -> Option<&str> {
        Some(&self.bucket_name)
    }
}

/// An object held by [`MemoryObjectStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub metadata: BTreeMap<String, String>,
}

/// In-process object store.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    bucket: Option<String>,
    objects: RefCell<BTreeMap<String, StoredObject>>,
    fail_puts: Cell<bool>,
    fail_deletes: Cell<bool>,
}

impl MemoryObjectStore {
    pub fn new(bucket: &str) -> Self {
        Self {
            bucket: Some(bucket.to_string()),
            ..Default::default()
        }
    }

    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.set(fail);
    }

    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.set(fail);
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.objects.borrow().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.borrow().keys().cloned().collect()
    }

    /// Replace an object's bytes without touching its metadata, as bit rot would.
    pub fn corrupt(&self, key: &str, data: &[u8]) {
        if let Some(object) = self.objects.borrow_mut().get_mut(key) {
            object.data = data.to_vec();
            object.metadata.remove("md5");
        }
    }

    pub fn remove(&self, key: &str) {
        self.objects.borrow_mut().remove(key);
    }
}

impl ObjectStore for MemoryObjectStore {
    fn put_file(&self, key: &str, path: &Path, metadata: &ObjectMetadata) -> Result<()> {
        if self.fail_puts.get() {
            return Err(StashError::ObjectStore(format!("PUT {key}: injected failure")).into());
        }
        let data = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let metadata = metadata
            .pairs()
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect();
        self.objects
            .borrow_mut()
            .insert(key.to_string(), StoredObject { data, metadata });
        Ok(())
    }

    fn head(&self, key: &str) -> Result<Option<ObjectInfo>> {
        use md5::{Digest, Md5};
        Ok(self.objects.borrow().get(key).map(|object| ObjectInfo {
            size: Some(object.data.len() as u64),
            md5: object.metadata.get("md5").cloned(),
            etag: Some(format!("\"{:x}\"", Md5::digest(&object.data))),
        }))
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.objects.borrow().get(key).map(|object| object.data.clone()))
    }

    fn delete(&self, key: &str) -> Result<()> {
        if self.fail_deletes.get() {
            return Err(StashError::ObjectStore(format!("DELETE {key}: injected failure")).into());
        }
        self.objects.borrow_mut().remove(key);
        Ok(())
    }

    fn bucket_name(&self) -> Option<&str> {
        self.bucket.as_deref()
    }
}
