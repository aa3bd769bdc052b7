//! Failures that abort a whole run.
//!
//! Per-file problems (a copy, an extraction, an upload) never surface here:
//! they are logged and counted in the run summary instead.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StashError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("no destination tier available: primary {primary} is below the free-space threshold and secondary {secondary} is unreachable")]
    NoDestination { primary: PathBuf, secondary: PathBuf },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("object store: {0}")]
    ObjectStore(String),

    #[error("object store credentials not found (set AWS_ACCESS_KEY_ID/AWS_SECRET_ACCESS_KEY or ~/.aws/credentials)")]
    MissingCredentials,
}
