//! Photo pipeline for a home server: ingest removable media into a tiered
//! corpus, index image metadata, and keep an audited S3 backup in step.

pub mod backup;
pub mod config;
pub mod db;
pub mod dedup;
pub mod error;
pub mod export;
pub mod indexer;
pub mod ingest;
pub mod logging;
pub mod placement;
pub mod scanner;
pub mod schedule;
pub mod wait;

pub use config::Config;
pub use db::Database;
pub use error::StashError;
