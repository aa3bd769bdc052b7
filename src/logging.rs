//! Logging configuration with journald support on Linux.
//!
//! Events go to the systemd journal when it is reachable, otherwise to a
//! daily rolling file under the data directory. Interactive commands also
//! echo to stderr.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub const LOG_ENV: &str = "PHOTOSTASH_LOG";

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

pub fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("photostash")
        .join("logs")
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}

fn stderr_layer<S>(enabled: bool) -> Option<impl Layer<S>>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    enabled.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .without_time()
            .with_filter(env_filter())
    })
}

/// Initialize the logging system. Call once at startup.
///
/// The level comes from `PHOTOSTASH_LOG` (`debug`, `info`, `warn`, `error`,
/// or any `EnvFilter` directive), defaulting to `info`.
pub fn init(log_dir: Option<PathBuf>, stderr: bool) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        if let Ok(journald_layer) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(journald_layer.with_filter(env_filter()))
                .with(stderr_layer(stderr))
                .init();

            tracing::debug!("logging initialized with journald backend");
            return Ok(());
        }
    }

    let log_dir = log_dir.unwrap_or_else(default_log_dir);
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "photostash.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    // Dropping the guard would stop the writer thread.
    let _ = GUARD.set(guard);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(env_filter()),
        )
        .with(stderr_layer(stderr))
        .init();

    tracing::debug!("logging initialized with file backend at {:?}", log_dir);
    Ok(())
}
