//! Tracing setup: a daily rolling file under the data directory plus stderr.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "info,queueking=debug";
const LOG_FILE_PREFIX: &str = "queueking.log";

/// Overrides the log directory, mostly for service deployments.
pub const LOG_DIR_ENV: &str = "QUEUEKING_LOG_DIR";

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop and must live as long
/// as the process.
pub fn init() -> Result<(WorkerGuard, PathBuf)> {
    let log_dir = log_dir(std::env::var_os(LOG_DIR_ENV).map(PathBuf::from))?;
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Could not create log directory {}", log_dir.display()))?;

    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX));

    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true);

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(false);

    tracing_subscriber::registry()
        .with(env_filter(std::env::var("RUST_LOG").ok().as_deref()))
        .with(file_layer)
        .with(console_layer)
        .try_init()?;

    tracing::debug!("Writing logs to {}", log_dir.display());
    Ok((guard, log_dir))
}

/// `RUST_LOG` wins when it parses; anything else falls back to the default.
fn env_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .filter(|d| !d.trim().is_empty())
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

fn log_dir(override_dir: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(dir) = override_dir.filter(|d| !d.as_os_str().is_empty()) {
        return Ok(dir);
    }
    let dirs = directories::ProjectDirs::from("com", "queueking", "queueking")
        .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?;
    Ok(dirs.data_dir().join("logs"))
}
