use std::{fs, path::Path};

use anyhow::Context;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Human-readable logs on stderr (`RUST_LOG` overrides `stderr_level`) plus a
/// plain log file at `log_path`. Keep the returned guard alive until exit or
/// buffered file output is lost.
pub fn init_logging(
    stderr_level: LevelFilter,
    log_path: &Path,
    file_level: LevelFilter,
) -> anyhow::Result<WorkerGuard> {
    let log_dir = log_path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {log_dir:?}"))?;
    let file_name = log_path.file_name().context("Log file path has no file name")?;

    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(log_dir, file_name));

    let stderr_filter =
        EnvFilter::builder().with_default_directive(stderr_level.into()).from_env_lossy();
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(stderr_filter);
    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_thread_ids(true)
        .with_filter(file_level);

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(guard)
}
