//! Log output: compact lines on stdout, and plain rolling files under
//! `log_dir` when one is configured. Both honor `RUST_LOG` over the
//! configured level.

use std::path::Path;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::{GatewayConfig, LogRotation};

const LOG_FILE_PREFIX: &str = "courier";
const LOG_FILE_SUFFIX: &str = "log";

/// Flushes the background log writers when dropped, so hold it until exit.
#[must_use]
pub struct LoggingGuard {
    _stdout: WorkerGuard,
    _file: Option<WorkerGuard>,
}

fn rotation(rotation: LogRotation) -> Rotation {
    match rotation {
        LogRotation::Hourly => Rotation::HOURLY,
        LogRotation::Daily => Rotation::DAILY,
        LogRotation::Never => Rotation::NEVER,
    }
}

fn file_appender(
    dir: &Path,
    every: LogRotation,
    max_files: Option<usize>,
) -> Result<RollingFileAppender, InitError> {
    let builder = RollingFileAppender::builder()
        .rotation(rotation(every))
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX);
    match max_files {
        Some(max) => builder.max_log_files(max).build(dir),
        None => builder.build(dir),
    }
}

pub fn init(config: &GatewayConfig) -> anyhow::Result<LoggingGuard> {
    let level = config.log_level();
    let filter = || {
        EnvFilter::builder()
            .with_default_directive(level.into())
            .from_env_lossy()
    };

    let (stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    let stdout_layer = fmt::layer()
        .compact()
        .with_writer(stdout)
        .with_filter(filter());

    let (file_layer, file_guard) = match &config.log_dir {
        Some(dir) => {
            let appender = file_appender(dir, config.log_rotation, config.log_max_files)
                .with_context(|| format!("failed to open log directory {:?}", dir))?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .context("a global logger is already installed")?;

    Ok(LoggingGuard {
        _stdout: stdout_guard,
        _file: file_guard,
    })
}
