//! ---
//! lreg_section: "01-core-functionality"
//! lreg_subsection: "module"
//! lreg_type: "source"
//! lreg_scope: "code"
//! lreg_description: "Shared primitives and utilities for the registry runtime."
//! lreg_version: "v0.0.0-prealpha"
//! lreg_owner: "tbd"
//! ---
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, Subscriber};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::{self, time::UtcTime};
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

/// Filter directive for registry processes. Falls back to `RUST_LOG`, then
/// to `info`.
pub const LOG_FILTER_ENV: &str = "LREG_LOG";

const FALLBACK_DIRECTIVE: &str = "info";

/// Stdout rendering. The rolling log file is always JSON.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// Flushes the non-blocking writers when dropped. Hold it until the process
/// exits.
#[must_use = "dropping the guard stops log delivery"]
pub struct LogGuard {
    _stdout: WorkerGuard,
    _file: WorkerGuard,
}

impl std::fmt::Debug for LogGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogGuard").finish_non_exhaustive()
    }
}

/// Install the global subscriber: stdout in the configured [`LogFormat`] plus
/// a daily rolling `<prefix>.log` under `config.directory`.
///
/// A subscriber installed earlier (tests, embedding) is left in place.
pub fn init_tracing(service: &str, config: &LoggingConfig) -> Result<LogGuard> {
    std::fs::create_dir_all(&config.directory)
        .with_context(|| format!("unable to create log directory {}", config.directory.display()))?;
    let file_name = format!("{}.log", config.file_prefix.as_deref().unwrap_or(service));
    let appender = RollingFileAppender::new(Rotation::DAILY, &config.directory, file_name);
    let (file, file_guard) = tracing_appender::non_blocking(appender);
    let (stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let installed = tracing_subscriber::registry()
        .with(log_filter(std::env::var(LOG_FILTER_ENV).ok().as_deref()))
        .with(stdout_layer(config.format, stdout))
        .with(
            fmt::layer()
                .with_timer(UtcTime::rfc_3339())
                .with_writer(file)
                .json(),
        )
        .try_init()
        .is_ok();

    info!(
        service,
        directory = %config.directory.display(),
        format = ?config.format,
        installed,
        "logging ready"
    );
    Ok(LogGuard {
        _stdout: stdout_guard,
        _file: file_guard,
    })
}

/// `directive` when it parses, otherwise `RUST_LOG`, otherwise `info`.
fn log_filter(directive: Option<&str>) -> EnvFilter {
    directive
        .and_then(|directive| match EnvFilter::try_new(directive) {
            Ok(filter) => Some(filter),
            Err(err) => {
                eprintln!("ignoring {LOG_FILTER_ENV}={directive}: {err}");
                None
            }
        })
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(FALLBACK_DIRECTIVE))
}

fn stdout_layer<S>(format: LogFormat, writer: NonBlocking) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    let layer = fmt::layer().with_timer(UtcTime::rfc_3339()).with_writer(writer);
    match format {
        LogFormat::StructuredJson => layer.with_target(false).json().boxed(),
        LogFormat::Pretty => layer.pretty().boxed(),
    }
}
