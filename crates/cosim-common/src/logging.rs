//! ---
//! cosim_section: "01-core-functionality"
//! cosim_subsection: "module"
//! cosim_type: "source"
//! cosim_scope: "code"
//! cosim_description: "Tracing subscriber setup for the simulation manager."
//! cosim_version: "v0.0.0-prealpha"
//! cosim_owner: "tbd"
//! ---
use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

/// Filter directive read before `RUST_LOG`.
pub const LOG_ENV: &str = "COSIM_LOG";

const DEFAULT_FILTER: &str = "info";
const DEFAULT_FILE_PREFIX: &str = "cosim";

/// Writer guards must outlive the subscriber or buffered lines are lost.
static GUARDS: OnceCell<Vec<WorkerGuard>> = OnceCell::new();

/// Console output format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    /// One JSON object per line.
    StructuredJson,
    /// Multi-line, human readable.
    #[default]
    Pretty,
    /// Single-line, for long simulation runs in a terminal.
    Compact,
}

/// Pick the filter directive: `COSIM_LOG`, then `RUST_LOG`, then the configured
/// fallback, then `info`. Invalid directives are skipped and reported back.
fn resolve_filter(
    custom: Option<String>,
    standard: Option<String>,
    configured: Option<&str>,
) -> (EnvFilter, Vec<String>) {
    let mut rejected = Vec::new();
    let candidates = [
        (LOG_ENV, custom),
        ("RUST_LOG", standard),
        ("logging.filter", configured.map(str::to_owned)),
    ];
    for (origin, directive) in candidates {
        let Some(directive) = directive else { continue };
        match EnvFilter::try_new(&directive) {
            Ok(filter) => return (filter, rejected),
            Err(err) => rejected.push(format!("{origin}={directive:?}: {err}")),
        }
    }
    (EnvFilter::new(DEFAULT_FILTER), rejected)
}

fn console_layer<S>(format: LogFormat) -> (Box<dyn Layer<S> + Send + Sync>, WorkerGuard)
where
    S: tracing::Subscriber + for<'span> LookupSpan<'span>,
{
    let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
    let layer = fmt::layer()
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_writer(writer);
    let layer = match format {
        LogFormat::StructuredJson => layer.with_target(false).json().boxed(),
        LogFormat::Pretty => layer.with_target(true).pretty().boxed(),
        LogFormat::Compact => layer.with_target(false).compact().boxed(),
    };
    (layer, guard)
}

/// Install the global subscriber for a simulation run.
///
/// Console output follows [`LoggingConfig::format`]. Unless disabled, a daily
/// rolling JSON file `<prefix>.log` is written to [`LoggingConfig::directory`].
/// Returns `false` when a subscriber was already installed, e.g. by a test
/// harness; the existing one is kept.
pub fn init_tracing(config: &LoggingConfig) -> Result<bool> {
    let (filter, rejected) = resolve_filter(
        std::env::var(LOG_ENV).ok(),
        std::env::var("RUST_LOG").ok(),
        config.filter.as_deref(),
    );

    let mut guards = Vec::new();
    let (console, guard) = console_layer(config.format);
    guards.push(guard);

    let file = if config.file {
        std::fs::create_dir_all(&config.directory).with_context(|| {
            format!("unable to create log directory {}", config.directory.display())
        })?;
        let prefix = config.file_prefix.as_deref().unwrap_or(DEFAULT_FILE_PREFIX);
        let appender = rolling::daily(&config.directory, format!("{prefix}.log"));
        let (writer, guard) = tracing_appender::non_blocking(appender);
        guards.push(guard);
        Some(
            fmt::layer()
                .with_timer(fmt::time::UtcTime::rfc_3339())
                .with_target(true)
                .json()
                .with_writer(writer),
        )
    } else {
        None
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .is_ok();
    if !installed {
        return Ok(false);
    }
    let _ = GUARDS.set(guards);

    for rejected in &rejected {
        warn!(directive = %rejected, "ignoring invalid log filter");
    }
    info!(
        log_dir = %config.directory.display(),
        format = ?config.format,
        file = config.file,
        "tracing initialised"
    );
    Ok(true)
}
