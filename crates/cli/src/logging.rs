//! Tracing subscriber setup
//!
//! Console output goes to stderr so `--json` listings stay parseable. When
//! `log_file` is set, events are also written to a daily rotated file.

use clap::ValueEnum;
use snapwatch_core::Config;
use std::path::Path;
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Console-only subscriber for the time before the configuration is known
///
/// Defaults to warnings so config diagnostics are never lost.
pub fn bootstrap(format: LogFormat) -> impl tracing::Subscriber + Send + Sync {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(fmt_layer(format, std::io::stderr, true))
        .with(filter)
}

/// Install the global subscriber
///
/// `RUST_LOG` wins over the configured level. The returned guard flushes
/// the file writer and must be held until exit.
pub fn init(config: &Config, format: LogFormat) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let mut layers: Vec<BoxedLayer> = vec![fmt_layer(format, std::io::stderr, true)];

    let mut guard = None;
    let mut file_error = None;
    if let Some(path) = &config.log_file {
        match file_appender(path) {
            Ok(appender) => {
                let (writer, worker) = tracing_appender::non_blocking(appender);
                layers.push(fmt_layer(format, writer, false));
                guard = Some(worker);
            }
            Err(e) => file_error = Some((path, e)),
        }
    }

    tracing_subscriber::registry().with(layers).with(filter).init();

    if let Some((path, error)) = file_error {
        warn!(path = %path.display(), %error, "Cannot write log file, logging to console only");
    }
    guard
}

fn fmt_layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer().with_writer(writer).with_ansi(ansi);
    match format {
        LogFormat::Text => layer.boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}

/// Daily rotated appender for `path`; the date is appended to the file name
fn file_appender(path: &Path) -> Result<RollingFileAppender, String> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| "log_file has no file name".to_string())?;

    std::fs::create_dir_all(dir).map_err(|e| e.to_string())?;
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(file_name)
        .build(dir)
        .map_err(|e| e.to_string())
}
