//! Logging initialization.
//!
//! Priority: `RUST_LOG` environment variable, then the supplied config,
//! then `info`. Output goes to the console, a file, or both, per config.

use crate::config::LoggingConfig;
use std::path::Path;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initializes the global tracing subscriber.
///
/// Returns the guard keeping the file writer alive; hold it for as long as
/// file logging should keep flushing. Calling this twice is harmless, the
/// second subscriber is simply not installed.
pub fn init_logging(config: Option<&LoggingConfig>) -> Option<WorkerGuard> {
    let env_filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if let Some(cfg) = config {
        EnvFilter::new(parse_level(&cfg.level).as_str())
    } else {
        EnvFilter::new("info")
    };

    let console = config.map(|c| c.console).unwrap_or(true);
    let json = config.map(|c| c.format == "json").unwrap_or(false);

    let (file_layer, guard) = match config.and_then(|c| c.file.as_deref()) {
        Some(path) => {
            let (writer, guard) = file_writer(path);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer);

    let result = if !console {
        tracing::subscriber::set_global_default(registry)
    } else if json {
        tracing::subscriber::set_global_default(
            registry.with(tracing_subscriber::fmt::layer().json()),
        )
    } else {
        tracing::subscriber::set_global_default(registry.with(tracing_subscriber::fmt::layer()))
    };
    let _ = result;

    guard
}

fn file_writer(path: &Path) -> (tracing_appender::non_blocking::NonBlocking, WorkerGuard) {
    let directory = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "fastcap.log".to_string());
    let appender = tracing_appender::rolling::never(directory, file_name);
    tracing_appender::non_blocking(appender)
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "error" | "critical" => Level::ERROR,
        "warn" => Level::WARN,
        "info" => Level::INFO,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("error"), Level::ERROR);
        assert_eq!(parse_level("critical"), Level::ERROR);
        assert_eq!(parse_level("WARN"), Level::WARN);
        assert_eq!(parse_level("debug"), Level::DEBUG);
        assert_eq!(parse_level("nonsense"), Level::INFO);
    }
}
