//! Logging for devup.
//!
//! Provides file-based logging with millisecond timestamps. The log file
//! path supports a `{config_dir}` placeholder, resolved against the user's
//! config home.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::runtime::LoggingConfig;

/// Initialize logging based on configuration.
///
/// `verbosity` is the repeat count of the CLI's `-v` flag; it raises the
/// effective level beyond what `config.level`/`RUST_LOG` specify, but never
/// lowers it.
pub fn init_logging(config: &LoggingConfig, config_dir: &std::path::Path, verbosity: u8) -> Result<()> {
    if !config.enabled {
        return Ok(());
    }

    let log_file = config
        .file
        .replace("{config_dir}", &config_dir.to_string_lossy());
    let log_path = PathBuf::from(&log_file);

    let log_dir = log_path.parent().context("invalid log file path")?.to_path_buf();
    let log_filename = log_path
        .file_name()
        .context("invalid log filename")?
        .to_str()
        .context("invalid UTF-8 in log filename")?;

    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create log directory: {}", log_dir.display()))?;

    let base_level = parse_log_level(&config.level)?;
    let level = bump_for_verbosity(base_level, verbosity);

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(log_filename)
        .build(log_dir)
        .context("failed to create log file appender")?;

    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .with_timer(fmt::time::ChronoLocal::new(
            "%Y-%m-%d %H:%M:%S%.3f".to_string(),
        ))
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false);

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.to_string()))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .try_init()
        .context("failed to initialize tracing subscriber")?;

    tracing::info!(log_file = %log_file, level = %level, "logging initialized");

    Ok(())
}

fn parse_log_level(level: &str) -> Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => anyhow::bail!("invalid log level: {}", level),
    }
}

fn bump_for_verbosity(base: Level, verbosity: u8) -> Level {
    match verbosity {
        0 => base,
        1 => base.max(Level::DEBUG),
        _ => Level::TRACE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_levels() {
        assert!(matches!(parse_log_level("trace"), Ok(Level::TRACE)));
        assert!(matches!(parse_log_level("debug"), Ok(Level::DEBUG)));
        assert!(matches!(parse_log_level("info"), Ok(Level::INFO)));
        assert!(matches!(parse_log_level("warn"), Ok(Level::WARN)));
        assert!(matches!(parse_log_level("error"), Ok(Level::ERROR)));
        assert!(parse_log_level("invalid").is_err());
    }

    #[test]
    fn verbosity_only_ever_raises_the_level() {
        assert_eq!(bump_for_verbosity(Level::INFO, 0), Level::INFO);
        assert_eq!(bump_for_verbosity(Level::INFO, 1), Level::DEBUG);
        assert_eq!(bump_for_verbosity(Level::INFO, 5), Level::TRACE);
    }
}
