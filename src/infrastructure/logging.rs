use crate::domain::settings::LogSettings;
use std::path::PathBuf;
use std::str::FromStr;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub struct LoggingGuard {
    // Dropping the guard flushes and stops the file writer.
    _guards: Vec<WorkerGuard>,
}

/// Install the global subscriber.
///
/// Filter precedence: `RUST_LOG`, then `level_override` (from the command
/// line), then `settings.level`. Console output goes to stderr so record
/// output on stdout stays machine readable.
pub fn init_logger(
    settings: &LogSettings,
    level_override: Option<&str>,
) -> anyhow::Result<LoggingGuard> {
    let mut guards = Vec::new();

    let level = level_override.unwrap_or(&settings.level);
    let level_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::from_str(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let console_layer = settings.console_logging_enabled.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_file(settings.show_file_line)
            .with_line_number(settings.show_file_line)
            .with_thread_ids(settings.show_thread_ids)
            .with_target(settings.show_target)
            .with_ansi(settings.ansi_colors)
    });

    let file_layer = if settings.file_logging_enabled {
        let log_dir = resolve_log_dir(&settings.log_dir);
        std::fs::create_dir_all(&log_dir)?;
        let file_appender = tracing_appender::rolling::RollingFileAppender::new(
            parse_rotation(&settings.rotation),
            &log_dir,
            &settings.file_name_prefix,
        );
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        guards.push(guard);
        Some(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_file(settings.show_file_line)
                .with_line_number(settings.show_file_line)
                .with_thread_ids(settings.show_thread_ids)
                .with_target(settings.show_target),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(level_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::debug!("Logging initialized");

    Ok(LoggingGuard { _guards: guards })
}

fn parse_rotation(name: &str) -> Rotation {
    match name.to_lowercase().as_str() {
        "hourly" => Rotation::HOURLY,
        "minutely" => Rotation::MINUTELY,
        "never" => Rotation::NEVER,
        _ => Rotation::DAILY,
    }
}

/// Relative log directories live under the user's local data directory.
fn resolve_log_dir(log_dir: &str) -> PathBuf {
    let path = PathBuf::from(log_dir);
    if path.is_absolute() {
        return path;
    }
    match dirs::data_local_dir() {
        Some(base) => base.join("Floaty").join(path),
        None => path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rotation() {
        assert_eq!(parse_rotation("Hourly"), Rotation::HOURLY);
        assert_eq!(parse_rotation("never"), Rotation::NEVER);
        assert_eq!(parse_rotation("weekly"), Rotation::DAILY);
    }

    #[test]
    fn test_absolute_log_dir_is_kept() {
        let dir = std::env::temp_dir().join("floaty-logs");
        let resolved = resolve_log_dir(dir.to_str().unwrap());
        assert_eq!(resolved, dir);
    }

    #[test]
    fn test_relative_log_dir_is_nested() {
        let resolved = resolve_log_dir("logs");
        assert!(resolved.ends_with("logs"));
    }
}
