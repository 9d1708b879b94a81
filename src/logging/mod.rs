use crate::config::{LogLevel, LoggingConfig, LoggingOutput};
use std::fs;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::LevelFilter;

/// Keeps the non-blocking file writer flushing; hold it for the process lifetime.
#[derive(Debug)]
pub struct LoggingGuard {
    _worker: Option<tracing_appender::non_blocking::WorkerGuard>,
}

fn level_filter(level: LogLevel) -> LevelFilter {
    match level {
        LogLevel::Trace => LevelFilter::TRACE,
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Warn => LevelFilter::WARN,
        LogLevel::Error => LevelFilter::ERROR,
    }
}

/// Daily rolling appender under `cfg.file.dir`, keeping at most `max_files`.
pub fn open_file_appender(
    cfg: &LoggingConfig,
) -> Result<RollingFileAppender, Box<dyn std::error::Error + Send + Sync>> {
    fs::create_dir_all(&cfg.file.dir)?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(cfg.file.file_name.clone())
        .max_log_files(cfg.file.max_files.max(1))
        .build(&cfg.file.dir)?;
    Ok(appender)
}

pub fn init_logging(
    cfg: &LoggingConfig,
) -> Result<LoggingGuard, Box<dyn std::error::Error + Send + Sync>> {
    let level = level_filter(cfg.level);

    match cfg.output {
        LoggingOutput::Stdout => {
            let subscriber = tracing_subscriber::fmt()
                .with_max_level(level)
                .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
                .with_target(true)
                .with_file(cfg.include_source)
                .with_line_number(cfg.include_source)
                .with_ansi(true)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
            Ok(LoggingGuard { _worker: None })
        }
        LoggingOutput::File => {
            let (non_blocking, guard) = tracing_appender::non_blocking(open_file_appender(cfg)?);
            let subscriber = tracing_subscriber::fmt()
                .with_max_level(level)
                .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
                .with_target(true)
                .with_file(cfg.include_source)
                .with_line_number(cfg.include_source)
                .with_ansi(false)
                .with_writer(non_blocking)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
            Ok(LoggingGuard {
                _worker: Some(guard),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_appender_writes_prefixed_daily_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = LoggingConfig::default();
        cfg.file.dir = dir.path().join("logs").display().to_string();
        cfg.file.file_name = "bridge.log".to_string();

        let mut appender = open_file_appender(&cfg).unwrap();
        appender.write_all(b"hello\n").unwrap();
        appender.flush().unwrap();

        let names: Vec<String> = fs::read_dir(dir.path().join("logs"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("bridge.log"));
    }

    #[test]
    fn levels_map_to_filters() {
        assert_eq!(level_filter(LogLevel::Warn), LevelFilter::WARN);
        assert_eq!(level_filter(LogLevel::Trace), LevelFilter::TRACE);
    }
}
