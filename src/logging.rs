//! Structured logging setup for the deploy binary
//!
//! Logs go to stderr so that `run` and `split` can print their JSON report on
//! stdout. Per-action output is written separately by [`crate::action::ActionLog`].

use clap::ValueEnum;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::FmtSubscriber;

/// Verbosity of the process log
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// Output encoding of the process log
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// One JSON object per event, for log shippers
    Json,
    /// Human readable, for interactive runs
    Pretty,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// Include the emitting module in each event
    pub with_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Json,
            with_target: false,
        }
    }
}

impl LogConfig {
    pub fn new(level: LogLevel, format: LogFormat) -> Self {
        Self {
            level,
            format,
            // Targets help when chasing executor internals
            with_target: matches!(level, LogLevel::Debug | LogLevel::Trace),
        }
    }
}

/// Install the global subscriber
///
/// Fails if a global subscriber is already set.
pub fn init_logging(config: &LogConfig) -> anyhow::Result<()> {
    let level: Level = config.level.into();

    match config.format {
        LogFormat::Json => {
            let subscriber = FmtSubscriber::builder()
                .json()
                .with_max_level(level)
                .with_target(config.with_target)
                .with_span_events(FmtSpan::CLOSE)
                .with_writer(std::io::stderr)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        LogFormat::Pretty => {
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .with_target(config.with_target)
                .with_writer(std::io::stderr)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_from_str() {
        assert_eq!(LogLevel::from_str("error", true).unwrap(), LogLevel::Error);
        assert_eq!(LogLevel::from_str("INFO", true).unwrap(), LogLevel::Info);
        assert!(LogLevel::from_str("verbose", true).is_err());
    }

    #[test]
    fn test_log_level_to_tracing_level() {
        let level: Level = LogLevel::Warn.into();
        assert_eq!(level, Level::WARN);

        let level: Level = LogLevel::Trace.into();
        assert_eq!(level, Level::TRACE);
    }

    #[test]
    fn test_log_config() {
        let config = LogConfig::default();
        assert_eq!(config.format, LogFormat::Json);
        assert!(!config.with_target);

        assert!(LogConfig::new(LogLevel::Debug, LogFormat::Pretty).with_target);
        assert!(!LogConfig::new(LogLevel::Info, LogFormat::Pretty).with_target);
    }
}
