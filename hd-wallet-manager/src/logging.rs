//! Logging setup for applications embedding the wallet.
//!
//! The wallet itself only emits `tracing` events. Hosts that do not install
//! their own subscriber can call [`init_logging`] once at startup.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{LoggingError, LoggingResult};

/// Returned by [`init_logging`]. Keep it alive for as long as logging is wanted.
#[derive(Debug)]
pub struct LoggingGuard {
    _private: (),
}

/// Configuration for logging output.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level filter. If None, `RUST_LOG` is consulted, then INFO.
    pub level: Option<LevelFilter>,
    /// Whether to output logs to console (stderr).
    pub console: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: None,
            console: true,
        }
    }
}

/// Initialize console logging with the given level.
pub fn init_console_logging(level: LevelFilter) -> LoggingResult<LoggingGuard> {
    init_logging(LoggingConfig {
        level: Some(level),
        console: true,
    })
}

/// Initialize logging with the given configuration.
///
/// Fails if a global subscriber is already installed. With console output
/// disabled nothing is installed and tracing macros stay no-ops.
pub fn init_logging(config: LoggingConfig) -> LoggingResult<LoggingGuard> {
    if !config.console {
        return Ok(LoggingGuard {
            _private: (),
        });
    }

    let env_filter = match config.level {
        Some(level) => EnvFilter::new(level.to_string()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(LevelFilter::INFO.to_string())),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).with_thread_ids(false).with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| LoggingError::SubscriberInit(e.to_string()))?;

    Ok(LoggingGuard {
        _private: (),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_console_installs_nothing() {
        let guard = init_logging(LoggingConfig {
            level: Some(LevelFilter::DEBUG),
            console: false,
        });
        assert!(guard.is_ok());
    }
}
