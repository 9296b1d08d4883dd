//! Structured logging built on slog. Components take an optional parent
//! logger and fall back to the process-wide logger, which discards records
//! until configured.

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

use crate::config::ConfigError;
use lazy_static::lazy_static;
use sloggers::{Config, LoggerConfig};
use std::sync::Mutex;

const DEFAULT_TERMINAL_CONFIG: &str = r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#;

lazy_static! {
    static ref PROCESS: Mutex<Logger> = Mutex::new(Logger::root(Discard, o!()));
}

/// Builds a logger from a TOML logger configuration string.
pub fn from_toml_str(config: &str) -> Result<Logger, ConfigError> {
    let config: LoggerConfig = serdeconv::from_toml_str(config)?;
    Ok(config.build_logger()?)
}

/// Builds a stderr terminal logger with the default configuration.
pub fn terminal() -> Logger {
    from_toml_str(DEFAULT_TERMINAL_CONFIG).expect("Default logger configuration must be valid")
}

/// Installs the process-wide fallback logger.
pub fn set_process_logger(log: &Logger) {
    *PROCESS.lock().unwrap() = log.new(o!());
}

/// Returns a child of the process-wide logger.
pub fn process() -> Logger {
    PROCESS.lock().unwrap().new(o!())
}

/// Resolves the optional parent logger passed to a component constructor.
pub fn resolve<'a, L: Into<Option<&'a Logger>>>(log: L) -> Logger {
    match log.into() {
        Some(log) => log.new(o!()),
        None => process(),
    }
}
