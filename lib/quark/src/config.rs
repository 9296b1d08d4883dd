//! Library configuration loaded from TOML.

use serde_derive::Deserialize;
use slog::Logger;
use sloggers::{Config as _, LoggerConfig};
use std::fmt;
use std::path::{Path, PathBuf};

/// Process-level configuration for applications embedding the library.
#[derive(Deserialize, Default)]
pub struct Config {
    /// Logger setup; absent means the process logger is used as-is.
    #[serde(default)]
    pub logger: Option<LoggerConfig>,
    /// CA certificate bundle file for TLS verification.
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
    /// Directory of PEM certificates for TLS verification.
    #[serde(default)]
    pub ca_path: Option<PathBuf>,
    /// Lower bound on worker threads in the shared pool.
    #[serde(default)]
    pub min_threads: usize,
    /// Cores left out of the shared pool sizing.
    #[serde(default)]
    pub reserved_cores: usize,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        Ok(serdeconv::from_toml_file(path)?)
    }

    pub fn from_toml_str(toml: &str) -> Result<Config, ConfigError> {
        Ok(serdeconv::from_toml_str(toml)?)
    }

    /// Builds the configured logger, or a child of the process logger when
    /// no logger section is present.
    pub fn build_logger(&self) -> Result<Logger, ConfigError> {
        match &self.logger {
            Some(config) => Ok(config.build_logger()?),
            None => Ok(crate::logging::process()),
        }
    }
}

#[derive(Debug)]
pub struct ConfigError(String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "configuration error: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

impl From<serdeconv::Error> for ConfigError {
    fn from(err: serdeconv::Error) -> Self {
        ConfigError(err.to_string())
    }
}

impl From<sloggers::Error> for ConfigError {
    fn from(err: sloggers::Error) -> Self {
        ConfigError(err.to_string())
    }
}
