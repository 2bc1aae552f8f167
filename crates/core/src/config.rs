//! Core runtime configuration.
//!
//! Configuration is resolved once at process startup and then passed into core services as
//! `Arc<CoreConfig>`. Services never read environment variables while handling a message.

use crate::constants::DEFAULT_INSTRUMENT_ID;
use crate::error::{ConfigError, ConfigResult};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Which persistence collaborator backs the services.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    /// Process-local store; contents are lost on restart.
    Memory,
    /// JSON records under the data directory.
    File,
}

impl FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "mem" => Ok(StoreBackend::Memory),
            "file" | "fs" => Ok(StoreBackend::File),
            other => Err(ConfigError::InvalidInput(format!(
                "unknown store backend '{other}' (expected 'memory' or 'file')"
            ))),
        }
    }
}

/// Core configuration resolved at startup.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    data_dir: PathBuf,
    store_backend: StoreBackend,
    default_instrument_id: String,
}

impl CoreConfig {
    /// Create a new `CoreConfig`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidInput`] if `default_instrument_id` is blank.
    pub fn new(
        data_dir: PathBuf,
        store_backend: StoreBackend,
        default_instrument_id: String,
    ) -> ConfigResult<Self> {
        let default_instrument_id = default_instrument_id.trim().to_string();
        if default_instrument_id.is_empty() {
            return Err(ConfigError::InvalidInput(
                "default_instrument_id cannot be empty".into(),
            ));
        }

        Ok(Self {
            data_dir,
            store_backend,
            default_instrument_id,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn store_backend(&self) -> StoreBackend {
        self.store_backend
    }

    pub fn default_instrument_id(&self) -> &str {
        &self.default_instrument_id
    }
}

/// Parse the store backend from an optional environment value.
///
/// `None` or blank selects the file store.
pub fn store_backend_from_env_value(value: Option<String>) -> ConfigResult<StoreBackend> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(|v| v.parse())
        .transpose()
        .map(|parsed| parsed.unwrap_or(StoreBackend::File))
}

/// Default instrument id from an optional environment value.
pub fn default_instrument_from_env_value(value: Option<String>) -> String {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_INSTRUMENT_ID.to_string())
}
