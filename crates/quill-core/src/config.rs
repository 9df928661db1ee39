//! Engine launch configuration

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the engine binary path
pub const ENGINE_PATH_ENV: &str = "QUILL_ENGINE";
/// Environment variable overriding the stderr log directory
pub const ERROR_LOG_DIR_ENV: &str = "QUILL_ERROR_LOG_DIR";

/// Default cap on a single line of engine output (16 MiB)
pub const DEFAULT_MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// How to launch and talk to the text engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Path to the engine binary
    pub binary_path: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// When set, engine stderr is appended to a log file in this directory.
    #[serde(default)]
    pub error_log_dir: Option<PathBuf>,
    #[serde(default)]
    pub connection: ConnectionOptions,
}

/// Dispatcher tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionOptions {
    /// Close the connection on the first protocol error instead of dropping the message.
    pub strict_protocol: bool,
    pub max_line_bytes: usize,
    /// How long `close()` waits for the engine to exit before killing it.
    #[serde(with = "millis")]
    pub shutdown_grace: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            strict_protocol: false,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

impl EngineConfig {
    /// Create a configuration for the given engine binary
    pub fn new(binary_path: impl Into<PathBuf>) -> Self {
        Self {
            binary_path: binary_path.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            error_log_dir: None,
            connection: ConnectionOptions::default(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_error_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.error_log_dir = Some(dir.into());
        self
    }

    pub fn with_connection_options(mut self, options: ConnectionOptions) -> Self {
        self.connection = options;
        self
    }

    /// Load a configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration from `QUILL_ENGINE` / `QUILL_ERROR_LOG_DIR`.
    pub fn from_env() -> Result<Self> {
        let binary = std::env::var_os(ENGINE_PATH_ENV)
            .ok_or_else(|| Error::Config(format!("{} is not set", ENGINE_PATH_ENV)))?;
        Ok(Self::new(binary).apply_env_overrides())
    }

    /// Apply environment overrides on top of an existing configuration
    pub fn apply_env_overrides(mut self) -> Self {
        if let Some(binary) = std::env::var_os(ENGINE_PATH_ENV) {
            self.binary_path = binary.into();
        }
        if let Some(dir) = std::env::var_os(ERROR_LOG_DIR_ENV) {
            self.error_log_dir = Some(dir.into());
        }
        self
    }

    /// Check the configuration for values the transport cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.binary_path.as_os_str().is_empty() {
            return Err(Error::Config("Engine binary path is empty".to_string()));
        }
        if self.connection.max_line_bytes == 0 {
            return Err(Error::Config("maxLineBytes must be greater than zero".to_string()));
        }
        Ok(())
    }
}

/// Platform default for engine stderr logs (`<cache>/quill/logs`)
pub fn default_error_log_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| dir.join("quill").join("logs"))
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
