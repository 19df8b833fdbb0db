//! TOML-based configuration for the reader.
//!
//! Supports a config file (c2pa-reader.toml) with environment variable expansion.
//!
//! Example configuration:
//! ```toml
//! [module]
//! src = "https://cdn.example.com/toolkit_bg.wasm"
//!
//! [worker]
//! src = "${C2PA_HOME}/bin/c2pa-worker"
//! args = ["--quiet"]
//! channels = 4
//!
//! [reader]
//! fetch_remote_manifests = true
//!
//! [downloader]
//! timeout_secs = 30
//! ```

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::pool::default_channel_count;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "C2PA_READER_CONFIG";

/// Error type for settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Verification module location.
    pub module: ModuleSettings,

    /// Worker pool configuration.
    pub worker: WorkerSettings,

    /// Read pipeline behaviour.
    pub reader: ReaderSettings,

    /// HTTP client configuration.
    pub downloader: DownloaderSettings,
}

/// Verification module configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ModuleSettings {
    /// URL of the module binary (supports ${ENV_VAR} expansion).
    pub src: Option<String>,
}

/// Worker configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Path to the worker executable.
    pub src: Option<String>,

    /// Extra arguments passed to the worker executable.
    pub args: Vec<String>,

    /// Number of concurrent workers. Defaults to the CPU count.
    pub channels: Option<usize>,
}

/// Read pipeline configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReaderSettings {
    /// Follow remote manifest pointers.
    pub fetch_remote_manifests: bool,
}

impl Default for ReaderSettings {
    fn default() -> Self {
        Self {
            fetch_remote_manifests: true,
        }
    }
}

/// HTTP client configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DownloaderSettings {
    /// Whole-request timeout in seconds. No timeout when unset.
    pub timeout_secs: Option<u64>,
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SettingsError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from the default config file locations.
    ///
    /// Searches in order:
    /// 1. Environment variable `C2PA_READER_CONFIG`
    /// 2. `./c2pa-reader.toml`
    /// 3. `~/.config/c2pa-reader/config.toml`
    pub fn load() -> Result<Self, SettingsError> {
        // Check environment variable first
        if let Ok(path) = env::var(CONFIG_ENV) {
            return Self::from_file(&path);
        }

        // Check local directory
        let local_config = PathBuf::from("c2pa-reader.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        // Check user config directory
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("c2pa-reader").join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        // Return defaults if no config file found
        Ok(Settings::default())
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if self.worker.channels == Some(0) {
            return Err(SettingsError::InvalidConfig(
                "worker.channels must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Get the module URL with environment variables expanded.
    pub fn module_src(&self) -> Result<Option<String>, SettingsError> {
        self.module.src.as_deref().map(expand_env_vars).transpose()
    }

    /// Number of worker channels, defaulting to the CPU count.
    pub fn channel_count(&self) -> usize {
        self.worker.channels.unwrap_or_else(default_channel_count)
    }

    /// HTTP timeout, if one is configured.
    pub fn download_timeout(&self) -> Option<Duration> {
        self.downloader.timeout_secs.map(Duration::from_secs)
    }
}

/// Expand environment variables in a string.
///
/// Supports `${VAR}` and `$VAR` syntax.
pub fn expand_env_vars(s: &str) -> Result<String, SettingsError> {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }

        let var_name: String = if chars.next_if_eq(&'{').is_some() {
            chars.by_ref().take_while(|ch| *ch != '}').collect()
        } else {
            // $VAR ends at non-alphanumeric/underscore
            let mut name = String::new();
            while let Some(ch) = chars.next_if(|ch| ch.is_alphanumeric() || *ch == '_') {
                name.push(ch);
            }
            if name.is_empty() {
                // Just a lone $, keep it
                result.push('$');
                continue;
            }
            name
        };

        let value =
            env::var(&var_name).map_err(|_| SettingsError::MissingEnvVar(var_name.clone()))?;
        result.push_str(&value);
    }

    Ok(result)
}
