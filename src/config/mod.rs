//! Configuration module for the reader.
//!
//! Handles the settings file and environment variable expansion.

mod settings;

pub use settings::{
    expand_env_vars, DownloaderSettings, ModuleSettings, ReaderSettings, Settings, SettingsError,
    WorkerSettings, CONFIG_ENV,
};
