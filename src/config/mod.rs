//! Configuration module
//!
//! Handles the connection and engine settings file

mod settings;

pub use settings::{AppConfig, ConfigError, ConnectionSettings, TcpSettings};

use directories::ProjectDirs;
use std::path::PathBuf;

/// Config file name inside the configuration directory
pub const CONFIG_FILE: &str = "config.toml";

/// Get the application configuration directory
pub fn config_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "dl24ctl", "dl24ctl").map(|dirs| dirs.config_dir().to_path_buf())
}

/// Default location of the config file
pub fn default_config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join(CONFIG_FILE))
}
