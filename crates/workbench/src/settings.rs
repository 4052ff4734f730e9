//! Client settings persistence.
//!
//! Settings are stored in a JSON file in the user's config directory:
//! - macOS: ~/Library/Application Support/workbench/settings.json
//! - Linux: ~/.config/workbench/settings.json
//! - Windows: C:\Users\<User>\AppData\Roaming\workbench\settings.json

use crate::cell::FailedRunCount;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_server_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_username() -> String {
    "admin".to_string()
}

fn default_kernel_name() -> String {
    "python3".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

/// Client settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSettings {
    /// Base URL of the Jupyter server
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Server user whose contents and kernels are used
    #[serde(default = "default_username")]
    pub username: String,

    /// Kernel spec started when none is given
    #[serde(default = "default_kernel_name")]
    pub kernel_name: String,

    /// Seconds to wait for the kernel websocket to open
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Whether a failed run consumes an execution count
    #[serde(default)]
    pub failed_run_count: FailedRunCount,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            username: default_username(),
            kernel_name: default_kernel_name(),
            connect_timeout_secs: default_connect_timeout_secs(),
            failed_run_count: FailedRunCount::default(),
        }
    }
}

impl AppSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Directory holding settings and the stored token
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("workbench")
}

/// Get the path to the settings file
pub fn settings_path() -> PathBuf {
    config_dir().join("settings.json")
}

/// Load settings from disk, returning defaults if file doesn't exist
pub fn load_settings() -> AppSettings {
    load_settings_from(&settings_path())
}

pub fn load_settings_from(path: &Path) -> AppSettings {
    if path.exists() {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    } else {
        AppSettings::default()
    }
}

/// Save settings to disk
pub fn save_settings(settings: &AppSettings) -> Result<()> {
    save_settings_to(&settings_path(), settings)
}

pub fn save_settings_to(path: &Path, settings: &AppSettings) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(settings)?)?;
    Ok(())
}
