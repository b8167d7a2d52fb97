//! Settings persistence.
//!
//! Settings are stored in a JSON file in the user's config directory:
//! - macOS: ~/Library/Application Support/labcomm/settings.json
//! - Linux: ~/.config/labcomm/settings.json
//! - Windows: C:\Users\<User>\AppData\Roaming\labcomm\settings.json
//!
//! Every field has a default, so partial files are fine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::dispatcher::Timeouts;
use crate::polling::PollPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Base URL of the notebook server.
    pub base_url: String,

    /// Path of the backend UI below `base_url`.
    pub backend_path: String,

    /// Kernelspec language of managed notebooks.
    pub target_language: String,

    /// Directory relative notebook paths are resolved against.
    pub server_root: Option<PathBuf>,

    /// Delay between status probes while waiting for the backend.
    pub poll_interval_ms: u64,

    pub license_max_attempts: u32,

    pub start_max_attempts: u32,

    pub convert_timeout_secs: u64,

    /// Timeout for non-convert requests. `null` waits indefinitely.
    pub request_timeout_secs: Option<u64>,

    /// Delay before the backend UI is opened after a conversion.
    pub open_delay_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8888/".to_string(),
            backend_path: "matlab/default/index.html".to_string(),
            target_language: "matlab".to_string(),
            server_root: None,
            poll_interval_ms: 1000,
            license_max_attempts: 600,
            start_max_attempts: 600,
            convert_timeout_secs: 50,
            request_timeout_secs: Some(300),
            open_delay_ms: 1500,
        }
    }
}

impl Settings {
    /// URL of the backend UI.
    pub fn backend_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let path = self.backend_path.trim_start_matches('/');
        format!("{}/{}", base, path)
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            convert: Duration::from_secs(self.convert_timeout_secs),
            request: self.request_timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn license_policy(&self) -> PollPolicy {
        PollPolicy::new(self.poll_interval(), Some(self.license_max_attempts))
    }

    pub fn start_policy(&self) -> PollPolicy {
        PollPolicy::new(self.poll_interval(), Some(self.start_max_attempts))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn open_delay(&self) -> Duration {
        Duration::from_millis(self.open_delay_ms)
    }
}

/// Get the path to the settings file
pub fn settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("labcomm")
        .join("settings.json")
}

/// Load settings from disk, returning defaults if the file is missing or invalid
pub fn load_settings() -> Settings {
    let path = settings_path();
    if path.exists() {
        load_settings_from(&path).unwrap_or_else(|e| {
            log::warn!("[labcomm-settings] Ignoring {}: {:#}", path.display(), e);
            Settings::default()
        })
    } else {
        Settings::default()
    }
}

/// Load settings from an explicit file.
pub fn load_settings_from(path: &Path) -> Result<Settings> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("Invalid settings in {}", path.display()))
}

/// Save settings to disk
pub fn save_settings(settings: &Settings) -> Result<()> {
    save_settings_to(&settings_path(), settings)
}

pub fn save_settings_to(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(settings)?)?;
    Ok(())
}
