//! Kernel selection settings.
//!
//! Stored as JSON in the user's config directory:
//! - macOS: ~/Library/Application Support/runt-notebook/kernel-selection.json
//! - Linux: ~/.config/runt-notebook/kernel-selection.json
//! - Windows: C:\Users\<User>\AppData\Roaming\runt-notebook\kernel-selection.json
//!
//! Every field has a default, so a partial or missing file is fine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Where kernels are launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    /// Kernels run on this machine (interpreters and local kernelspecs).
    #[default]
    Local,
    /// Kernels run on a remote Jupyter server.
    Remote,
}

impl std::fmt::Display for LaunchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchMode::Local => write!(f, "local"),
            LaunchMode::Remote => write!(f, "remote"),
        }
    }
}

fn default_retrigger_debounce_ms() -> u64 {
    100
}

/// Settings for preferred-kernel selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SelectionSettings {
    /// Launch kernels locally or on a remote server.
    #[serde(default)]
    pub launch_mode: LaunchMode,

    /// Running without local process access (e.g. in a browser). A missing
    /// active interpreter is then expected rather than an error.
    #[serde(default)]
    pub web_only: bool,

    /// Delay before a preferred-kernel search starts. A newer search for the
    /// same notebook within this window replaces the pending one.
    #[serde(default)]
    pub search_debounce_ms: u64,

    /// Window for coalescing bursts of registry changes before re-running the
    /// search for open notebooks.
    #[serde(default = "default_retrigger_debounce_ms")]
    pub retrigger_debounce_ms: u64,

    /// JSON snapshot of a remote server's kernelspecs and live sessions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_snapshot: Option<PathBuf>,

    /// Where remembered live-kernel ids are persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_kernel_ids_path: Option<PathBuf>,
}

impl Default for SelectionSettings {
    fn default() -> Self {
        Self {
            launch_mode: LaunchMode::Local,
            web_only: false,
            search_debounce_ms: 0,
            retrigger_debounce_ms: default_retrigger_debounce_ms(),
            remote_snapshot: None,
            remote_kernel_ids_path: None,
        }
    }
}

impl SelectionSettings {
    pub fn search_debounce(&self) -> Duration {
        Duration::from_millis(self.search_debounce_ms)
    }

    pub fn retrigger_debounce(&self) -> Duration {
        Duration::from_millis(self.retrigger_debounce_ms)
    }

    pub fn remote_kernel_ids_path(&self) -> PathBuf {
        self.remote_kernel_ids_path
            .clone()
            .unwrap_or_else(crate::default_remote_kernel_ids_path)
    }
}

/// Load settings from `path`, returning defaults if it is missing or invalid.
pub fn load_settings_from(path: &Path) -> SelectionSettings {
    if path.exists() {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    } else {
        SelectionSettings::default()
    }
}

/// Load settings from the default location.
pub fn load_settings() -> SelectionSettings {
    load_settings_from(&crate::settings_json_path())
}

/// Save settings to `path`.
pub fn save_settings_to(path: &Path, settings: &SelectionSettings) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(settings)?)?;
    Ok(())
}

/// JSON Schema for the settings file.
pub fn settings_schema() -> serde_json::Value {
    serde_json::to_value(schemars::schema_for!(SelectionSettings)).unwrap_or_default()
}
