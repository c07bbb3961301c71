use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::combat_log::default_log_directory;
use crate::error::SettingsError;

const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;
const DEFAULT_ERROR_BACKOFF_MS: u64 = 10_000;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitorSettings {
    pub log_directory: PathBuf,
    pub character_name: Option<String>,
    pub detect_character: bool,
    pub poll_interval_ms: u64,
    pub error_backoff_ms: u64,
    /// Where the JSON sink keeps its files; `None` keeps data in memory only.
    pub data_directory: Option<PathBuf>,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            log_directory: default_log_directory(),
            character_name: None,
            detect_character: true,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            error_backoff_ms: DEFAULT_ERROR_BACKOFF_MS,
            data_directory: None,
        }
    }
}

impl MonitorSettings {
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let raw_json = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        serde_json::from_str(&raw_json).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms.max(self.poll_interval_ms).max(1))
    }

    /// Configured name, ignoring blank values.
    pub fn character_name(&self) -> Option<&str> {
        self.character_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }
}
