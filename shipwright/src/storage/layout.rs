//! Storage layout configuration

use std::path::PathBuf;

use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::models::target::SlotKey;

/// Environment variable overriding the base directory
pub const HOME_ENV: &str = "SHIPWRIGHT_HOME";

/// On-disk layout for settings, records, locks and logs
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Get the settings file path
    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("settings.json"))
    }

    /// Directory holding one deployment record per slot
    pub fn records_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("records"))
    }

    /// Record file for `slot`
    pub fn record_file(&self, slot: &SlotKey) -> File {
        self.records_dir().file(&format!("{}.json", slot.file_stem()))
    }

    /// Directory holding cross-process target locks
    pub fn locks_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("locks"))
    }

    /// Lock file path for `slot`
    pub fn lock_file(&self, slot: &SlotKey) -> PathBuf {
        self.locks_dir()
            .path()
            .join(format!("{}.lock", slot.file_stem()))
    }

    /// Get the logs directory
    pub fn logs_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("logs"))
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        if let Some(home) = std::env::var_os(HOME_ENV) {
            return Self::new(home);
        }

        // Use /etc/shipwright on Linux, or user home directory on other platforms
        #[cfg(target_os = "linux")]
        let base_dir = PathBuf::from("/etc/shipwright");

        #[cfg(not(target_os = "linux"))]
        let base_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".shipwright");

        Self::new(base_dir)
    }
}

#[cfg(not(target_os = "linux"))]
mod dirs {
    use std::path::PathBuf;

    pub fn home_dir() -> Option<PathBuf> {
        std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from)
    }
}
