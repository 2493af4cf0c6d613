//! Store locations and startup options.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Application data directory name
pub const APP_DIR_NAME: &str = "Respectabullz";

/// Database file inside the data directory
pub const DB_FILE_NAME: &str = "respectabullz.db";

/// Directory holding key-value snapshot files
pub const STORAGE_DIR_NAME: &str = "storage";

/// Directory holding pre-migration backups
pub const BACKUP_DIR_NAME: &str = "backups";

/// Key under which the pre-relational app persisted its whole state
pub const LEGACY_SNAPSHOT_KEY: &str = "respectabullz-storage";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub db_path: PathBuf,
    pub storage_dir: PathBuf,
    pub snapshot_key: String,
    /// Directory for pre-migration backups; `None` disables them.
    pub backup_dir: Option<PathBuf>,
}

impl StoreConfig {
    /// Lay every path out under `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            db_path: dir.join(DB_FILE_NAME),
            storage_dir: dir.join(STORAGE_DIR_NAME),
            snapshot_key: LEGACY_SNAPSHOT_KEY.to_string(),
            backup_dir: Some(dir.join(BACKUP_DIR_NAME)),
        }
    }

    /// Platform defaults, e.g. `~/.local/share/Respectabullz` on Linux.
    ///
    /// Returns `None` when the platform has no data directory.
    pub fn platform_default() -> Option<Self> {
        dirs::data_dir().map(|dir| Self::in_dir(&dir.join(APP_DIR_NAME)))
    }

    #[must_use]
    pub fn with_db_path(mut self, db_path: impl Into<PathBuf>) -> Self {
        self.db_path = db_path.into();
        self
    }

    #[must_use]
    pub fn with_storage_dir(mut self, storage_dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = storage_dir.into();
        self
    }

    #[must_use]
    pub fn with_snapshot_key(mut self, key: impl Into<String>) -> Self {
        self.snapshot_key = key.into();
        self
    }

    #[must_use]
    pub fn without_backups(mut self) -> Self {
        self.backup_dir = None;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_dir_places_everything_under_the_directory() {
        let config = StoreConfig::in_dir(Path::new("/data/app"));
        assert_eq!(config.db_path, Path::new("/data/app/respectabullz.db"));
        assert_eq!(config.storage_dir, Path::new("/data/app/storage"));
        assert_eq!(config.backup_dir.as_deref(), Some(Path::new("/data/app/backups")));
        assert_eq!(config.snapshot_key, LEGACY_SNAPSHOT_KEY);
    }

    #[test]
    fn overrides_replace_single_fields() {
        let config = StoreConfig::in_dir(Path::new("/data/app"))
            .with_db_path("/tmp/other.db")
            .with_snapshot_key("custom")
            .without_backups();
        assert_eq!(config.db_path, Path::new("/tmp/other.db"));
        assert_eq!(config.storage_dir, Path::new("/data/app/storage"));
        assert_eq!(config.snapshot_key, "custom");
        assert!(config.backup_dir.is_none());
    }
}
