//! Configuration management.

use crate::error::{KilnError, Result};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default layer cache size limit: 20 GB.
const DEFAULT_CACHE_SIZE_LIMIT: u64 = 20 * 1024 * 1024 * 1024;

/// Persistent configuration for kiln.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default tracing filter when neither `KILN_LOG` nor `RUST_LOG` is set
    pub log_level: String,
    /// Also append logs to `<data_dir>/logs/kiln.log`
    pub log_to_file: bool,
    /// Layer cache size limit in bytes (LRU eviction above this)
    pub cache_size_limit_bytes: u64,
    /// Program used to enter the materialized root filesystem for `RUN` steps
    pub chroot_program: String,
    /// Root of all kiln state
    pub data_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_to_file: true,
            cache_size_limit_bytes: DEFAULT_CACHE_SIZE_LIMIT,
            chroot_program: "chroot".to_string(),
            data_dir: paths::data_dir().to_string_lossy().to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_path())
    }

    /// Load configuration from `path`, falling back to defaults if it is absent.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| KilnError::InvalidConfig {
            reason: format!("Failed to read config {}: {}", path.display(), e),
        })?;
        serde_json::from_str(&content).map_err(|e| KilnError::InvalidConfig {
            reason: format!("Failed to parse config {}: {}", path.display(), e),
        })
    }

    /// Save configuration to `path`.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| KilnError::IoError { path: parent.to_path_buf(), source: e })?;
        }
        let content = serde_json::to_string_pretty(self).map_err(|e| KilnError::InvalidConfig {
            reason: format!("Failed to serialize config: {}", e),
        })?;
        std::fs::write(path, content)
            .map_err(|e| KilnError::IoError { path: path.to_path_buf(), source: e })
    }

    /// Data directory as a path.
    pub fn data_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }

    /// Path of the log file written when `log_to_file` is set.
    pub fn log_file(&self) -> PathBuf {
        paths::logs_dir_in(&self.data_path()).join("kiln.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_config_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let config = Config::load_from(&temp.path().join("config.json")).unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.chroot_program, "chroot");
    }

    #[test]
    fn test_save_and_reload() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("config.json");

        let config = Config {
            log_level: "debug".to_string(),
            log_to_file: false,
            cache_size_limit_bytes: 1024,
            chroot_program: "/usr/sbin/chroot".to_string(),
            data_dir: temp.path().to_string_lossy().to_string(),
        };
        config.save_to(&path).unwrap();

        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, r#"{"log_level": "warn"}"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.log_level, "warn");
        assert!(config.log_to_file);
        assert_eq!(config.cache_size_limit_bytes, DEFAULT_CACHE_SIZE_LIMIT);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(matches!(Config::load_from(&path), Err(KilnError::InvalidConfig { .. })));
    }
}
