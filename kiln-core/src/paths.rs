//! Centralized path configuration for kiln.
//!
//! Every on-disk location (config, base images, layer cache, published
//! images, logs) hangs off a single data directory so tests and CI can
//! relocate all state with one environment variable.

use std::path::{Path, PathBuf};

/// Environment variable that overrides the data directory.
pub const DATA_DIR_ENV: &str = "KILN_DATA_DIR";

/// Get the kiln data directory.
///
/// Resolution order:
/// 1. `KILN_DATA_DIR` environment variable
/// 2. `~/.kiln`
/// 3. `.kiln` in the current directory when no home directory is known
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }

    dirs::home_dir().map(|h| h.join(".kiln")).unwrap_or_else(|| PathBuf::from(".kiln"))
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    data_dir().join("config.json")
}

/// Directory holding locally available base images.
pub fn bases_dir_in(data_dir: &Path) -> PathBuf {
    data_dir.join("bases")
}

/// Directory holding cached build layers.
pub fn cache_dir_in(data_dir: &Path) -> PathBuf {
    data_dir.join("cache").join("layers")
}

/// Directory holding published images.
pub fn images_dir_in(data_dir: &Path) -> PathBuf {
    data_dir.join("images")
}

/// Directory holding log files.
pub fn logs_dir_in(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

/// Scratch space for materialized root filesystems during `RUN` steps.
pub fn scratch_dir_in(data_dir: &Path) -> PathBuf {
    data_dir.join("tmp")
}
