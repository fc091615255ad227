//! Layer cache for kiln.
//!
//! Each completed build step stores its layer archive under the step's
//! cache key. A later build whose step computes the same key reuses the
//! archive instead of running the step again. Entries are evicted least
//! recently used first once the cache grows past its size limit.

use crate::builder::snapshot::layer_digest;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Metadata stored next to each cached layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerMetadata {
    /// Cache key (SHA256 hex)
    pub cache_key: String,
    /// Digest of the layer archive (`sha256:<hex>`)
    pub digest: String,
    /// Size of the layer archive in bytes
    pub size_bytes: u64,
    /// Creation time, Unix milliseconds
    pub created_at: u64,
    /// Last lookup hit, Unix milliseconds (for LRU)
    pub last_accessed: u64,
    /// Descriptor line of the step that produced the layer
    pub step_description: String,
    /// Step number within its build
    pub step: usize,
}

/// Result of a cache lookup.
#[derive(Debug)]
pub enum CacheLookupResult {
    Hit { layer_path: PathBuf, metadata: LayerMetadata },
    Miss,
}

/// Cache usage summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub layers: usize,
    pub total_bytes: u64,
    pub size_limit: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to serialize/deserialize metadata: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid cache key: {0}")]
    InvalidKey(String),

    #[error("Cache directory not accessible: {0}")]
    CacheDirectoryError(String),
}

/// Manages cached build layers in one directory.
#[derive(Debug)]
pub struct CacheManager {
    cache_dir: PathBuf,
    size_limit: u64,
}

impl CacheManager {
    /// Opens (creating if needed) a cache directory with a size limit in bytes.
    pub fn with_config(cache_dir: PathBuf, size_limit: u64) -> Result<Self, CacheError> {
        fs::create_dir_all(&cache_dir).map_err(|e| {
            CacheError::CacheDirectoryError(format!(
                "Failed to create {}: {}",
                cache_dir.display(),
                e
            ))
        })?;

        Ok(Self { cache_dir, size_limit })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Looks up a layer by cache key, refreshing its LRU timestamp on a hit.
    pub fn lookup(&mut self, cache_key: &str) -> Result<CacheLookupResult, CacheError> {
        validate_key(cache_key)?;
        let layer_path = self.layer_path(cache_key);

        if !layer_path.exists() || !self.metadata_path(cache_key).exists() {
            debug!(cache_key, "Cache miss");
            return Ok(CacheLookupResult::Miss);
        }

        let mut metadata = self.load_metadata(cache_key)?;
        metadata.last_accessed = current_millis();
        self.save_metadata(&metadata)?;

        debug!(cache_key, step = metadata.step, "Cache hit: {}", metadata.step_description);
        Ok(CacheLookupResult::Hit { layer_path, metadata })
    }

    /// Reads a cached layer archive.
    pub fn load_layer(&self, cache_key: &str) -> Result<Vec<u8>, CacheError> {
        validate_key(cache_key)?;
        Ok(fs::read(self.layer_path(cache_key))?)
    }

    /// Stores a layer archive under `cache_key`, then evicts if over the limit.
    pub fn insert(
        &mut self,
        cache_key: &str,
        layer_data: &[u8],
        step_description: String,
        step: usize,
    ) -> Result<LayerMetadata, CacheError> {
        validate_key(cache_key)?;

        // Archive first via a temp name; an entry only counts once its
        // metadata exists
        let layer_path = self.layer_path(cache_key);
        let tmp_path = self.cache_dir.join(format!(".layer-{}.tar.tmp", cache_key));
        fs::write(&tmp_path, layer_data)?;
        fs::rename(&tmp_path, &layer_path)?;

        let now = current_millis();
        let metadata = LayerMetadata {
            cache_key: cache_key.to_string(),
            digest: layer_digest(layer_data),
            size_bytes: layer_data.len() as u64,
            created_at: now,
            last_accessed: now,
            step_description,
            step,
        };
        self.save_metadata(&metadata)?;

        debug!(
            cache_key,
            size_bytes = metadata.size_bytes,
            "Cached layer: {}",
            metadata.step_description
        );

        self.evict_if_needed()?;
        Ok(metadata)
    }

    /// Removes a layer from the cache.
    pub fn remove(&self, cache_key: &str) -> Result<(), CacheError> {
        validate_key(cache_key)?;

        for path in [self.layer_path(cache_key), self.metadata_path(cache_key)] {
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }

        debug!(cache_key, "Removed layer from cache");
        Ok(())
    }

    /// Clears all cached layers.
    pub fn clear(&self) -> Result<(), CacheError> {
        for entry in fs::read_dir(&self.cache_dir)? {
            let path = entry?.path();
            if path.is_file() {
                fs::remove_file(path)?;
            }
        }

        info!(cache_dir = %self.cache_dir.display(), "Cleared layer cache");
        Ok(())
    }

    /// Total size of cached layer archives in bytes.
    pub fn total_size(&self) -> Result<u64, CacheError> {
        let mut total = 0u64;
        for path in self.layer_files()? {
            total += fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        }
        Ok(total)
    }

    /// Number of cached layers.
    pub fn layer_count(&self) -> Result<usize, CacheError> {
        Ok(self.layer_files()?.len())
    }

    pub fn stats(&self) -> Result<CacheStats, CacheError> {
        Ok(CacheStats {
            layers: self.layer_count()?,
            total_bytes: self.total_size()?,
            size_limit: self.size_limit,
        })
    }

    fn layer_files(&self) -> Result<Vec<PathBuf>, CacheError> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.cache_dir)? {
            let path = entry?.path();
            let is_layer = path.is_file()
                && path.extension().map(|e| e == "tar").unwrap_or(false)
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("layer-"))
                    .unwrap_or(false);
            if is_layer {
                files.push(path);
            }
        }
        Ok(files)
    }

    /// All entries, least recently used first.
    fn list_layers_by_lru(&self) -> Result<Vec<LayerMetadata>, CacheError> {
        let mut layers = Vec::new();

        for entry in fs::read_dir(&self.cache_dir)? {
            let path = entry?.path();
            if !path.is_file() || path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }

            let key = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.strip_prefix("layer-"));
            if let Some(key) = key {
                match self.load_metadata(key) {
                    Ok(metadata) => layers.push(metadata),
                    Err(e) => warn!(cache_key = key, error = %e, "Skipping unreadable cache metadata"),
                }
            }
        }

        layers.sort_by(|a, b| {
            a.last_accessed.cmp(&b.last_accessed).then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(layers)
    }

    /// LRU eviction down to the size limit.
    fn evict_if_needed(&mut self) -> Result<(), CacheError> {
        let total_size = self.total_size()?;
        if total_size <= self.size_limit {
            return Ok(());
        }

        warn!(
            total_size,
            size_limit = self.size_limit,
            "Layer cache over its size limit, evicting least recently used layers"
        );

        let mut current_size = total_size;
        for layer in self.list_layers_by_lru()? {
            if current_size <= self.size_limit {
                break;
            }
            info!(cache_key = %layer.cache_key, size_bytes = layer.size_bytes, "Evicting layer");
            self.remove(&layer.cache_key)?;
            current_size = current_size.saturating_sub(layer.size_bytes);
        }

        Ok(())
    }

    fn layer_path(&self, cache_key: &str) -> PathBuf {
        self.cache_dir.join(format!("layer-{}.tar", cache_key))
    }

    fn metadata_path(&self, cache_key: &str) -> PathBuf {
        self.cache_dir.join(format!("layer-{}.json", cache_key))
    }

    fn load_metadata(&self, cache_key: &str) -> Result<LayerMetadata, CacheError> {
        let contents = fs::read_to_string(self.metadata_path(cache_key))?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn save_metadata(&self, metadata: &LayerMetadata) -> Result<(), CacheError> {
        let json = serde_json::to_string_pretty(metadata)?;
        fs::write(self.metadata_path(&metadata.cache_key), json)?;
        Ok(())
    }
}

/// Keys are hex digests; anything else could escape the cache directory.
fn validate_key(cache_key: &str) -> Result<(), CacheError> {
    if cache_key.is_empty() || !cache_key.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(CacheError::InvalidKey(cache_key.to_string()));
    }
    Ok(())
}

fn current_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    fn manager(limit: u64) -> (TempDir, CacheManager) {
        let temp = TempDir::new().unwrap();
        let manager = CacheManager::with_config(temp.path().join("layers"), limit).unwrap();
        (temp, manager)
    }

    #[test]
    fn test_cache_manager_creation() {
        let (_temp, manager) = manager(1024 * 1024);
        assert!(manager.cache_dir().is_dir());
        assert_eq!(manager.layer_count().unwrap(), 0);
    }

    #[test]
    fn test_cache_miss() {
        let (_temp, mut manager) = manager(1024 * 1024);
        assert!(matches!(manager.lookup("abc123def456").unwrap(), CacheLookupResult::Miss));
    }

    #[test]
    fn test_cache_hit() {
        let (_temp, mut manager) = manager(1024 * 1024);
        let layer_data = b"fake layer data";

        let stored = manager.insert("abc123def456", layer_data, "RUN pip install".into(), 5).unwrap();
        assert_eq!(stored.digest, layer_digest(layer_data));

        match manager.lookup("abc123def456").unwrap() {
            CacheLookupResult::Hit { metadata, layer_path } => {
                assert_eq!(metadata.size_bytes, layer_data.len() as u64);
                assert_eq!(metadata.step_description, "RUN pip install");
                assert_eq!(metadata.step, 5);
                assert!(layer_path.exists());
            }
            CacheLookupResult::Miss => panic!("Expected cache hit"),
        }

        assert_eq!(manager.load_layer("abc123def456").unwrap(), layer_data);
    }

    #[test]
    fn test_cache_removal() {
        let (_temp, mut manager) = manager(1024 * 1024);
        manager.insert("abc789def012", b"some data", "test".into(), 1).unwrap();
        assert!(matches!(manager.lookup("abc789def012").unwrap(), CacheLookupResult::Hit { .. }));

        manager.remove("abc789def012").unwrap();
        assert!(matches!(manager.lookup("abc789def012").unwrap(), CacheLookupResult::Miss));
    }

    #[test]
    fn test_total_size_and_count() {
        let (_temp, mut manager) = manager(1024 * 1024);
        manager.insert("aaa111", &vec![0u8; 1024], "layer1".into(), 1).unwrap();
        manager.insert("bbb222", &vec![0u8; 2048], "layer2".into(), 2).unwrap();

        let stats = manager.stats().unwrap();
        assert_eq!(stats.total_bytes, 3072);
        assert_eq!(stats.layers, 2);
        assert_eq!(stats.size_limit, 1024 * 1024);
    }

    #[test]
    fn test_lru_eviction() {
        let (_temp, mut manager) = manager(2048);

        manager.insert("aaa111", &vec![0u8; 1024], "layer1".into(), 1).unwrap();
        thread::sleep(Duration::from_millis(5));
        manager.insert("bbb222", &vec![0u8; 1024], "layer2".into(), 2).unwrap();
        thread::sleep(Duration::from_millis(5));

        // Touch the oldest entry so the middle one becomes least recent
        assert!(matches!(manager.lookup("aaa111").unwrap(), CacheLookupResult::Hit { .. }));
        thread::sleep(Duration::from_millis(5));
        manager.insert("ccc333", &vec![0u8; 1024], "layer3".into(), 3).unwrap();

        assert!(manager.total_size().unwrap() <= 2048);
        assert!(matches!(manager.lookup("bbb222").unwrap(), CacheLookupResult::Miss));
        assert!(matches!(manager.lookup("aaa111").unwrap(), CacheLookupResult::Hit { .. }));
        assert!(matches!(manager.lookup("ccc333").unwrap(), CacheLookupResult::Hit { .. }));
    }

    #[test]
    fn test_clear_cache() {
        let (_temp, mut manager) = manager(1024 * 1024);
        manager.insert("aaa111", b"data1", "l1".into(), 1).unwrap();
        manager.insert("bbb222", b"data2", "l2".into(), 2).unwrap();

        manager.clear().unwrap();
        assert_eq!(manager.layer_count().unwrap(), 0);
        assert_eq!(manager.total_size().unwrap(), 0);
    }

    #[test]
    fn test_invalid_cache_key() {
        let (_temp, mut manager) = manager(1024 * 1024);
        assert!(matches!(
            manager.insert("../escape", b"data", "test".into(), 1),
            Err(CacheError::InvalidKey(_))
        ));
        assert!(matches!(manager.lookup("not hex!"), Err(CacheError::InvalidKey(_))));
    }
}
