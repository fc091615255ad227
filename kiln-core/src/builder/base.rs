//! Base image resolution.
//!
//! The executor asks a [`BaseResolver`] for the starting filesystem of a
//! build. [`LocalBaseStore`] serves bases from a directory laid out as
//!
//! ```text
//! <root>/<name>/<tag>/rootfs/        unpacked root filesystem
//! <root>/<name>/<tag>/config.json    optional {"env": {...}}
//! <root>/<name>/<tag>.tar[.gz]       or a root filesystem archive
//! <root>/<name>/<tag>.json           optional config for the archive form
//! ```

use crate::builder::parser::ImageRef;
use crate::builder::snapshot::{Layer, Snapshot, SnapshotError};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// PATH given to bases that do not declare one.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Base image {reference} not found (looked in {searched:?})")]
    NotFound { reference: String, searched: PathBuf },

    #[error("Base image {reference} has digest {actual}, expected {expected}")]
    DigestMismatch { reference: String, expected: String, actual: String },

    #[error("Invalid base image config {path:?}: {reason}")]
    InvalidConfig { path: PathBuf, reason: String },

    #[error("Base image archive {path:?} has an inconsistent tree: {source}")]
    InvalidRootfs {
        path: PathBuf,
        #[source]
        source: SnapshotError,
    },

    #[error("Failed to read base image at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A resolved base image.
#[derive(Debug, Clone)]
pub struct BaseImage {
    pub reference: ImageRef,
    /// `sha256:<hex>` over the root filesystem and environment
    pub digest: String,
    pub rootfs: Snapshot,
    pub env: BTreeMap<String, String>,
}

/// Looks up base images by reference.
#[async_trait]
pub trait BaseResolver: Send + Sync {
    async fn resolve(&self, reference: &ImageRef) -> Result<BaseImage, ResolveError>;
}

#[derive(Debug, Default, Deserialize)]
struct BaseConfig {
    #[serde(default)]
    env: BTreeMap<String, String>,
}

/// Serves base images from a local directory.
#[derive(Debug, Clone)]
pub struct LocalBaseStore {
    root: PathBuf,
}

impl LocalBaseStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn image_dir(&self, reference: &ImageRef) -> Option<PathBuf> {
        // Names are path segments under the root; reject anything that could climb out
        let bad = |s: &str| s.is_empty() || s.split('/').any(|p| p.is_empty() || p == "." || p == "..");
        if bad(&reference.name) || bad(reference.tag_or_latest()) {
            return None;
        }
        Some(self.root.join(&reference.name))
    }

    fn load(&self, reference: &ImageRef) -> Result<(Snapshot, BaseConfig), ResolveError> {
        let not_found = || ResolveError::NotFound {
            reference: reference.to_string(),
            searched: self.root.clone(),
        };
        let image_dir = self.image_dir(reference).ok_or_else(not_found)?;
        let tag = reference.tag_or_latest();

        let unpacked = image_dir.join(tag);
        let rootfs_dir = unpacked.join("rootfs");
        if rootfs_dir.is_dir() {
            debug!(path = %rootfs_dir.display(), "Loading unpacked base");
            let rootfs = Snapshot::capture(&rootfs_dir)
                .map_err(|e| ResolveError::Io { path: rootfs_dir.clone(), source: e })?;
            let config = read_config(&unpacked.join("config.json"))?;
            return Ok((rootfs, config));
        }

        for (file, gzipped) in [(format!("{}.tar", tag), false), (format!("{}.tar.gz", tag), true)] {
            let archive = image_dir.join(&file);
            if !archive.is_file() {
                continue;
            }

            debug!(path = %archive.display(), "Loading base archive");
            let io_err = |e| ResolveError::Io { path: archive.clone(), source: e };
            let raw = std::fs::read(&archive).map_err(io_err)?;
            let bytes = if gzipped {
                let mut out = Vec::new();
                GzDecoder::new(raw.as_slice()).read_to_end(&mut out).map_err(io_err)?;
                out
            } else {
                raw
            };

            let mut rootfs = Snapshot::new();
            rootfs
                .apply(&Layer::from_tar(&bytes).map_err(io_err)?)
                .map_err(|e| ResolveError::InvalidRootfs { path: archive.clone(), source: e })?;
            let config = read_config(&image_dir.join(format!("{}.json", tag)))?;
            return Ok((rootfs, config));
        }

        Err(not_found())
    }
}

#[async_trait]
impl BaseResolver for LocalBaseStore {
    async fn resolve(&self, reference: &ImageRef) -> Result<BaseImage, ResolveError> {
        let store = self.clone();
        let wanted = reference.clone();
        let (rootfs, config) = tokio::task::spawn_blocking(move || store.load(&wanted))
            .await
            .map_err(|e| ResolveError::Io {
                path: self.root.clone(),
                source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
            })??;

        let mut env = config.env;
        env.entry("PATH".to_string()).or_insert_with(|| DEFAULT_PATH.to_string());

        let digest = base_digest(&rootfs, &env);
        if let Some(expected) = &reference.digest {
            if *expected != digest {
                return Err(ResolveError::DigestMismatch {
                    reference: reference.to_string(),
                    expected: expected.clone(),
                    actual: digest,
                });
            }
        }

        info!(base = %reference, %digest, entries = rootfs.len(), "Resolved base image");
        Ok(BaseImage { reference: reference.clone(), digest, rootfs, env })
    }
}

fn read_config(path: &Path) -> Result<BaseConfig, ResolveError> {
    if !path.exists() {
        return Ok(BaseConfig::default());
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| ResolveError::Io { path: path.to_path_buf(), source: e })?;
    serde_json::from_str(&content).map_err(|e| ResolveError::InvalidConfig {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn base_digest(rootfs: &Snapshot, env: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(rootfs.digest().as_bytes());
    for (key, value) in env {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\0");
    }
    format!("sha256:{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::snapshot::Entry;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_resolve_unpacked_base() {
        let temp = TempDir::new().unwrap();
        let rootfs = temp.path().join("python/3.12-slim/rootfs");
        std::fs::create_dir_all(rootfs.join("usr/local/bin")).unwrap();
        std::fs::write(rootfs.join("usr/local/bin/python"), "#!python").unwrap();
        std::fs::write(
            temp.path().join("python/3.12-slim/config.json"),
            r#"{"env": {"LANG": "C.UTF-8"}}"#,
        )
        .unwrap();

        let store = LocalBaseStore::new(temp.path());
        let base = store.resolve(&ImageRef::parse("python:3.12-slim")).await.unwrap();

        assert!(base.rootfs.contains("/usr/local/bin/python"));
        assert_eq!(base.env.get("LANG").map(String::as_str), Some("C.UTF-8"));
        assert_eq!(base.env.get("PATH").map(String::as_str), Some(DEFAULT_PATH));
        assert!(base.digest.starts_with("sha256:"));
    }

    #[tokio::test]
    async fn test_resolve_gzipped_archive() {
        let temp = TempDir::new().unwrap();
        let mut snap = Snapshot::new();
        snap.insert_file("/bin/sh", b"sh".to_vec(), 0o755).unwrap();
        let tar = Snapshot::new().diff(&snap).to_tar().unwrap();

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tar).unwrap();
        std::fs::create_dir_all(temp.path().join("alpine")).unwrap();
        std::fs::write(temp.path().join("alpine/latest.tar.gz"), encoder.finish().unwrap()).unwrap();

        let store = LocalBaseStore::new(temp.path());
        let base = store.resolve(&ImageRef::parse("alpine")).await.unwrap();
        assert_eq!(base.rootfs.read_file("/bin/sh"), Some(&b"sh"[..]));
    }

    #[tokio::test]
    async fn test_archive_with_file_parent_rejected() {
        let temp = TempDir::new().unwrap();
        let mut layer = Layer::default();
        layer.upserts.insert("/a".into(), Entry::File { mode: 0o644, data: b"x".to_vec() });
        layer.upserts.insert("/a/b".into(), Entry::File { mode: 0o644, data: b"y".to_vec() });
        std::fs::create_dir_all(temp.path().join("broken")).unwrap();
        std::fs::write(temp.path().join("broken/latest.tar"), layer.to_tar().unwrap()).unwrap();

        let store = LocalBaseStore::new(temp.path());
        let err = store.resolve(&ImageRef::parse("broken")).await.unwrap_err();
        match err {
            ResolveError::InvalidRootfs { source, .. } => {
                assert_eq!(source, SnapshotError::NotADirectory { path: "/a".into() })
            }
            other => panic!("Expected InvalidRootfs, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_base() {
        let temp = TempDir::new().unwrap();
        let store = LocalBaseStore::new(temp.path());

        let err = store.resolve(&ImageRef::parse("python:3.99")).await.unwrap_err();
        assert!(matches!(err, ResolveError::NotFound { .. }));

        let err = store.resolve(&ImageRef::parse("../etc:passwd")).await.unwrap_err();
        assert!(matches!(err, ResolveError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_pinned_digest_must_match() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("alpine/3.19/rootfs/etc")).unwrap();
        let store = LocalBaseStore::new(temp.path());

        let base = store.resolve(&ImageRef::parse("alpine:3.19")).await.unwrap();
        let pinned = ImageRef::parse(&format!("alpine:3.19@{}", base.digest));
        assert!(store.resolve(&pinned).await.is_ok());

        let wrong = ImageRef::parse("alpine:3.19@sha256:0000");
        assert!(matches!(
            store.resolve(&wrong).await,
            Err(ResolveError::DigestMismatch { .. })
        ));
    }
}
