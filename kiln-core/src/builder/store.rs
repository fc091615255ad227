//! Local image store.
//!
//! Published images live under the images directory:
//!
//! ```text
//! <images>/<id>/manifest.json
//! <images>/<id>/layers/<hex>.tar.gz
//! <images>/refs/<name>/<tag>          contains <id>
//! ```
//!
//! Images are written into a temporary directory and renamed into place, so
//! a reader never sees a partially published image.

use crate::builder::executor::BuiltLayer;
use crate::builder::image::ImageManifest;
use crate::builder::snapshot::{layer_digest, Layer, Snapshot, SnapshotError};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

const MANIFEST_FILE: &str = "manifest.json";
const LAYERS_DIR: &str = "layers";
const REFS_DIR: &str = "refs";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Image not found: {reference}")]
    NotFound { reference: String },

    #[error("Image reference {reference} is ambiguous: matches {}", matches.join(", "))]
    Ambiguous { reference: String, matches: Vec<String> },

    #[error("Invalid image reference: {reference}")]
    InvalidReference { reference: String },

    #[error("Layer {digest} of image {image} is corrupt")]
    CorruptLayer { image: String, digest: String },

    #[error("Layer {digest} of image {image} does not apply: {source}")]
    InvalidLayer {
        image: String,
        digest: String,
        #[source]
        source: SnapshotError,
    },

    #[error("Image store I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid manifest for image {image}: {source}")]
    Manifest {
        image: String,
        #[source]
        source: serde_json::Error,
    },
}

/// One row of `kiln images`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSummary {
    pub id: String,
    pub name: String,
    pub tag: String,
    pub created: DateTime<Utc>,
    pub size_bytes: u64,
}

/// Filesystem-backed store of built images.
#[derive(Debug, Clone)]
pub struct ImageStore {
    root: PathBuf,
}

impl ImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn image_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn ref_path(&self, name: &str, tag: &str) -> PathBuf {
        self.root.join(REFS_DIR).join(name).join(tag)
    }

    /// Stores an image and points `name:tag` at it. Returns the image id.
    ///
    /// Publishing an id that already exists only moves the tag.
    #[instrument(skip_all, fields(image = %manifest.reference()))]
    pub fn publish(&self, manifest: &ImageManifest, layers: &[BuiltLayer]) -> Result<String, StoreError> {
        validate_name(&manifest.name)?;
        validate_name(&manifest.tag)?;

        let id = manifest.image_id();
        let image_dir = self.image_dir(&id);

        if image_dir.join(MANIFEST_FILE).exists() {
            debug!(%id, "Image content already stored");
        } else {
            self.write_image(&id, manifest, layers)?;
        }

        self.write_ref(&manifest.name, &manifest.tag, &id)?;
        info!(%id, layers = layers.len(), "Published image {}", manifest.reference());
        Ok(id)
    }

    fn write_image(
        &self,
        id: &str,
        manifest: &ImageManifest,
        layers: &[BuiltLayer],
    ) -> Result<(), StoreError> {
        let staging = self.root.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
        let layers_dir = staging.join(LAYERS_DIR);
        fs::create_dir_all(&layers_dir).map_err(io_err(&layers_dir))?;

        let result = (|| {
            for layer in layers {
                let path = layers_dir.join(layer_file(&layer.descriptor.digest));
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(&layer.data).map_err(io_err(&path))?;
                let compressed = encoder.finish().map_err(io_err(&path))?;
                fs::write(&path, compressed).map_err(io_err(&path))?;
            }

            let manifest_path = staging.join(MANIFEST_FILE);
            let json = serde_json::to_string_pretty(manifest)
                .map_err(|e| StoreError::Manifest { image: id.to_string(), source: e })?;
            fs::write(&manifest_path, json).map_err(io_err(&manifest_path))?;

            let target = self.image_dir(id);
            fs::rename(&staging, &target).map_err(io_err(&target))
        })();

        if result.is_err() && staging.exists() {
            if let Err(e) = fs::remove_dir_all(&staging) {
                warn!(path = %staging.display(), error = %e, "Failed to remove staging directory");
            }
        }
        result
    }

    fn write_ref(&self, name: &str, tag: &str, id: &str) -> Result<(), StoreError> {
        let path = self.ref_path(name, tag);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        fs::write(&tmp, id).map_err(io_err(&tmp))?;
        fs::rename(&tmp, &path).map_err(io_err(&path))
    }

    /// Resolves `name[:tag]` or an id prefix to a full image id.
    pub fn resolve(&self, reference: &str) -> Result<String, StoreError> {
        let not_found = || StoreError::NotFound { reference: reference.to_string() };
        if reference.is_empty() {
            return Err(not_found());
        }

        let (name, tag) = split_reference(reference);
        if validate_name(name).is_ok() && validate_name(tag).is_ok() {
            let path = self.ref_path(name, tag);
            if path.is_file() {
                let id = fs::read_to_string(&path).map_err(io_err(&path))?;
                let id = id.trim().to_string();
                if self.image_dir(&id).join(MANIFEST_FILE).exists() {
                    return Ok(id);
                }
                warn!(reference, %id, "Tag points at a missing image");
            }
        }

        if reference.chars().all(|c| c.is_ascii_hexdigit()) {
            let matches: Vec<String> =
                self.image_ids()?.into_iter().filter(|id| id.starts_with(reference)).collect();
            return match matches.len() {
                0 => Err(not_found()),
                1 => Ok(matches.into_iter().next().unwrap_or_default()),
                _ => Err(StoreError::Ambiguous { reference: reference.to_string(), matches }),
            };
        }

        Err(not_found())
    }

    /// Loads an image manifest by id.
    pub fn load(&self, id: &str) -> Result<ImageManifest, StoreError> {
        let path = self.image_dir(id).join(MANIFEST_FILE);
        if !path.exists() {
            return Err(StoreError::NotFound { reference: id.to_string() });
        }
        let content = fs::read_to_string(&path).map_err(io_err(&path))?;
        serde_json::from_str(&content)
            .map_err(|e| StoreError::Manifest { image: id.to_string(), source: e })
    }

    /// All tagged images, newest first.
    pub fn list(&self) -> Result<Vec<ImageSummary>, StoreError> {
        let mut images = Vec::new();
        for (name, tag, id) in self.refs()? {
            match self.load(&id) {
                Ok(manifest) => images.push(ImageSummary {
                    size_bytes: manifest.total_size(),
                    created: manifest.created,
                    id,
                    name,
                    tag,
                }),
                Err(e) => warn!(image = %id, error = %e, "Skipping unreadable image"),
            }
        }
        images.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| a.name.cmp(&b.name)));
        Ok(images)
    }

    /// Removes a tag; the image content goes once no tag refers to it.
    /// Removing by id drops every tag pointing at it.
    pub fn remove(&self, reference: &str) -> Result<String, StoreError> {
        let id = self.resolve(reference)?;
        let (name, tag) = split_reference(reference);
        let by_tag = validate_name(name).is_ok()
            && validate_name(tag).is_ok()
            && self.ref_path(name, tag).is_file();

        for (ref_name, ref_tag, ref_id) in self.refs()? {
            let matches_tag = ref_name == name && ref_tag == tag;
            if ref_id == id && (!by_tag || matches_tag) {
                let path = self.ref_path(&ref_name, &ref_tag);
                fs::remove_file(&path).map_err(io_err(&path))?;
            }
        }

        if !self.refs()?.iter().any(|(_, _, ref_id)| *ref_id == id) {
            let dir = self.image_dir(&id);
            fs::remove_dir_all(&dir).map_err(io_err(&dir))?;
            info!(%id, "Removed image");
        }
        Ok(id)
    }

    /// Reassembles an image's root filesystem from its layers.
    pub fn rootfs(&self, id: &str) -> Result<Snapshot, StoreError> {
        let manifest = self.load(id)?;
        let layers_dir = self.image_dir(id).join(LAYERS_DIR);
        let mut rootfs = Snapshot::new();

        for descriptor in &manifest.layers {
            let path = layers_dir.join(layer_file(&descriptor.digest));
            let compressed = fs::read(&path).map_err(io_err(&path))?;
            let mut data = Vec::new();
            GzDecoder::new(compressed.as_slice())
                .read_to_end(&mut data)
                .map_err(io_err(&path))?;

            if layer_digest(&data) != descriptor.digest {
                return Err(StoreError::CorruptLayer {
                    image: id.to_string(),
                    digest: descriptor.digest.clone(),
                });
            }
            rootfs.apply(&Layer::from_tar(&data).map_err(io_err(&path))?).map_err(|e| {
                StoreError::InvalidLayer {
                    image: id.to_string(),
                    digest: descriptor.digest.clone(),
                    source: e,
                }
            })?;
        }

        Ok(rootfs)
    }

    fn image_ids(&self) -> Result<Vec<String>, StoreError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(io_err(&self.root))? {
            let entry = entry.map_err(io_err(&self.root))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name != REFS_DIR && !name.starts_with('.') && entry.path().join(MANIFEST_FILE).exists() {
                ids.push(name);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Every `(name, tag, id)` triple.
    fn refs(&self) -> Result<Vec<(String, String, String)>, StoreError> {
        let refs_dir = self.root.join(REFS_DIR);
        if !refs_dir.exists() {
            return Ok(Vec::new());
        }

        let mut refs = Vec::new();
        let mut pending = vec![refs_dir.clone()];
        while let Some(dir) = pending.pop() {
            for entry in fs::read_dir(&dir).map_err(io_err(&dir))? {
                let entry = entry.map_err(io_err(&dir))?;
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                    continue;
                }
                let file_name = entry.file_name().to_string_lossy().to_string();
                if file_name.contains(".tmp-") {
                    continue;
                }
                let Some(name) = path
                    .parent()
                    .and_then(|p| p.strip_prefix(&refs_dir).ok())
                    .map(|p| p.to_string_lossy().to_string())
                else {
                    continue;
                };
                let id = fs::read_to_string(&path).map_err(io_err(&path))?;
                refs.push((name, file_name, id.trim().to_string()));
            }
        }
        refs.sort();
        Ok(refs)
    }
}

/// `name[:tag]`; the tag is after the last `:` that follows the last `/`.
fn split_reference(reference: &str) -> (&str, &str) {
    let slash = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
    match reference[slash..].rfind(':') {
        Some(i) => (&reference[..slash + i], &reference[slash + i + 1..]),
        None => (reference, "latest"),
    }
}

fn validate_name(value: &str) -> Result<(), StoreError> {
    let valid = !value.is_empty()
        && value.split('/').all(|part| {
            !part.is_empty()
                && part != "."
                && part != ".."
                && part.chars().all(|c| c.is_ascii_alphanumeric() || "._-".contains(c))
        });
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidReference { reference: value.to_string() })
    }
}

fn layer_file(digest: &str) -> String {
    format!("{}.tar.gz", digest.trim_start_matches("sha256:"))
}

fn io_err(path: &Path) -> impl Fn(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io { path: path.to_path_buf(), source }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::image::{ImageConfig, LayerDescriptor};
    use crate::builder::snapshot::Entry;
    use tempfile::TempDir;

    fn layer(path: &str, content: &[u8]) -> BuiltLayer {
        let mut snap = Snapshot::new();
        snap.insert_file(path, content.to_vec(), 0o644).unwrap();
        let data = Snapshot::new().diff(&snap).to_tar().unwrap();
        BuiltLayer {
            descriptor: LayerDescriptor { digest: layer_digest(&data), size: data.len() as u64 },
            data,
        }
    }

    fn image(name: &str, tag: &str, layers: &[BuiltLayer]) -> ImageManifest {
        let config = ImageConfig { working_dir: "/app".into(), ..ImageConfig::default() };
        let mut manifest = ImageManifest::new(name, tag, config);
        manifest.layers = layers.iter().map(|l| l.descriptor.clone()).collect();
        manifest
    }

    #[test]
    fn test_publish_and_resolve() {
        let temp = TempDir::new().unwrap();
        let store = ImageStore::new(temp.path());
        let layers = vec![layer("/app/app.py", b"print()")];

        let id = store.publish(&image("web", "v1", &layers), &layers).unwrap();
        assert_eq!(store.resolve("web:v1").unwrap(), id);
        assert_eq!(store.resolve(&id[..8]).unwrap(), id);
        assert!(matches!(store.resolve("web"), Err(StoreError::NotFound { .. })));

        let loaded = store.load(&id).unwrap();
        assert_eq!(loaded.reference(), "web:v1");
        assert_eq!(loaded.image_id(), id);

        let rootfs = store.rootfs(&id).unwrap();
        assert_eq!(rootfs.read_file("/app/app.py"), Some(&b"print()"[..]));
    }

    #[test]
    fn test_republish_moves_tag_only() {
        let temp = TempDir::new().unwrap();
        let store = ImageStore::new(temp.path());
        let layers = vec![layer("/a", b"a")];

        let first = store.publish(&image("web", "latest", &layers), &layers).unwrap();
        let second = store.publish(&image("web", "stable", &layers), &layers).unwrap();
        assert_eq!(first, second);

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|i| i.id == first));
    }

    #[test]
    fn test_remove_keeps_content_until_untagged() {
        let temp = TempDir::new().unwrap();
        let store = ImageStore::new(temp.path());
        let layers = vec![layer("/a", b"a")];
        let id = store.publish(&image("web", "latest", &layers), &layers).unwrap();
        store.publish(&image("web", "v2", &layers), &layers).unwrap();

        store.remove("web:latest").unwrap();
        assert!(store.load(&id).is_ok());
        assert_eq!(store.resolve("web:v2").unwrap(), id);

        store.remove("web:v2").unwrap();
        assert!(matches!(store.load(&id), Err(StoreError::NotFound { .. })));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_layer_detected() {
        let temp = TempDir::new().unwrap();
        let store = ImageStore::new(temp.path());
        let layers = vec![layer("/a", b"a")];
        let id = store.publish(&image("web", "latest", &layers), &layers).unwrap();

        let path = temp.path().join(&id).join(LAYERS_DIR).join(layer_file(&layers[0].descriptor.digest));
        let other = layer("/b", b"b");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&other.data).unwrap();
        fs::write(&path, encoder.finish().unwrap()).unwrap();

        assert!(matches!(store.rootfs(&id), Err(StoreError::CorruptLayer { .. })));
    }

    #[test]
    fn test_layer_under_file_rejected() {
        let temp = TempDir::new().unwrap();
        let store = ImageStore::new(temp.path());

        let mut nested = Layer::default();
        nested.upserts.insert("/a/b".into(), Entry::File { mode: 0o644, data: b"b".to_vec() });
        let data = nested.to_tar().unwrap();
        let layers = vec![
            layer("/a", b"a"),
            BuiltLayer {
                descriptor: LayerDescriptor { digest: layer_digest(&data), size: data.len() as u64 },
                data,
            },
        ];
        let id = store.publish(&image("web", "latest", &layers), &layers).unwrap();

        match store.rootfs(&id) {
            Err(StoreError::InvalidLayer { digest, source, .. }) => {
                assert_eq!(digest, layers[1].descriptor.digest);
                assert_eq!(source, SnapshotError::NotADirectory { path: "/a".into() });
            }
            other => panic!("Expected InvalidLayer, got {:?}", other),
        }
    }

    #[test]
    fn test_split_reference() {
        assert_eq!(split_reference("web"), ("web", "latest"));
        assert_eq!(split_reference("web:v1"), ("web", "v1"));
        assert_eq!(split_reference("localhost:5000/web"), ("localhost:5000/web", "latest"));
        assert!(validate_name("../etc").is_err());
        assert!(validate_name("team/web").is_ok());
    }
}
