//! In-memory image filesystem and layer diffs.
//!
//! A [`Snapshot`] is the image filesystem between two build stages. Every
//! stage maps one snapshot to the next; the difference is a [`Layer`], which
//! is what the cache and the image store persist. Layers are encoded as tar
//! archives with zeroed timestamps and owners, so the same change always
//! produces the same bytes and the same digest.

use ignore::WalkBuilder;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Read};
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Whiteout prefix marking a deleted path inside a layer archive.
pub const WHITEOUT_PREFIX: &str = ".wh.";

const DEFAULT_DIR_MODE: u32 = 0o755;

/// A filesystem entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Dir { mode: u32 },
    File { mode: u32, data: Vec<u8> },
    Symlink { target: String },
}

impl Entry {
    pub fn is_dir(&self) -> bool {
        matches!(self, Entry::Dir { .. })
    }

    fn size(&self) -> u64 {
        match self {
            Entry::File { data, .. } => data.len() as u64,
            _ => 0,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SnapshotError {
    #[error("Not a directory: {path}")]
    NotADirectory { path: String },

    #[error("Is a directory: {path}")]
    IsADirectory { path: String },
}

/// Normalizes an absolute path: collapses `.`, `..` and repeated slashes.
/// `..` never climbs above `/`.
pub fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Resolves `path` against `base` the way `WORKDIR` and `COPY` do.
pub fn resolve_path(base: &str, path: &str) -> String {
    if path.starts_with('/') {
        normalize_path(path)
    } else {
        normalize_path(&format!("{}/{}", base, path))
    }
}

/// Parent of a normalized path, `None` for `/`.
pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

fn is_descendant(path: &str, ancestor: &str) -> bool {
    if ancestor == "/" {
        return path != "/";
    }
    path.len() > ancestor.len() && path.starts_with(ancestor) && path.as_bytes()[ancestor.len()] == b'/'
}

/// Image filesystem keyed by normalized absolute path. The root directory is
/// implicit.
///
/// Entries are shared between clones: cloning a snapshot copies the path
/// index, never file contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    entries: BTreeMap<String, Arc<Entry>>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<&Entry> {
        self.entries.get(&normalize_path(path)).map(Arc::as_ref)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    pub fn is_dir(&self, path: &str) -> bool {
        let path = normalize_path(path);
        path == "/" || self.entries.get(&path).map(|e| e.is_dir()).unwrap_or(false)
    }

    /// Contents of a regular file.
    pub fn read_file(&self, path: &str) -> Option<&[u8]> {
        match self.get(path) {
            Some(Entry::File { data, .. }) => Some(data.as_slice()),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Entry)> {
        self.entries.iter().map(|(path, entry)| (path, &**entry))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total bytes of regular file content.
    pub fn total_size(&self) -> u64 {
        self.entries.values().map(|e| e.size()).sum()
    }

    /// Creates `path` and any missing ancestors.
    pub fn create_dir_all(&mut self, path: &str) -> Result<(), SnapshotError> {
        let path = normalize_path(path);
        if path == "/" {
            return Ok(());
        }

        let mut current = String::new();
        for part in path.trim_start_matches('/').split('/') {
            current.push('/');
            current.push_str(part);
            match self.entries.get(&current).map(Arc::as_ref) {
                Some(Entry::Dir { .. }) => {}
                Some(_) => return Err(SnapshotError::NotADirectory { path: current }),
                None => {
                    self.entries
                        .insert(current.clone(), Arc::new(Entry::Dir { mode: DEFAULT_DIR_MODE }));
                }
            }
        }
        Ok(())
    }

    /// Writes a regular file, creating parent directories.
    pub fn insert_file(&mut self, path: &str, data: Vec<u8>, mode: u32) -> Result<(), SnapshotError> {
        let path = normalize_path(path);
        if self.is_dir(&path) {
            return Err(SnapshotError::IsADirectory { path });
        }
        if let Some(parent) = parent_path(&path) {
            self.create_dir_all(parent)?;
        }
        self.entries.insert(path, Arc::new(Entry::File { mode, data }));
        Ok(())
    }

    pub fn insert_symlink(&mut self, path: &str, target: &str) -> Result<(), SnapshotError> {
        let path = normalize_path(path);
        if self.is_dir(&path) {
            return Err(SnapshotError::IsADirectory { path });
        }
        if let Some(parent) = parent_path(&path) {
            self.create_dir_all(parent)?;
        }
        self.entries.insert(path, Arc::new(Entry::Symlink { target: target.to_string() }));
        Ok(())
    }

    /// Removes `path` and everything beneath it. Returns the number of
    /// entries removed.
    pub fn remove_tree(&mut self, path: &str) -> usize {
        let path = normalize_path(path);
        let removed = self.remove_children(&path);
        removed + usize::from(self.entries.remove(&path).is_some())
    }

    /// Removes everything beneath `path`, keeping `path` itself.
    pub fn remove_children(&mut self, path: &str) -> usize {
        let path = normalize_path(path);
        let doomed: Vec<String> =
            self.entries.keys().filter(|p| is_descendant(p, &path)).cloned().collect();
        for p in &doomed {
            self.entries.remove(p);
        }
        doomed.len()
    }

    /// Makes `path` match `other`: its entry is copied back if `other` has
    /// one, and removed with its subtree otherwise.
    pub fn reset_path(&mut self, other: &Snapshot, path: &str) -> Result<(), SnapshotError> {
        let path = normalize_path(path);
        match other.entries.get(&path) {
            Some(entry) => {
                if !(entry.is_dir() && self.is_dir(&path)) {
                    self.remove_tree(&path);
                }
                if let Some(parent) = parent_path(&path) {
                    self.create_dir_all(parent)?;
                }
                self.entries.insert(path, Arc::clone(entry));
            }
            None => {
                self.remove_tree(&path);
            }
        }
        Ok(())
    }

    pub fn has_children(&self, path: &str) -> bool {
        let path = normalize_path(path);
        self.entries.keys().any(|p| is_descendant(p, &path))
    }

    /// Paths strictly beneath `path`.
    pub fn descendants<'a>(&'a self, path: &str) -> impl Iterator<Item = &'a String> + 'a {
        let path = normalize_path(path);
        self.entries.keys().filter(move |p| is_descendant(p, &path))
    }

    /// The layer that turns `self` into `newer`.
    pub fn diff(&self, newer: &Snapshot) -> Layer {
        let upserts: BTreeMap<String, Entry> = newer
            .entries
            .iter()
            .filter(|(path, entry)| match self.entries.get(*path) {
                Some(old) => !Arc::ptr_eq(old, entry) && old != *entry,
                None => true,
            })
            .map(|(path, entry)| (path.clone(), (**entry).clone()))
            .collect();

        let removed: BTreeSet<&String> =
            self.entries.keys().filter(|p| !newer.entries.contains_key(*p)).collect();

        // A deleted directory already covers its deleted children
        let deletions = removed
            .iter()
            .filter(|p| {
                let mut parent = parent_path(p);
                while let Some(dir) = parent {
                    if removed.contains(&dir.to_string()) {
                        return false;
                    }
                    parent = parent_path(dir);
                }
                true
            })
            .map(|p| (*p).clone())
            .collect();

        Layer { upserts, deletions }
    }

    /// Applies a layer: deletions first, then upserts in path order.
    ///
    /// Fails if an upsert lands beneath a path that is not a directory,
    /// leaving the snapshot partially updated.
    pub fn apply(&mut self, layer: &Layer) -> Result<(), SnapshotError> {
        for path in &layer.deletions {
            self.remove_tree(path);
        }

        for (path, entry) in &layer.upserts {
            let path = normalize_path(path);
            let replaces_dir = self.entries.get(&path).map(|e| e.is_dir()).unwrap_or(false);
            if replaces_dir && !entry.is_dir() {
                self.remove_tree(&path);
            }
            if let Some(parent) = parent_path(&path) {
                self.create_dir_all(parent)?;
            }
            self.entries.insert(path, Arc::new(entry.clone()));
        }

        Ok(())
    }

    /// Content digest over paths, kinds, modes and data.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for (path, entry) in &self.entries {
            hasher.update(path.as_bytes());
            match &**entry {
                Entry::Dir { mode } => {
                    hasher.update(b"d");
                    hasher.update(mode.to_le_bytes());
                }
                Entry::File { mode, data } => {
                    hasher.update(b"f");
                    hasher.update(mode.to_le_bytes());
                    hasher.update((data.len() as u64).to_le_bytes());
                    hasher.update(data);
                }
                Entry::Symlink { target } => {
                    hasher.update(b"l");
                    hasher.update(target.as_bytes());
                }
            }
        }
        format!("{:x}", hasher.finalize())
    }

    /// Writes the snapshot out as a real directory tree under `dir`.
    pub fn materialize(&self, dir: &Path) -> io::Result<()> {
        std::fs::create_dir_all(dir)?;

        for (path, entry) in &self.entries {
            let target = dir.join(path.trim_start_matches('/'));
            match &**entry {
                Entry::Dir { .. } => std::fs::create_dir_all(&target)?,
                Entry::File { mode, data } => {
                    std::fs::write(&target, data)?;
                    std::fs::set_permissions(&target, std::fs::Permissions::from_mode(*mode))?;
                }
                Entry::Symlink { target: link } => symlink(link, &target)?,
            }
        }

        // Directory modes last, deepest first, so read-only dirs can still be filled
        for (path, entry) in self.entries.iter().rev() {
            if let Entry::Dir { mode } = &**entry {
                let target = dir.join(path.trim_start_matches('/'));
                std::fs::set_permissions(&target, std::fs::Permissions::from_mode(*mode))?;
            }
        }

        Ok(())
    }

    /// Reads a directory tree back into a snapshot. Symlinks are not followed.
    pub fn capture(dir: &Path) -> io::Result<Snapshot> {
        let mut snapshot = Snapshot::new();

        let walker = WalkBuilder::new(dir)
            .standard_filters(false)
            .hidden(false)
            .follow_links(false)
            .build();

        for result in walker {
            let entry = result.map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
            let relative = match entry.path().strip_prefix(dir) {
                Ok(rel) if !rel.as_os_str().is_empty() => rel,
                _ => continue,
            };
            let path = normalize_path(&relative.to_string_lossy());

            let metadata = std::fs::symlink_metadata(entry.path())?;
            let mode = metadata.permissions().mode() & 0o7777;
            let file_type = metadata.file_type();

            let node = if file_type.is_symlink() {
                let link = std::fs::read_link(entry.path())?;
                Entry::Symlink { target: link.to_string_lossy().to_string() }
            } else if file_type.is_dir() {
                Entry::Dir { mode }
            } else if file_type.is_file() {
                Entry::File { mode, data: std::fs::read(entry.path())? }
            } else {
                // Sockets, fifos and device nodes are not part of an image
                continue;
            };

            snapshot.entries.insert(path, Arc::new(node));
        }

        Ok(snapshot)
    }
}

/// Difference between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Layer {
    /// Entries added or changed, by path
    pub upserts: BTreeMap<String, Entry>,
    /// Paths removed, with their subtrees
    pub deletions: BTreeSet<String>,
}

impl Layer {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletions.is_empty()
    }

    /// Bytes of file content carried by the layer.
    pub fn content_size(&self) -> u64 {
        self.upserts.values().map(Entry::size).sum()
    }

    /// Encodes the layer as a tar archive.
    ///
    /// Deletions become empty `.wh.<name>` files next to the deleted path.
    /// Timestamps, uid and gid are zeroed.
    pub fn to_tar(&self) -> io::Result<Vec<u8>> {
        let mut builder = tar::Builder::new(Vec::new());

        for path in &self.deletions {
            let parent = parent_path(path).unwrap_or("/");
            let name = path.rsplit('/').next().unwrap_or_default();
            let whiteout = resolve_path(parent, &format!("{}{}", WHITEOUT_PREFIX, name));

            let mut header = blank_header(tar::EntryType::Regular, 0o644, 0);
            builder.append_data(&mut header, whiteout.trim_start_matches('/'), io::empty())?;
        }

        for (path, entry) in &self.upserts {
            let rel = path.trim_start_matches('/');
            match entry {
                Entry::Dir { mode } => {
                    let mut header = blank_header(tar::EntryType::Directory, *mode, 0);
                    builder.append_data(&mut header, format!("{}/", rel), io::empty())?;
                }
                Entry::File { mode, data } => {
                    let mut header =
                        blank_header(tar::EntryType::Regular, *mode, data.len() as u64);
                    builder.append_data(&mut header, rel, data.as_slice())?;
                }
                Entry::Symlink { target } => {
                    let mut header = blank_header(tar::EntryType::Symlink, 0o777, 0);
                    builder.append_link(&mut header, rel, target)?;
                }
            }
        }

        builder.into_inner()
    }

    /// Decodes a layer archive. Hard links are resolved to copies of their
    /// target; device nodes and fifos are skipped.
    pub fn from_tar(bytes: &[u8]) -> io::Result<Layer> {
        let mut layer = Layer::default();
        let mut archive = tar::Archive::new(bytes);

        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = normalize_path(&entry.path()?.to_string_lossy());
            let name = path.rsplit('/').next().unwrap_or_default().to_string();

            if let Some(deleted) = name.strip_prefix(WHITEOUT_PREFIX) {
                let parent = parent_path(&path).unwrap_or("/");
                layer.deletions.insert(resolve_path(parent, deleted));
                continue;
            }

            let mode = entry.header().mode()? & 0o7777;
            let node = match entry.header().entry_type() {
                tar::EntryType::Directory => Entry::Dir { mode },
                tar::EntryType::Regular | tar::EntryType::Continuous => {
                    let mut data = Vec::with_capacity(entry.size() as usize);
                    entry.read_to_end(&mut data)?;
                    Entry::File { mode, data }
                }
                tar::EntryType::Symlink => {
                    let target = entry
                        .link_name()?
                        .map(|t| t.to_string_lossy().to_string())
                        .unwrap_or_default();
                    Entry::Symlink { target }
                }
                tar::EntryType::Link => {
                    let target = entry
                        .link_name()?
                        .map(|t| normalize_path(&t.to_string_lossy()))
                        .unwrap_or_default();
                    match layer.upserts.get(&target) {
                        Some(linked) => linked.clone(),
                        None => continue,
                    }
                }
                _ => continue,
            };

            layer.upserts.insert(path, node);
        }

        Ok(layer)
    }
}

fn blank_header(entry_type: tar::EntryType, mode: u32, size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mode(mode);
    header.set_size(size);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header
}

/// SHA-256 of a layer archive, as `sha256:<hex>`.
pub fn layer_digest(tar_bytes: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(tar_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> Snapshot {
        let mut snap = Snapshot::new();
        snap.insert_file("/usr/bin/python", b"#!python".to_vec(), 0o755).unwrap();
        snap.insert_file("/var/lib/apt/lists/index", b"pkgs".to_vec(), 0o644).unwrap();
        snap.insert_symlink("/usr/bin/python3", "python").unwrap();
        snap
    }

    #[test]
    fn test_path_helpers() {
        assert_eq!(normalize_path("/app/./src//main.py"), "/app/src/main.py");
        assert_eq!(normalize_path("/../etc"), "/etc");
        assert_eq!(resolve_path("/app", "requirements.txt"), "/app/requirements.txt");
        assert_eq!(resolve_path("/app", "."), "/app");
        assert_eq!(resolve_path("/app", "/opt"), "/opt");
        assert_eq!(parent_path("/app/x"), Some("/app"));
        assert_eq!(parent_path("/app"), Some("/"));
        assert_eq!(parent_path("/"), None);
    }

    #[test]
    fn test_insert_creates_parents() {
        let snap = sample();
        assert!(snap.is_dir("/usr"));
        assert!(snap.is_dir("/usr/bin"));
        assert_eq!(snap.read_file("/usr/bin/python"), Some(&b"#!python"[..]));
        assert!(snap.has_children("/var/lib/apt/lists"));
    }

    #[test]
    fn test_file_blocks_directory() {
        let mut snap = sample();
        let err = snap.create_dir_all("/usr/bin/python/lib").unwrap_err();
        assert_eq!(err, SnapshotError::NotADirectory { path: "/usr/bin/python".into() });

        let err = snap.insert_file("/usr/bin", vec![], 0o644).unwrap_err();
        assert!(matches!(err, SnapshotError::IsADirectory { .. }));
    }

    #[test]
    fn test_remove_children_keeps_dir() {
        let mut snap = sample();
        assert_eq!(snap.remove_children("/var/lib/apt/lists"), 1);
        assert!(snap.is_dir("/var/lib/apt/lists"));
        assert!(!snap.has_children("/var/lib/apt/lists"));
    }

    #[test]
    fn test_diff_and_apply() {
        let base = sample();
        let mut next = base.clone();
        next.insert_file("/app/app.py", b"print()".to_vec(), 0o644).unwrap();
        next.remove_tree("/var/lib/apt");

        let layer = base.diff(&next);
        assert!(layer.upserts.contains_key("/app"));
        assert!(layer.upserts.contains_key("/app/app.py"));
        assert!(!layer.upserts.contains_key("/usr/bin/python"));
        // Only the top of the removed subtree is recorded
        assert_eq!(layer.deletions.iter().collect::<Vec<_>>(), vec!["/var/lib/apt"]);

        let mut rebuilt = base.clone();
        rebuilt.apply(&layer).unwrap();
        assert_eq!(rebuilt, next);
    }

    #[test]
    fn test_apply_rejects_child_of_file() {
        let mut layer = Layer::default();
        layer.upserts.insert("/a".into(), Entry::File { mode: 0o644, data: b"x".to_vec() });
        layer.upserts.insert("/a/b".into(), Entry::File { mode: 0o644, data: b"y".to_vec() });

        let mut snap = Snapshot::new();
        let err = snap.apply(&layer).unwrap_err();
        assert_eq!(err, SnapshotError::NotADirectory { path: "/a".into() });
        assert!(!snap.contains("/a/b"));

        // Same through a symlink already in the snapshot
        let mut snap = sample();
        let mut layer = Layer::default();
        layer.upserts.insert("/usr/bin/python3/lib".into(), Entry::Dir { mode: 0o755 });
        assert!(matches!(snap.apply(&layer), Err(SnapshotError::NotADirectory { .. })));
    }

    #[test]
    fn test_reset_path() {
        let original = sample();
        let mut changed = original.clone();
        changed.insert_file("/usr/bin/python", b"other".to_vec(), 0o755).unwrap();
        changed.insert_file("/etc/hosts", b"127.0.0.1".to_vec(), 0o644).unwrap();

        changed.reset_path(&original, "/usr/bin/python").unwrap();
        changed.reset_path(&original, "/etc/hosts").unwrap();
        assert_eq!(changed.read_file("/usr/bin/python"), Some(&b"#!python"[..]));
        assert!(!changed.contains("/etc/hosts"));
        assert!(changed.is_dir("/etc"));
    }

    #[test]
    fn test_clone_shares_file_contents() {
        let base = sample();
        let mut next = base.clone();
        assert!(Arc::ptr_eq(&base.entries["/usr/bin/python"], &next.entries["/usr/bin/python"]));

        next.insert_file("/usr/bin/python", b"patched".to_vec(), 0o755).unwrap();
        assert_eq!(base.read_file("/usr/bin/python"), Some(&b"#!python"[..]));

        let layer = base.diff(&next);
        assert_eq!(layer.upserts.keys().collect::<Vec<_>>(), vec!["/usr/bin/python"]);
        assert!(layer.deletions.is_empty());
    }

    #[test]
    fn test_tar_encoding_is_deterministic() {
        let base = sample();
        let mut next = base.clone();
        next.insert_file("/app/app.py", b"print()".to_vec(), 0o644).unwrap();
        next.remove_tree("/var/lib/apt/lists/index");

        let layer = base.diff(&next);
        let first = layer.to_tar().unwrap();
        let second = layer.clone().to_tar().unwrap();
        assert_eq!(first, second);
        assert_eq!(layer_digest(&first), layer_digest(&second));

        let decoded = Layer::from_tar(&first).unwrap();
        assert_eq!(decoded, layer);
    }

    #[test]
    fn test_materialize_and_capture() {
        let temp = TempDir::new().unwrap();
        let snap = sample();

        snap.materialize(temp.path()).unwrap();
        assert!(temp.path().join("usr/bin/python").is_file());

        let captured = Snapshot::capture(temp.path()).unwrap();
        assert_eq!(captured.read_file("/usr/bin/python"), Some(&b"#!python"[..]));
        assert_eq!(
            captured.get("/usr/bin/python3"),
            Some(&Entry::Symlink { target: "python".into() })
        );
        assert_eq!(
            captured.get("/usr/bin/python"),
            Some(&Entry::File { mode: 0o755, data: b"#!python".to_vec() })
        );
    }

    #[test]
    fn test_digest_tracks_content() {
        let a = sample();
        let mut b = sample();
        assert_eq!(a.digest(), b.digest());

        b.insert_file("/usr/bin/python", b"changed".to_vec(), 0o755).unwrap();
        assert_ne!(a.digest(), b.digest());
    }
}
