//! Build context: the source tree a build reads from.
//!
//! The context is scanned once when opened. Paths matched by `.dockerignore`
//! are left out of every lookup, digest and copy, so an ignored file can
//! neither be copied into the image nor change a cache key.
//!
//! Patterns use gitignore syntax but are anchored at the context root as
//! Docker reads them: `foo` ignores only `./foo`, and `**/foo` is needed to
//! match at any depth.

use crate::builder::snapshot::{resolve_path, Snapshot, SnapshotError};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use ignore::WalkBuilder;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Name of the ignore file at the context root.
pub const IGNORE_FILE: &str = ".dockerignore";

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("Build context not found: {path:?}")]
    NotFound { path: PathBuf },

    #[error("{source_path} not found in build context")]
    SourceNotFound { source_path: String },

    #[error("{source_path} is outside the build context")]
    OutsideContext { source_path: String },

    #[error("Invalid pattern in {path:?} at line {line}: {message}")]
    InvalidIgnorePattern { path: PathBuf, line: usize, message: String },

    #[error("Failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// A scanned context entry. File content is read on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextEntry {
    Dir { mode: u32 },
    File { mode: u32, size: u64 },
    Symlink { target: String },
}

/// The build context directory.
#[derive(Debug)]
pub struct BuildContext {
    root: PathBuf,
    ignore: Gitignore,
    /// Relative path -> entry, for every non-ignored path below the root
    entries: BTreeMap<String, ContextEntry>,
}

impl BuildContext {
    /// Opens and scans a context directory.
    pub fn open(root: &Path) -> Result<Self, ContextError> {
        let root = root
            .canonicalize()
            .map_err(|_| ContextError::NotFound { path: root.to_path_buf() })?;
        if !root.is_dir() {
            return Err(ContextError::NotFound { path: root });
        }

        let ignore = load_ignore(&root)?;
        let mut context = Self { root, ignore, entries: BTreeMap::new() };
        context.scan()?;

        debug!(root = %context.root.display(), entries = context.entries.len(), "Scanned build context");
        Ok(context)
    }

    fn scan(&mut self) -> Result<(), ContextError> {
        let walker = WalkBuilder::new(&self.root)
            .standard_filters(false)
            .hidden(false)
            .follow_links(false)
            .build();

        for result in walker {
            let entry = result.map_err(|e| ContextError::Io {
                path: self.root.clone(),
                source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
            })?;

            let rel = match entry.path().strip_prefix(&self.root) {
                Ok(rel) if !rel.as_os_str().is_empty() => rel.to_path_buf(),
                _ => continue,
            };

            let metadata = std::fs::symlink_metadata(entry.path())
                .map_err(|e| ContextError::Io { path: entry.path().to_path_buf(), source: e })?;
            let file_type = metadata.file_type();

            if self.is_ignored(&rel, file_type.is_dir()) {
                continue;
            }

            let mode = metadata.permissions().mode() & 0o7777;
            let node = if file_type.is_symlink() {
                let target = std::fs::read_link(entry.path())
                    .map_err(|e| ContextError::Io { path: entry.path().to_path_buf(), source: e })?;
                ContextEntry::Symlink { target: target.to_string_lossy().to_string() }
            } else if file_type.is_dir() {
                ContextEntry::Dir { mode }
            } else if file_type.is_file() {
                ContextEntry::File { mode, size: metadata.len() }
            } else {
                continue;
            };

            self.entries.insert(rel.to_string_lossy().to_string(), node);
        }

        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether a relative path is excluded by `.dockerignore`.
    pub fn is_ignored(&self, rel_path: &Path, is_dir: bool) -> bool {
        self.ignore.matched_path_or_any_parents(rel_path, is_dir).is_ignore()
    }

    /// Non-ignored entries by relative path.
    pub fn entries(&self) -> impl Iterator<Item = (&String, &ContextEntry)> {
        self.entries.iter()
    }

    pub fn file_count(&self) -> usize {
        self.entries.values().filter(|e| matches!(e, ContextEntry::File { .. })).count()
    }

    /// Total bytes of non-ignored files.
    pub fn total_size(&self) -> u64 {
        self.entries
            .values()
            .map(|e| match e {
                ContextEntry::File { size, .. } => *size,
                _ => 0,
            })
            .sum()
    }

    /// Normalizes a COPY source to a context-relative path. `.` is the root,
    /// returned as the empty string.
    fn relative_source(source: &str) -> Result<String, ContextError> {
        let mut parts: Vec<&str> = Vec::new();
        for part in source.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    if parts.pop().is_none() {
                        return Err(ContextError::OutsideContext {
                            source_path: source.to_string(),
                        });
                    }
                }
                other => parts.push(other),
            }
        }
        Ok(parts.join("/"))
    }

    /// Entries selected by one COPY source: the entry itself plus everything
    /// below it. The root selects everything.
    fn select(&self, source: &str) -> Result<(String, Vec<(&String, &ContextEntry)>), ContextError> {
        let rel = Self::relative_source(source)?;
        if rel.is_empty() {
            return Ok((rel, self.entries.iter().collect()));
        }

        if !self.entries.contains_key(&rel) {
            return Err(ContextError::SourceNotFound { source_path: source.to_string() });
        }

        let prefix = format!("{}/", rel);
        let selected = self
            .entries
            .iter()
            .filter(|(path, _)| **path == rel || path.starts_with(&prefix))
            .collect();
        Ok((rel, selected))
    }

    fn read(&self, rel: &str) -> Result<Vec<u8>, ContextError> {
        let path = self.root.join(rel);
        std::fs::read(&path).map_err(|e| ContextError::Io { path, source: e })
    }

    /// Content digest of the given COPY sources: paths, modes and bytes of
    /// every selected entry.
    pub fn digest_sources(&self, sources: &[String]) -> Result<String, ContextError> {
        let mut hasher = Sha256::new();

        for source in sources {
            let (_, selected) = self.select(source)?;
            hasher.update(source.as_bytes());
            hasher.update([0u8]);

            for (path, entry) in selected {
                hasher.update(path.as_bytes());
                match entry {
                    ContextEntry::Dir { mode } => {
                        hasher.update(b"d");
                        hasher.update(mode.to_le_bytes());
                    }
                    ContextEntry::File { mode, .. } => {
                        let data = self.read(path)?;
                        hasher.update(b"f");
                        hasher.update(mode.to_le_bytes());
                        hasher.update((data.len() as u64).to_le_bytes());
                        hasher.update(&data);
                    }
                    ContextEntry::Symlink { target } => {
                        hasher.update(b"l");
                        hasher.update(target.as_bytes());
                    }
                }
            }
        }

        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Copies sources into `snapshot` with COPY semantics: a directory
    /// source copies its contents; a file lands inside `destination` when
    /// that is a directory (trailing `/`, existing directory, or several
    /// sources) and at `destination` otherwise. Returns the number of
    /// entries written.
    pub fn copy_into(
        &self,
        sources: &[String],
        workdir: &str,
        destination: &str,
        snapshot: &mut Snapshot,
    ) -> Result<usize, ContextError> {
        let dest = resolve_path(workdir, destination);
        let dest_is_dir = destination.ends_with('/')
            || destination == "."
            || sources.len() > 1
            || snapshot.is_dir(&dest);
        let mut written = 0;

        for source in sources {
            let (rel, selected) = self.select(source)?;
            let source_is_dir =
                rel.is_empty() || matches!(self.entries.get(&rel), Some(ContextEntry::Dir { .. }));

            if source_is_dir {
                snapshot.create_dir_all(&dest)?;
            }

            for (path, entry) in selected {
                let target = if source_is_dir {
                    let inner = if rel.is_empty() {
                        path.as_str()
                    } else {
                        path.get(rel.len() + 1..).unwrap_or("")
                    };
                    if inner.is_empty() {
                        continue;
                    }
                    resolve_path(&dest, inner)
                } else if dest_is_dir {
                    let name = path.rsplit('/').next().unwrap_or(path.as_str());
                    resolve_path(&dest, name)
                } else {
                    dest.clone()
                };

                match entry {
                    ContextEntry::Dir { .. } => snapshot.create_dir_all(&target)?,
                    ContextEntry::File { mode, .. } => {
                        snapshot.insert_file(&target, self.read(path)?, *mode)?
                    }
                    ContextEntry::Symlink { target: link } => {
                        snapshot.insert_symlink(&target, link)?
                    }
                }
                written += 1;
            }
        }

        Ok(written)
    }
}

fn load_ignore(root: &Path) -> Result<Gitignore, ContextError> {
    let ignore_path = root.join(IGNORE_FILE);
    let mut builder = GitignoreBuilder::new(root);

    if ignore_path.exists() {
        let content = std::fs::read_to_string(&ignore_path)
            .map_err(|e| ContextError::Io { path: ignore_path.clone(), source: e })?;

        for (line_num, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            builder.add_line(Some(ignore_path.clone()), &anchor_pattern(trimmed)).map_err(|e| {
                ContextError::InvalidIgnorePattern {
                    path: ignore_path.clone(),
                    line: line_num + 1,
                    message: e.to_string(),
                }
            })?;
        }
    }

    builder.build().map_err(|e| ContextError::InvalidIgnorePattern {
        path: ignore_path,
        line: 0,
        message: e.to_string(),
    })
}

/// Roots a `.dockerignore` pattern at the context directory.
fn anchor_pattern(pattern: &str) -> String {
    let (negation, body) = match pattern.strip_prefix('!') {
        Some(rest) => ("!", rest.trim_start()),
        None => ("", pattern),
    };
    let body = body.trim_start_matches("./").trim_start_matches('/');
    format!("{}/{}", negation, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn context_dir() -> TempDir {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        std::fs::write(root.join("app.py"), "print('hi')").unwrap();
        std::fs::write(root.join("requirements.txt"), "flask\n").unwrap();
        std::fs::create_dir_all(root.join("static/css")).unwrap();
        std::fs::write(root.join("static/css/site.css"), "body {}").unwrap();
        std::fs::create_dir_all(root.join("__pycache__")).unwrap();
        std::fs::write(root.join("__pycache__/app.cpython-312.pyc"), "bytes").unwrap();
        std::fs::write(root.join("bot.log"), "log line").unwrap();
        std::fs::write(root.join(IGNORE_FILE), "# build noise\n__pycache__/\n*.log\n").unwrap();
        temp
    }

    #[test]
    fn test_ignored_paths_are_skipped() {
        let temp = context_dir();
        let context = BuildContext::open(temp.path()).unwrap();

        let paths: Vec<&String> = context.entries().map(|(p, _)| p).collect();
        assert!(paths.iter().any(|p| *p == "app.py"));
        assert!(paths.iter().any(|p| *p == "static/css/site.css"));
        assert!(!paths.iter().any(|p| p.starts_with("__pycache__")));
        assert!(!paths.iter().any(|p| *p == "bot.log"));
        assert_eq!(context.file_count(), 4);
    }

    #[test]
    fn test_ignore_patterns_are_rooted() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        for file in ["foo", "src/foo", "src/debug.log", "debug.log", "keep.log", "tmp/a.tmp", "src/b.tmp"] {
            let path = root.join(file);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, "x").unwrap();
        }
        std::fs::write(root.join(IGNORE_FILE), "foo\n*.log\n!keep.log\n**/*.tmp\n./tmp\n").unwrap();

        let context = BuildContext::open(root).unwrap();
        let paths: Vec<&str> = context.entries().map(|(p, _)| p.as_str()).collect();

        assert!(!paths.contains(&"foo"));
        assert!(paths.contains(&"src/foo"));
        assert!(!paths.contains(&"debug.log"));
        assert!(paths.contains(&"src/debug.log"));
        assert!(paths.contains(&"keep.log"));
        assert!(!paths.contains(&"src/b.tmp"));
        assert!(!paths.iter().any(|p| p.starts_with("tmp")));

        assert_eq!(anchor_pattern("!/keep.log"), "!/keep.log");
        assert_eq!(anchor_pattern("**/*.tmp"), "/**/*.tmp");
    }

    #[test]
    fn test_missing_context() {
        let temp = TempDir::new().unwrap();
        let err = BuildContext::open(&temp.path().join("missing")).unwrap_err();
        assert!(matches!(err, ContextError::NotFound { .. }));
    }

    #[test]
    fn test_digest_follows_content() {
        let temp = context_dir();
        let manifest = vec!["requirements.txt".to_string()];
        let everything = vec![".".to_string()];

        let before = BuildContext::open(temp.path()).unwrap();
        let manifest_digest = before.digest_sources(&manifest).unwrap();
        let tree_digest = before.digest_sources(&everything).unwrap();

        std::fs::write(temp.path().join("app.py"), "print('changed')").unwrap();
        let after = BuildContext::open(temp.path()).unwrap();
        assert_eq!(after.digest_sources(&manifest).unwrap(), manifest_digest);
        assert_ne!(after.digest_sources(&everything).unwrap(), tree_digest);

        // Ignored files never move a digest
        std::fs::write(temp.path().join("bot.log"), "more log lines").unwrap();
        let ignored = BuildContext::open(temp.path()).unwrap();
        assert_eq!(
            ignored.digest_sources(&everything).unwrap(),
            after.digest_sources(&everything).unwrap()
        );
    }

    #[test]
    fn test_sources_outside_context_rejected() {
        let temp = context_dir();
        let context = BuildContext::open(temp.path()).unwrap();

        let err = context.digest_sources(&["../etc/passwd".to_string()]).unwrap_err();
        assert!(matches!(err, ContextError::OutsideContext { .. }));

        let err = context.digest_sources(&["missing.txt".to_string()]).unwrap_err();
        assert!(matches!(err, ContextError::SourceNotFound { .. }));

        let err = context.digest_sources(&["bot.log".to_string()]).unwrap_err();
        assert!(matches!(err, ContextError::SourceNotFound { .. }));
    }

    #[test]
    fn test_copy_semantics() {
        let temp = context_dir();
        let context = BuildContext::open(temp.path()).unwrap();
        let mut snap = Snapshot::new();
        snap.create_dir_all("/app").unwrap();

        context.copy_into(&["requirements.txt".to_string()], "/app", ".", &mut snap).unwrap();
        assert_eq!(snap.read_file("/app/requirements.txt"), Some(&b"flask\n"[..]));

        context.copy_into(&["static".to_string()], "/app", "assets", &mut snap).unwrap();
        assert!(snap.contains("/app/assets/css/site.css"));

        context.copy_into(&["app.py".to_string()], "/app", "main.py", &mut snap).unwrap();
        assert!(snap.contains("/app/main.py"));

        let copied = context.copy_into(&[".".to_string()], "/app", ".", &mut snap).unwrap();
        assert!(copied > 0);
        assert!(snap.contains("/app/app.py"));
        assert!(snap.contains("/app/static/css/site.css"));
        assert!(!snap.contains("/app/bot.log"));
    }
}
