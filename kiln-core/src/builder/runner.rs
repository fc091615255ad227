//! Command execution inside the image filesystem.
//!
//! `RUN`-style stages hand their command to a [`CommandRunner`], which runs
//! it against the current snapshot and leaves the resulting filesystem in
//! place. [`ChrootRunner`] does this for real: it writes the snapshot to a
//! scratch directory, runs the command under `chroot`, and reads the tree
//! back. It needs root privileges.
//!
//! Commands get the host's `/etc/resolv.conf` and a `/dev/null` node so
//! package managers can reach the network. Neither ends up in the captured
//! tree. `/proc` is not mounted.

use crate::builder::parser::RunCommand;
use crate::builder::snapshot::{Snapshot, SnapshotError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// Lines of output kept when reporting a failed command.
const OUTPUT_TAIL_LINES: usize = 20;

/// Resolver config copied in from the host.
const RESOLV_CONF: &str = "/etc/resolv.conf";

const DEV_NULL: &str = "/dev/null";

/// A command to run inside the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunInvocation {
    pub command: RunCommand,
    /// Absolute working directory inside the image
    pub workdir: String,
    /// The complete process environment
    pub env: BTreeMap<String, String>,
    pub user: Option<String>,
}

impl RunInvocation {
    pub fn argv(&self) -> Vec<String> {
        self.command.argv()
    }
}

/// Exit status and captured output of a command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last lines of stderr, or of stdout when stderr is empty.
    pub fn tail(&self) -> String {
        let source = if self.stderr.trim().is_empty() { &self.stdout } else { &self.stderr };
        let lines: Vec<&str> = source.lines().collect();
        let start = lines.len().saturating_sub(OUTPUT_TAIL_LINES);
        lines[start..].join("\n")
    }
}

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to prepare root filesystem at {path:?}: {source}")]
    Rootfs {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Runs commands against an image filesystem.
///
/// On success the runner leaves `rootfs` holding the filesystem as the
/// command left it. On a non-zero exit the contents of `rootfs` are
/// unspecified; the executor discards them.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        rootfs: &mut Snapshot,
        invocation: &RunInvocation,
    ) -> Result<RunOutcome, RunnerError>;
}

/// Runs commands with `chroot(8)` in a scratch copy of the snapshot.
#[derive(Debug, Clone)]
pub struct ChrootRunner {
    program: String,
    scratch_dir: PathBuf,
    /// Host resolver config to expose to commands
    resolv_conf: Option<PathBuf>,
}

impl ChrootRunner {
    pub fn new(program: impl Into<String>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            scratch_dir: scratch_dir.into(),
            resolv_conf: Some(PathBuf::from(RESOLV_CONF)),
        }
    }

    /// Overrides the host resolver config; `None` leaves the image's own.
    pub fn with_resolv_conf(mut self, path: Option<PathBuf>) -> Self {
        self.resolv_conf = path;
        self
    }

    /// Writes the snapshot under `root` with the host files added.
    async fn prepare_root(&self, rootfs: &Snapshot, root: &Path) -> Result<(), RunnerError> {
        let resolv = match &self.resolv_conf {
            Some(path) => match tokio::fs::read(path).await {
                Ok(data) => Some(data),
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "No host resolver config");
                    None
                }
            },
            None => None,
        };

        let prepared = match with_host_files(rootfs, resolv) {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(error = %e, "Image layout blocks host files, running without them");
                rootfs.clone()
            }
        };
        prepared
            .materialize(root)
            .map_err(|e| RunnerError::Rootfs { path: root.to_path_buf(), source: e })?;

        if prepared.is_dir("/dev") {
            make_dev_null(&root.join(DEV_NULL.trim_start_matches('/'))).await;
        }
        Ok(())
    }

    fn command(&self, root: &Path, invocation: &RunInvocation) -> Command {
        let mut cmd = Command::new(&self.program);
        if let Some(user) = &invocation.user {
            cmd.arg(format!("--userspec={}", user));
        }
        // `sh` changes into the working directory, then execs the argv as-is
        cmd.arg(root)
            .arg("/bin/sh")
            .arg("-c")
            .arg("cd \"$0\" && exec \"$@\"")
            .arg(&invocation.workdir)
            .args(invocation.argv())
            .env_clear()
            .envs(&invocation.env)
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl CommandRunner for ChrootRunner {
    async fn run(
        &self,
        rootfs: &mut Snapshot,
        invocation: &RunInvocation,
    ) -> Result<RunOutcome, RunnerError> {
        let root = self.scratch_dir.join(format!("kiln-run-{}", uuid::Uuid::new_v4()));
        if let Err(e) = self.prepare_root(rootfs, &root).await {
            remove_scratch(&root).await;
            return Err(e);
        }

        debug!(root = %root.display(), argv = ?invocation.argv(), "Running command in chroot");
        let result = self.command(&root, invocation).output().await;

        let outcome = match result {
            Ok(output) => {
                let outcome = RunOutcome {
                    exit_code: output.status.code().unwrap_or(-1),
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                };
                if outcome.success() {
                    match Snapshot::capture(&root) {
                        Ok(mut captured) => {
                            strip_host_files(&mut captured, rootfs);
                            *rootfs = captured;
                        }
                        Err(e) => {
                            remove_scratch(&root).await;
                            return Err(RunnerError::Rootfs { path: root, source: e });
                        }
                    }
                }
                Ok(outcome)
            }
            Err(e) => Err(RunnerError::Spawn { program: self.program.clone(), source: e }),
        };

        remove_scratch(&root).await;
        outcome
    }
}

/// `rootfs` plus the host resolver config and a `/dev` directory.
fn with_host_files(rootfs: &Snapshot, resolv: Option<Vec<u8>>) -> Result<Snapshot, SnapshotError> {
    let mut prepared = rootfs.clone();
    if let Some(data) = resolv {
        prepared.remove_tree(RESOLV_CONF);
        prepared.insert_file(RESOLV_CONF, data, 0o644)?;
    }
    prepared.create_dir_all("/dev")?;
    Ok(prepared)
}

/// Puts the host-provided paths back the way `original` had them.
fn strip_host_files(captured: &mut Snapshot, original: &Snapshot) {
    for path in [RESOLV_CONF, DEV_NULL] {
        if let Err(e) = captured.reset_path(original, path) {
            warn!(path, error = %e, "Could not restore path after command");
        }
    }
    for dir in ["/etc", "/dev"] {
        if !original.contains(dir) && !captured.has_children(dir) {
            captured.remove_tree(dir);
        }
    }
}

async fn make_dev_null(path: &Path) {
    let status = Command::new("mknod")
        .arg("-m")
        .arg("666")
        .arg(path)
        .args(["c", "1", "3"])
        .status()
        .await;
    match status {
        Ok(status) if status.success() => {}
        Ok(status) => warn!(path = %path.display(), %status, "mknod failed, /dev/null unavailable"),
        Err(e) => warn!(path = %path.display(), error = %e, "mknod failed, /dev/null unavailable"),
    }
}

async fn remove_scratch(root: &Path) {
    if !root.exists() {
        return;
    }
    if let Err(e) = tokio::fs::remove_dir_all(root).await {
        warn!(root = %root.display(), error = %e, "Failed to remove scratch root filesystem");
    }
}
