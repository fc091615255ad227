//! Typed build stages.
//!
//! A [`BuildPlan`] is the ordered list of stage descriptors the executor
//! runs. It comes either from the built-in `python-web` preset or from a
//! parsed Dockerfile, whose instructions are recognized as typed stages
//! where possible (manifest staging, system package install, dependency
//! install, source copy) and carried through unchanged otherwise.

use crate::builder::parser::{Dockerfile, ImageRef, Instruction, Protocol, RunCommand};
use crate::builder::snapshot::resolve_path;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Base image of the python-web preset.
pub const PYTHON_WEB_BASE: &str = "python:3.12-slim";
/// Working directory of the python-web preset.
pub const PYTHON_WEB_WORKDIR: &str = "/app";
/// Dependency manifest of the python-web preset.
pub const PYTHON_WEB_MANIFEST: &str = "requirements.txt";
/// System prerequisites of the python-web preset.
pub const PYTHON_WEB_SYSTEM_PACKAGES: &[&str] = &["build-essential"];
/// Port declared by the python-web preset.
pub const PYTHON_WEB_PORT: u16 = 5000;
/// Entrypoint of the python-web preset.
pub const PYTHON_WEB_COMMAND: &[&str] = &["python", "app.py"];

/// Package index cache discarded after installing system packages.
pub const APT_INDEX_CACHE: &str = "/var/lib/apt/lists";

/// One stage of a build plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    /// Start from a base runtime image
    SelectBase { image: ImageRef },
    /// Create the directory and make it the default for later stages
    Workdir { path: String },
    /// Place the dependency manifest ahead of the rest of the source
    StageManifest { source: String, destination: String },
    /// Refresh the package index, install packages, drop the index cache
    InstallSystemPackages { packages: Vec<String> },
    /// Install language dependencies from the staged manifest
    InstallDependencies { manifest: String, upgrade_installer: bool },
    /// Copy the build context into the image
    CopySource { sources: Vec<String>, destination: String },
    /// Record a port in the image config
    ExposePort { port: u16, protocol: Protocol },
    /// Record the process started by a container
    Entrypoint { command: RunCommand },

    // Stages carried through from a Dockerfile as written
    Run { command: RunCommand },
    Env { vars: BTreeMap<String, String> },
    Label { labels: BTreeMap<String, String> },
    Arg { name: String, value: Option<String> },
    User { user: String },
    Copy { sources: Vec<String>, destination: String },
}

/// Discriminant of [`Stage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    SelectBase,
    Workdir,
    StageManifest,
    InstallSystemPackages,
    InstallDependencies,
    CopySource,
    ExposePort,
    Entrypoint,
    Run,
    Env,
    Label,
    Arg,
    User,
    Copy,
}

impl StageKind {
    /// Canonical position of the typed stages. Carried-through stages have
    /// no rank and may appear anywhere after the base.
    pub fn rank(self) -> Option<u8> {
        match self {
            StageKind::SelectBase => Some(1),
            StageKind::Workdir => Some(2),
            StageKind::StageManifest => Some(3),
            StageKind::InstallSystemPackages => Some(4),
            StageKind::InstallDependencies => Some(5),
            StageKind::CopySource => Some(6),
            StageKind::ExposePort => Some(7),
            StageKind::Entrypoint => Some(8),
            _ => None,
        }
    }

    /// Stages that only touch image metadata.
    pub fn is_metadata(self) -> bool {
        matches!(
            self,
            StageKind::ExposePort
                | StageKind::Entrypoint
                | StageKind::Env
                | StageKind::Label
                | StageKind::Arg
                | StageKind::User
        )
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            StageKind::SelectBase => "select base",
            StageKind::Workdir => "set working directory",
            StageKind::StageManifest => "stage dependency manifest",
            StageKind::InstallSystemPackages => "install system prerequisites",
            StageKind::InstallDependencies => "install dependencies",
            StageKind::CopySource => "copy application source",
            StageKind::ExposePort => "declare port",
            StageKind::Entrypoint => "declare entrypoint",
            StageKind::Run => "run",
            StageKind::Env => "env",
            StageKind::Label => "label",
            StageKind::Arg => "arg",
            StageKind::User => "user",
            StageKind::Copy => "copy",
        };
        write!(f, "{}", name)
    }
}

impl Stage {
    pub fn kind(&self) -> StageKind {
        match self {
            Stage::SelectBase { .. } => StageKind::SelectBase,
            Stage::Workdir { .. } => StageKind::Workdir,
            Stage::StageManifest { .. } => StageKind::StageManifest,
            Stage::InstallSystemPackages { .. } => StageKind::InstallSystemPackages,
            Stage::InstallDependencies { .. } => StageKind::InstallDependencies,
            Stage::CopySource { .. } => StageKind::CopySource,
            Stage::ExposePort { .. } => StageKind::ExposePort,
            Stage::Entrypoint { .. } => StageKind::Entrypoint,
            Stage::Run { .. } => StageKind::Run,
            Stage::Env { .. } => StageKind::Env,
            Stage::Label { .. } => StageKind::Label,
            Stage::Arg { .. } => StageKind::Arg,
            Stage::User { .. } => StageKind::User,
            Stage::Copy { .. } => StageKind::Copy,
        }
    }

    /// Context paths this stage reads, if any.
    pub fn context_sources(&self) -> &[String] {
        match self {
            Stage::StageManifest { source, .. } => std::slice::from_ref(source),
            Stage::CopySource { sources, .. } | Stage::Copy { sources, .. } => sources,
            _ => &[],
        }
    }

    /// Command a stage runs inside the image, if any.
    pub fn command(&self) -> Option<RunCommand> {
        match self {
            Stage::InstallSystemPackages { packages } => {
                Some(RunCommand::Shell(system_install_command(packages)))
            }
            Stage::InstallDependencies { manifest, upgrade_installer } => {
                Some(RunCommand::Shell(dependency_install_command(manifest, *upgrade_installer)))
            }
            Stage::Run { command } => Some(command.clone()),
            _ => None,
        }
    }

    /// Descriptor line for this stage.
    pub fn describe(&self) -> String {
        match self {
            Stage::SelectBase { image } => format!("FROM {}", image),
            Stage::Workdir { path } => format!("WORKDIR {}", path),
            Stage::StageManifest { source, destination } => {
                format!("COPY {} {}", source, destination)
            }
            Stage::CopySource { sources, destination } | Stage::Copy { sources, destination } => {
                format!("COPY {} {}", sources.join(" "), destination)
            }
            Stage::InstallSystemPackages { .. }
            | Stage::InstallDependencies { .. }
            | Stage::Run { .. } => {
                format!("RUN {}", self.command().map(|c| c.to_string()).unwrap_or_default())
            }
            Stage::ExposePort { port, protocol: Protocol::Tcp } => format!("EXPOSE {}", port),
            Stage::ExposePort { port, protocol } => format!("EXPOSE {}/{}", port, protocol),
            Stage::Entrypoint { command } => format!("CMD {}", command),
            Stage::Env { vars } => format!("ENV {}", render_pairs(vars)),
            Stage::Label { labels } => format!("LABEL {}", render_pairs(labels)),
            Stage::Arg { name, value: Some(value) } => format!("ARG {}={}", name, value),
            Stage::Arg { name, value: None } => format!("ARG {}", name),
            Stage::User { user } => format!("USER {}", user),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.describe())
    }
}

/// `apt-get` invocation for a system package stage.
pub fn system_install_command(packages: &[String]) -> String {
    format!(
        "apt-get update && apt-get install -y {} && rm -rf {}/*",
        packages.join(" "),
        APT_INDEX_CACHE
    )
}

/// `pip` invocation for a dependency stage.
pub fn dependency_install_command(manifest: &str, upgrade_installer: bool) -> String {
    if upgrade_installer {
        format!("pip install --upgrade pip && pip install -r {}", manifest)
    } else {
        format!("pip install -r {}", manifest)
    }
}

fn render_pairs(pairs: &BTreeMap<String, String>) -> String {
    pairs
        .iter()
        .map(|(k, v)| {
            let v = v.replace('$', "\\$");
            if v.is_empty() || v.contains(char::is_whitespace) {
                format!("{}=\"{}\"", k, v)
            } else {
                format!("{}={}", k, v)
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Errors found while lowering or validating a plan. Positions are 1-based
/// step numbers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error("Plan has no base image")]
    MissingBase,

    #[error("Base image must be the first stage, found at step {position}")]
    BaseNotFirst { position: usize },

    #[error("Step {position}: only one '{kind}' stage is allowed")]
    DuplicateStage { kind: StageKind, position: usize },

    #[error("Step {position}: working directory must be absolute, got {path}")]
    RelativeWorkdir { path: String, position: usize },

    #[error("Step {position}: dependency manifest {manifest} is not staged before installation")]
    ManifestNotStaged { manifest: String, position: usize },

    #[error("Step {position}: system prerequisites must be installed before dependencies")]
    PrerequisitesAfterDependencies { position: usize },

    #[error("Step {position}: application source must be copied after dependencies are installed")]
    SourceBeforeDependencies { position: usize },

    #[error("Step {position}: '{kind}' cannot follow '{after}'")]
    OutOfOrder { kind: StageKind, after: StageKind, position: usize },

    #[error("Unsupported descriptor: {reason}")]
    Unsupported { reason: String },
}

/// Built-in plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    PythonWeb,
}

impl Preset {
    pub const ALL: &'static [Preset] = &[Preset::PythonWeb];

    pub fn name(self) -> &'static str {
        match self {
            Preset::PythonWeb => "python-web",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.name() == name)
    }

    /// Comma-separated preset names, for error messages.
    pub fn available() -> String {
        Self::ALL.iter().map(|p| p.name()).collect::<Vec<_>>().join(", ")
    }

    pub fn plan(self) -> BuildPlan {
        match self {
            Preset::PythonWeb => BuildPlan::python_web(),
        }
    }
}

/// Ordered list of stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildPlan {
    pub stages: Vec<Stage>,
}

impl BuildPlan {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    /// The python web application plan:
    ///
    /// ```text
    /// FROM python:3.12-slim
    /// WORKDIR /app
    /// COPY requirements.txt .
    /// RUN apt-get update && apt-get install -y build-essential && rm -rf /var/lib/apt/lists/*
    /// RUN pip install --upgrade pip && pip install -r requirements.txt
    /// COPY . .
    /// EXPOSE 5000
    /// CMD ["python", "app.py"]
    /// ```
    pub fn python_web() -> Self {
        let to_strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        Self::new(vec![
            Stage::SelectBase { image: ImageRef::parse(PYTHON_WEB_BASE) },
            Stage::Workdir { path: PYTHON_WEB_WORKDIR.to_string() },
            Stage::StageManifest {
                source: PYTHON_WEB_MANIFEST.to_string(),
                destination: ".".to_string(),
            },
            Stage::InstallSystemPackages { packages: to_strings(PYTHON_WEB_SYSTEM_PACKAGES) },
            Stage::InstallDependencies {
                manifest: PYTHON_WEB_MANIFEST.to_string(),
                upgrade_installer: true,
            },
            Stage::CopySource { sources: vec![".".to_string()], destination: ".".to_string() },
            Stage::ExposePort { port: PYTHON_WEB_PORT, protocol: Protocol::Tcp },
            Stage::Entrypoint { command: RunCommand::Exec(to_strings(PYTHON_WEB_COMMAND)) },
        ])
    }

    /// Recognizes typed stages in a parsed Dockerfile.
    pub fn from_dockerfile(dockerfile: &Dockerfile) -> Result<Self, PlanError> {
        // Manifests named by dependency installs, so the COPY that stages
        // them can be recognized
        let manifest_names: HashSet<String> = dockerfile
            .instructions
            .iter()
            .filter_map(|inst| match inst {
                Instruction::Run { command: RunCommand::Shell(cmd) } => {
                    match_dependency_install(cmd).map(|(manifest, _)| file_name(&manifest))
                }
                _ => None,
            })
            .collect();

        let mut stages = Vec::new();
        let mut entrypoint: Option<RunCommand> = None;
        let mut cmd: Option<RunCommand> = None;

        for inst in &dockerfile.instructions {
            match inst {
                Instruction::From { image, .. } => {
                    stages.push(Stage::SelectBase { image: image.clone() });
                }
                Instruction::Workdir { path } => {
                    stages.push(Stage::Workdir { path: path.clone() });
                }
                Instruction::Copy { chown: Some(_), .. } => {
                    return Err(PlanError::Unsupported {
                        reason: "COPY --chown is not supported".to_string(),
                    });
                }
                Instruction::Copy { sources, destination, chown: None } => {
                    let stage = if sources.len() == 1
                        && sources[0] != "."
                        && manifest_names.contains(&file_name(&sources[0]))
                    {
                        Stage::StageManifest {
                            source: sources[0].clone(),
                            destination: destination.clone(),
                        }
                    } else if sources.iter().all(|s| s == "." || s == "./") {
                        Stage::CopySource { sources: sources.clone(), destination: destination.clone() }
                    } else {
                        Stage::Copy { sources: sources.clone(), destination: destination.clone() }
                    };
                    stages.push(stage);
                }
                Instruction::Run { command } => {
                    stages.push(lower_run(command));
                }
                Instruction::Expose { ports } => {
                    for spec in ports {
                        stages.push(Stage::ExposePort { port: spec.port, protocol: spec.protocol });
                    }
                }
                Instruction::Cmd { command } => {
                    cmd = Some(command.clone());
                }
                Instruction::Entrypoint { command } => {
                    entrypoint = Some(command.clone());
                }
                Instruction::Env { vars } => stages.push(Stage::Env { vars: vars.clone() }),
                Instruction::Label { labels } => {
                    stages.push(Stage::Label { labels: labels.clone() })
                }
                Instruction::Arg { name, value } => {
                    stages.push(Stage::Arg { name: name.clone(), value: value.clone() })
                }
                Instruction::User { user } => stages.push(Stage::User { user: user.clone() }),
            }
        }

        let command = match (entrypoint, cmd) {
            (None, None) => None,
            (Some(command), None) | (None, Some(command)) => Some(command),
            (Some(RunCommand::Exec(mut entry)), Some(RunCommand::Exec(args))) => {
                entry.extend(args);
                Some(RunCommand::Exec(entry))
            }
            (Some(_), Some(_)) => {
                return Err(PlanError::Unsupported {
                    reason: "ENTRYPOINT and CMD together must both use exec form".to_string(),
                });
            }
        };

        // Launch stage goes last regardless of where CMD appeared
        if let Some(command) = command {
            stages.push(Stage::Entrypoint { command });
        }

        Ok(Self::new(stages))
    }

    /// Checks the ordering rules.
    pub fn validate(&self) -> Result<(), PlanError> {
        let base_at = self.stages.iter().position(|s| s.kind() == StageKind::SelectBase);
        match base_at {
            None => return Err(PlanError::MissingBase),
            Some(idx) if idx != 0 => return Err(PlanError::BaseNotFirst { position: idx + 1 }),
            _ => {}
        }

        let mut seen: HashSet<StageKind> = HashSet::new();
        let mut last_ranked: Option<StageKind> = None;
        let mut workdir = "/".to_string();
        let mut staged: HashSet<String> = HashSet::new();
        let mut dependencies_installed = false;

        for (idx, stage) in self.stages.iter().enumerate() {
            let position = idx + 1;
            let kind = stage.kind();

            if matches!(kind, StageKind::SelectBase | StageKind::Workdir | StageKind::Entrypoint)
                && !seen.insert(kind)
            {
                return Err(PlanError::DuplicateStage { kind, position });
            }

            match stage {
                Stage::Workdir { path } => {
                    if !path.starts_with('/') {
                        return Err(PlanError::RelativeWorkdir { path: path.clone(), position });
                    }
                    workdir = resolve_path(&workdir, path);
                }
                Stage::StageManifest { source, destination } => {
                    staged.insert(copy_target(&workdir, source, destination));
                }
                Stage::InstallSystemPackages { .. } if dependencies_installed => {
                    return Err(PlanError::PrerequisitesAfterDependencies { position });
                }
                Stage::InstallDependencies { manifest, .. } => {
                    if !staged.contains(&resolve_path(&workdir, manifest)) {
                        return Err(PlanError::ManifestNotStaged {
                            manifest: manifest.clone(),
                            position,
                        });
                    }
                    dependencies_installed = true;
                }
                Stage::CopySource { .. } if !dependencies_installed && self.installs_dependencies() => {
                    return Err(PlanError::SourceBeforeDependencies { position });
                }
                _ => {}
            }

            if let Some(rank) = kind.rank() {
                if let Some(previous) = last_ranked {
                    if previous.rank().map(|r| r > rank).unwrap_or(false) {
                        return Err(PlanError::OutOfOrder { kind, after: previous, position });
                    }
                }
                last_ranked = Some(kind);
            }
        }

        Ok(())
    }

    /// Renders the plan as Dockerfile text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for stage in &self.stages {
            out.push_str(&stage.describe());
            out.push('\n');
        }
        out
    }

    pub fn base(&self) -> Option<&ImageRef> {
        self.stages.iter().find_map(|s| match s {
            Stage::SelectBase { image } => Some(image),
            _ => None,
        })
    }

    pub fn installs_system_packages(&self) -> bool {
        self.stages.iter().any(|s| s.kind() == StageKind::InstallSystemPackages)
    }

    pub fn installs_dependencies(&self) -> bool {
        self.stages.iter().any(|s| s.kind() == StageKind::InstallDependencies)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// Where a single-file COPY lands: inside the destination when it names a
/// directory (`.`, trailing `/`, or the working directory itself).
pub fn copy_target(workdir: &str, source: &str, destination: &str) -> String {
    let dest = resolve_path(workdir, destination);
    if destination.ends_with('/') || destination == "." || dest == workdir {
        resolve_path(&dest, &file_name(source))
    } else {
        dest
    }
}

fn file_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string())
}

fn lower_run(command: &RunCommand) -> Stage {
    if let RunCommand::Shell(cmd) = command {
        if let Some(packages) = match_system_install(cmd) {
            return Stage::InstallSystemPackages { packages };
        }
        if let Some((manifest, upgrade_installer)) = match_dependency_install(cmd) {
            return Stage::InstallDependencies { manifest, upgrade_installer };
        }
    }
    Stage::Run { command: command.clone() }
}

fn segments(cmd: &str) -> Vec<Vec<&str>> {
    cmd.split("&&").map(|seg| seg.split_whitespace().collect::<Vec<_>>()).collect()
}

/// `apt-get update && apt-get install -y PKG... [&& rm -rf /var/lib/apt/lists/*]`
fn match_system_install(cmd: &str) -> Option<Vec<String>> {
    let lists_glob = format!("{}/*", APT_INDEX_CACHE);
    let mut packages = Vec::new();
    let mut updated = false;

    for seg in segments(cmd) {
        match seg.as_slice() {
            ["apt-get", "update"] => updated = true,
            ["apt-get", "clean"] => {}
            ["rm", "-rf", target] if *target == lists_glob || *target == APT_INDEX_CACHE => {}
            ["apt-get", "install", args @ ..] => {
                for arg in args {
                    match *arg {
                        "-y" | "--yes" | "-q" | "-qq" => {}
                        flag if flag.starts_with('-') => return None,
                        pkg => packages.push(pkg.to_string()),
                    }
                }
            }
            _ => return None,
        }
    }

    (updated && !packages.is_empty()).then_some(packages)
}

/// `[pip install --upgrade pip &&] pip install -r MANIFEST`
fn match_dependency_install(cmd: &str) -> Option<(String, bool)> {
    let mut manifest = None;
    let mut upgrade = false;

    for seg in segments(cmd) {
        let args = match seg.as_slice() {
            ["pip" | "pip3", "install", args @ ..] => args,
            ["python" | "python3", "-m", "pip", "install", args @ ..] => args,
            _ => return None,
        };
        match args {
            ["--upgrade" | "-U", "pip"] => upgrade = true,
            ["-r" | "--requirement", file] if manifest.is_none() => {
                manifest = Some(file.to_string())
            }
            _ => return None,
        }
    }

    manifest.map(|m| (m, upgrade))
}
