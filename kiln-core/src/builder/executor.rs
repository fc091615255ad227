//! Build executor for kiln images.
//!
//! Runs the steps of a build graph one at a time against a single mutable
//! snapshot. Each filesystem step first consults the layer cache; on a miss
//! it runs on a shallow copy of the snapshot, and the difference becomes the
//! step's layer. The first failing step aborts the build.

use crate::builder::base::{BaseImage, BaseResolver, ResolveError};
use crate::builder::cache::{CacheError, CacheLookupResult, CacheManager};
use crate::builder::context::BuildContext;
use crate::builder::graph::{BuildGraph, BuildNode, GraphError};
use crate::builder::image::{ImageConfig, ImageManifest, LayerDescriptor, LayerHistory};
use crate::builder::plan::{BuildPlan, Stage, StageKind, APT_INDEX_CACHE};
use crate::builder::runner::{CommandRunner, RunInvocation, RunOutcome, RunnerError};
use crate::builder::snapshot::{layer_digest, resolve_path, Layer, Snapshot};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Error type for build execution.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Step {step} ({description}): cannot resolve base image: {source}")]
    Resolution {
        step: usize,
        description: String,
        #[source]
        source: ResolveError,
    },

    #[error("Step {step} ({description}): system prerequisite install failed: {reason}")]
    PrerequisiteInstall { step: usize, description: String, reason: String },

    #[error("Step {step} ({description}): dependency install failed: {reason}")]
    DependencyInstall { step: usize, description: String, reason: String },

    #[error("Step {step} ({description}): copy failed: {reason}")]
    Copy { step: usize, description: String, reason: String },

    #[error("Step {step} ({description}): {reason}")]
    StepFailed { step: usize, description: String, reason: String },

    #[error("Package index cache left in the image: {}", paths.join(", "))]
    CleanupViolation { paths: Vec<String> },

    #[error("Invalid build graph: {0}")]
    Graph(#[from] GraphError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BuildError {
    /// Step number of the failing stage, when one failed.
    pub fn step(&self) -> Option<usize> {
        match self {
            Self::Resolution { step, .. }
            | Self::PrerequisiteInstall { step, .. }
            | Self::DependencyInstall { step, .. }
            | Self::Copy { step, .. }
            | Self::StepFailed { step, .. } => Some(*step),
            Self::Graph(GraphError::Context { step, .. }) => Some(*step),
            _ => None,
        }
    }

    /// Error for a failed step, classified by what the step does.
    fn for_node(node: &BuildNode, reason: String) -> Self {
        let step = node.step;
        let description = node.stage.describe();
        match node.stage.kind() {
            StageKind::InstallSystemPackages => Self::PrerequisiteInstall { step, description, reason },
            StageKind::InstallDependencies => Self::DependencyInstall { step, description, reason },
            StageKind::StageManifest | StageKind::CopySource | StageKind::Copy => {
                Self::Copy { step, description, reason }
            }
            _ => Self::StepFailed { step, description, reason },
        }
    }
}

/// Progress notifications for one build.
#[derive(Debug, Clone, PartialEq)]
pub enum StepEvent {
    Started { step: usize, total: usize, description: String },
    Finished { step: usize, cached: bool, duration_secs: f64 },
}

/// Callback receiving [`StepEvent`]s.
pub type ProgressFn = Arc<dyn Fn(&StepEvent) + Send + Sync>;

/// Per-step outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub step: usize,
    pub description: String,
    pub cache_key: String,
    /// Reused from the layer cache
    pub cached: bool,
    /// Digest of the layer the step produced, if it changed the filesystem
    pub layer_digest: Option<String>,
    pub duration_secs: f64,
}

/// A non-empty layer produced by the build.
#[derive(Debug, Clone)]
pub struct BuiltLayer {
    pub descriptor: LayerDescriptor,
    /// Uncompressed tar archive
    pub data: Vec<u8>,
}

/// Build statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildStats {
    pub duration_secs: f64,
    pub total_steps: usize,
    /// Steps that ran
    pub executed_steps: usize,
    /// Filesystem steps served from the cache
    pub cached_steps: usize,
    pub layer_count: usize,
    /// Total uncompressed layer bytes
    pub total_size: u64,
}

/// Result of a successful build, before publication.
#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub config: ImageConfig,
    pub layers: Vec<BuiltLayer>,
    pub history: Vec<LayerHistory>,
    /// Final image filesystem
    pub rootfs: Snapshot,
    pub steps: Vec<StepReport>,
    pub stats: BuildStats,
}

impl BuildOutput {
    /// Image manifest for this output under `name:tag`.
    pub fn manifest(&self, name: &str, tag: &str) -> ImageManifest {
        let mut manifest = ImageManifest::new(name, tag, self.config.clone());
        manifest.layers = self.layers.iter().map(|l| l.descriptor.clone()).collect();
        manifest.history = self.history.clone();
        manifest
    }
}

/// State threaded through the steps.
struct BuildState {
    rootfs: Snapshot,
    config: ImageConfig,
    /// ARG values visible to commands
    args: BTreeMap<String, String>,
}

impl BuildState {
    fn workdir(&self) -> &str {
        if self.config.working_dir.is_empty() {
            "/"
        } else {
            &self.config.working_dir
        }
    }

    fn invocation(&self, command: crate::builder::parser::RunCommand) -> RunInvocation {
        let mut env = self.config.env.clone();
        for (key, value) in &self.args {
            env.entry(key.clone()).or_insert_with(|| value.clone());
        }
        RunInvocation {
            command,
            workdir: self.workdir().to_string(),
            env,
            user: self.config.user.clone(),
        }
    }

    /// Applies a stage's effect on the image config.
    fn apply_metadata(&mut self, stage: &Stage) {
        match stage {
            Stage::Workdir { path } => {
                self.config.working_dir = resolve_path(self.workdir(), path);
            }
            Stage::Env { vars } => {
                self.config.env.extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            Stage::Label { labels } => {
                self.config.labels.extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            Stage::Arg { name, value: Some(value) } => {
                self.args.insert(name.clone(), value.clone());
            }
            Stage::User { user } => self.config.user = Some(user.clone()),
            Stage::ExposePort { port, protocol } => {
                self.config.exposed_ports.insert(format!("{}/{}", port, protocol));
            }
            Stage::Entrypoint { command } => self.config.command = Some(command.argv()),
            _ => {}
        }
    }
}

/// Sequential, fail-fast build executor.
pub struct Executor {
    runner: Arc<dyn CommandRunner>,
    resolver: Arc<dyn BaseResolver>,
    no_cache: bool,
    progress: Option<ProgressFn>,
}

impl Executor {
    pub fn new(runner: Arc<dyn CommandRunner>, resolver: Arc<dyn BaseResolver>) -> Self {
        Self { runner, resolver, no_cache: false, progress: None }
    }

    /// Skip cache lookups. Results are still written to the cache.
    pub fn no_cache(mut self, no_cache: bool) -> Self {
        self.no_cache = no_cache;
        self
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    fn emit(&self, event: StepEvent) {
        if let Some(progress) = &self.progress {
            progress(&event);
        }
    }

    /// Resolves the plan's base, builds the graph and executes it.
    pub async fn run_plan(
        &self,
        plan: &BuildPlan,
        context: &BuildContext,
        cache: &mut CacheManager,
    ) -> Result<BuildOutput, BuildError> {
        let base_stage = plan.stages.first().cloned().ok_or_else(|| {
            GraphError::InvalidGraph { message: "Plan has no stages".to_string() }
        })?;
        let reference = match &base_stage {
            Stage::SelectBase { image } => image.clone(),
            _ => {
                return Err(GraphError::InvalidGraph {
                    message: "First stage must select a base image".to_string(),
                }
                .into())
            }
        };

        self.emit(StepEvent::Started {
            step: 1,
            total: plan.len(),
            description: base_stage.describe(),
        });
        let base = self.resolver.resolve(&reference).await.map_err(|source| {
            BuildError::Resolution { step: 1, description: base_stage.describe(), source }
        })?;

        let graph = BuildGraph::from_plan(plan, context, &base.digest).map_err(|e| match e {
            GraphError::Context { step, source } => BuildError::Copy {
                step,
                description: plan
                    .stages
                    .get(step - 1)
                    .map(|s| s.describe())
                    .unwrap_or_default(),
                reason: source.to_string(),
            },
            other => BuildError::Graph(other),
        })?;

        self.execute(&graph, base, context, cache).await
    }

    /// Executes a graph on top of a resolved base.
    #[instrument(skip_all, fields(steps = graph.nodes.len(), base = %base.reference))]
    pub async fn execute(
        &self,
        graph: &BuildGraph,
        base: BaseImage,
        context: &BuildContext,
        cache: &mut CacheManager,
    ) -> Result<BuildOutput, BuildError> {
        let start = Instant::now();
        let nodes = graph.ordered_nodes()?;
        let total = nodes.len();

        let mut state = BuildState {
            rootfs: Snapshot::new(),
            config: ImageConfig { env: base.env.clone(), ..ImageConfig::default() },
            args: BTreeMap::new(),
        };
        let mut layers = Vec::new();
        let mut history = Vec::new();
        let mut steps = Vec::new();
        let mut stats = BuildStats { total_steps: total, ..BuildStats::default() };

        for node in nodes {
            let step_start = Instant::now();
            let description = node.stage.describe();
            // Step 1 was announced while the base was resolved
            if node.step != 1 {
                self.emit(StepEvent::Started { step: node.step, total, description: description.clone() });
            }
            info!(step = node.step, total, "{}", description);

            state.apply_metadata(&node.stage);

            let (layer_data, cached) = if node.stage.kind().is_metadata() {
                stats.executed_steps += 1;
                (None, false)
            } else if let Stage::SelectBase { .. } = node.stage {
                state.rootfs = base.rootfs.clone();
                stats.executed_steps += 1;
                (Some(Snapshot::new().diff(&state.rootfs).to_tar()?), false)
            } else {
                self.filesystem_step(node, &mut state, context, cache, &mut stats).await?
            };

            let mut layer_digest_hex = None;
            match layer_data {
                Some(data) if !is_empty_archive(&data) => {
                    let descriptor =
                        LayerDescriptor { digest: layer_digest(&data), size: data.len() as u64 };
                    layer_digest_hex = Some(descriptor.digest.clone());
                    stats.total_size += descriptor.size;
                    layers.push(BuiltLayer { descriptor, data });
                    history.push(LayerHistory {
                        step: node.step,
                        created_by: description.clone(),
                        empty_layer: false,
                    });
                }
                _ => history.push(LayerHistory {
                    step: node.step,
                    created_by: description.clone(),
                    empty_layer: true,
                }),
            }

            let duration_secs = step_start.elapsed().as_secs_f64();
            self.emit(StepEvent::Finished { step: node.step, cached, duration_secs });
            steps.push(StepReport {
                step: node.step,
                description,
                cache_key: node.cache_key.clone(),
                cached,
                layer_digest: layer_digest_hex,
                duration_secs,
            });
        }

        // The index purge runs inside the install step; this checks nothing
        // put it back afterwards
        if graph.nodes.iter().any(|n| n.stage.kind() == StageKind::InstallSystemPackages) {
            let leftovers: Vec<String> = state.rootfs.descendants(APT_INDEX_CACHE).cloned().collect();
            if !leftovers.is_empty() {
                return Err(BuildError::CleanupViolation { paths: leftovers });
            }
        }

        stats.layer_count = layers.len();
        stats.duration_secs = start.elapsed().as_secs_f64();
        info!(
            layers = stats.layer_count,
            cached = stats.cached_steps,
            executed = stats.executed_steps,
            "Build steps complete in {:.2}s",
            stats.duration_secs
        );

        Ok(BuildOutput { config: state.config, layers, history, rootfs: state.rootfs, steps, stats })
    }

    /// Runs (or reuses) a step that changes the filesystem. Returns the
    /// layer archive and whether it came from the cache.
    async fn filesystem_step(
        &self,
        node: &BuildNode,
        state: &mut BuildState,
        context: &BuildContext,
        cache: &mut CacheManager,
        stats: &mut BuildStats,
    ) -> Result<(Option<Vec<u8>>, bool), BuildError> {
        if !self.no_cache {
            if let CacheLookupResult::Hit { metadata, .. } = cache.lookup(&node.cache_key)? {
                let data = cache.load_layer(&node.cache_key)?;
                if layer_digest(&data) == metadata.digest {
                    let mut next = state.rootfs.clone();
                    match next.apply(&Layer::from_tar(&data)?) {
                        Ok(()) => {
                            state.rootfs = next;
                            stats.cached_steps += 1;
                            debug!(step = node.step, cache_key = %node.cache_key, "Using cached layer");
                            return Ok((Some(data), true));
                        }
                        Err(e) => warn!(
                            cache_key = %node.cache_key,
                            error = %e,
                            "Cached layer does not apply, rebuilding"
                        ),
                    }
                } else {
                    warn!(cache_key = %node.cache_key, "Cached layer is corrupt, rebuilding");
                }
                cache.remove(&node.cache_key)?;
            }
        }

        // Shares entries with the current rootfs until the stage touches them
        let mut next = state.rootfs.clone();
        self.run_stage(node, state, &mut next, context).await?;

        let layer = state.rootfs.diff(&next);
        state.rootfs = next;
        let data = layer.to_tar()?;
        cache.insert(&node.cache_key, &data, node.stage.describe(), node.step)?;
        stats.executed_steps += 1;

        Ok((Some(data), false))
    }

    async fn run_stage(
        &self,
        node: &BuildNode,
        state: &BuildState,
        next: &mut Snapshot,
        context: &BuildContext,
    ) -> Result<(), BuildError> {
        let fail = |reason: String| BuildError::for_node(node, reason);

        match &node.stage {
            Stage::Workdir { .. } => {
                next.create_dir_all(state.workdir()).map_err(|e| fail(e.to_string()))?;
            }
            Stage::StageManifest { source, destination } => {
                context
                    .copy_into(std::slice::from_ref(source), state.workdir(), destination, next)
                    .map_err(|e| fail(e.to_string()))?;
            }
            Stage::CopySource { sources, destination } | Stage::Copy { sources, destination } => {
                let copied = context
                    .copy_into(sources, state.workdir(), destination, next)
                    .map_err(|e| fail(e.to_string()))?;
                debug!(step = node.step, entries = copied, "Copied from build context");
            }
            Stage::InstallSystemPackages { .. } => {
                self.run_command(node, state, next).await?;
                // Unconditional once the install succeeded
                let purged = next.remove_children(APT_INDEX_CACHE);
                debug!(step = node.step, purged, "Removed package index cache");
            }
            Stage::InstallDependencies { manifest, .. } => {
                let staged = resolve_path(state.workdir(), manifest);
                if next.read_file(&staged).is_none() {
                    return Err(fail(format!("manifest {} is not present in the image", staged)));
                }
                self.run_command(node, state, next).await?;
            }
            Stage::Run { .. } => {
                self.run_command(node, state, next).await?;
            }
            other => {
                return Err(fail(format!("'{}' does not change the filesystem", other.kind())));
            }
        }

        Ok(())
    }

    async fn run_command(
        &self,
        node: &BuildNode,
        state: &BuildState,
        next: &mut Snapshot,
    ) -> Result<RunOutcome, BuildError> {
        let command = node.stage.command().ok_or_else(|| {
            BuildError::for_node(node, "stage has no command".to_string())
        })?;
        let invocation = state.invocation(command);

        let outcome = self
            .runner
            .run(next, &invocation)
            .await
            .map_err(|e: RunnerError| BuildError::for_node(node, e.to_string()))?;

        if !outcome.success() {
            let tail = outcome.tail();
            let reason = if tail.is_empty() {
                format!("exit code {}", outcome.exit_code)
            } else {
                format!("exit code {}\n{}", outcome.exit_code, tail)
            };
            return Err(BuildError::for_node(node, reason));
        }

        Ok(outcome)
    }
}

/// A tar archive with no members is just its end-of-archive blocks.
fn is_empty_archive(data: &[u8]) -> bool {
    data.iter().all(|b| *b == 0)
}
