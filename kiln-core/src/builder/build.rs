//! High-level image building API.
//!
//! This is the entry point used by the CLI: it turns a descriptor or preset
//! into a validated plan, runs it against a build context, and publishes the
//! resulting image. Nothing is published unless every step succeeds.

use crate::builder::base::{BaseResolver, LocalBaseStore};
use crate::builder::cache::CacheManager;
use crate::builder::context::{BuildContext, ContextError};
use crate::builder::executor::{BuildStats, Executor, ProgressFn, StepReport};
use crate::builder::image::ImageManifest;
use crate::builder::parser::parse_dockerfile_file;
use crate::builder::plan::{BuildPlan, Preset};
use crate::builder::runner::{ChrootRunner, CommandRunner};
use crate::builder::store::ImageStore;
use crate::config::Config;
use crate::error::{KilnError, Result};
use crate::paths;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Default descriptor file name inside the build context.
pub const DEFAULT_DOCKERFILE: &str = "Dockerfile";

/// Where the build plan comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanSource {
    /// Descriptor path, relative to the context unless absolute
    Dockerfile(PathBuf),
    /// A built-in plan
    Preset(Preset),
}

/// Options for building an image.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Path to the build context directory
    pub context_path: PathBuf,

    pub source: PlanSource,

    /// Image name (e.g., "myapp")
    pub name: String,

    /// Image tag (e.g., "latest")
    pub tag: String,

    /// Build arguments (ARG values)
    pub build_args: HashMap<String, String>,

    /// Skip cache lookups
    pub no_cache: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            context_path: PathBuf::from("."),
            source: PlanSource::Dockerfile(PathBuf::from(DEFAULT_DOCKERFILE)),
            name: "image".to_string(),
            tag: "latest".to_string(),
            build_args: HashMap::new(),
            no_cache: false,
        }
    }
}

/// Result of a successful, published build.
#[derive(Debug, Clone)]
pub struct BuildResult {
    pub image_id: String,
    pub manifest: ImageManifest,
    pub steps: Vec<StepReport>,
    pub stats: BuildStats,
}

/// Loads and validates the plan named by `options`.
pub fn load_plan(options: &BuildOptions) -> Result<BuildPlan> {
    let plan = match &options.source {
        PlanSource::Preset(preset) => {
            debug!(preset = preset.name(), "Using preset plan");
            preset.plan()
        }
        PlanSource::Dockerfile(file) => {
            let path = if file.is_absolute() { file.clone() } else { options.context_path.join(file) };
            if !path.exists() {
                return Err(KilnError::InvalidDockerfile {
                    path,
                    reason: "Dockerfile not found".to_string(),
                });
            }

            debug!("Parsing Dockerfile: {:?}", path);
            let dockerfile = parse_dockerfile_file(&path, &options.build_args).map_err(|e| {
                KilnError::InvalidDockerfile { path: path.clone(), reason: e.to_string() }
            })?;
            BuildPlan::from_dockerfile(&dockerfile)?
        }
    };

    plan.validate()?;
    Ok(plan)
}

/// Builds and publishes images.
pub struct ImageBuilder {
    runner: Arc<dyn CommandRunner>,
    resolver: Arc<dyn BaseResolver>,
    cache_dir: PathBuf,
    images_dir: PathBuf,
    cache_size_limit: u64,
    progress: Option<ProgressFn>,
}

impl ImageBuilder {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        resolver: Arc<dyn BaseResolver>,
        data_dir: impl Into<PathBuf>,
        cache_size_limit: u64,
    ) -> Self {
        let data_dir = data_dir.into();
        Self {
            runner,
            resolver,
            cache_dir: paths::cache_dir_in(&data_dir),
            images_dir: paths::images_dir_in(&data_dir),
            cache_size_limit,
            progress: None,
        }
    }

    /// Builder wired to the chroot runner and the local base store.
    pub fn from_config(config: &Config) -> Self {
        let data_dir = config.data_path();
        let runner = ChrootRunner::new(&config.chroot_program, paths::scratch_dir_in(&data_dir));
        let resolver = LocalBaseStore::new(paths::bases_dir_in(&data_dir));
        Self::new(Arc::new(runner), Arc::new(resolver), data_dir, config.cache_size_limit_bytes)
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn store(&self) -> ImageStore {
        ImageStore::new(&self.images_dir)
    }

    /// Build an image.
    ///
    /// 1. Loads and validates the plan
    /// 2. Opens the build context
    /// 3. Runs the steps against the layer cache
    /// 4. Publishes the image
    #[instrument(skip(self, options), fields(name = %options.name, tag = %options.tag))]
    pub async fn build(&self, options: &BuildOptions) -> Result<BuildResult> {
        let start_time = std::time::Instant::now();
        info!("Building image {}:{} from {:?}", options.name, options.tag, options.context_path);

        // Phase 1: Plan
        let plan = load_plan(options)?;
        info!("Build plan ready: {} steps", plan.len());

        // Phase 2: Context
        let context = BuildContext::open(&options.context_path).map_err(|e| match e {
            ContextError::NotFound { path } => KilnError::ContextNotFound { path },
            other => KilnError::Context { reason: other.to_string() },
        })?;
        debug!(
            files = context.file_count(),
            bytes = context.total_size(),
            "Build context: {}",
            context.root().display()
        );

        // Phase 3: Cache
        let mut cache = CacheManager::with_config(self.cache_dir.clone(), self.cache_size_limit)?;

        // Phase 4: Execute
        let mut executor =
            Executor::new(self.runner.clone(), self.resolver.clone()).no_cache(options.no_cache);
        if let Some(progress) = &self.progress {
            executor = executor.with_progress(progress.clone());
        }
        let output = executor.run_plan(&plan, &context, &mut cache).await?;

        // Phase 5: Publish
        let manifest = output.manifest(&options.name, &options.tag);
        let image_id = self.store().publish(&manifest, &output.layers)?;

        info!(
            "Build completed in {:.1}s: image_id={} ({} of {} steps cached)",
            start_time.elapsed().as_secs_f64(),
            image_id,
            output.stats.cached_steps,
            output.stats.total_steps
        );

        Ok(BuildResult { image_id, manifest, steps: output.steps, stats: output.stats })
    }
}

/// Build and publish an image using the configured runner and base store.
pub async fn build_image(options: BuildOptions, config: &Config) -> Result<BuildResult> {
    ImageBuilder::from_config(config).build(&options).await
}
