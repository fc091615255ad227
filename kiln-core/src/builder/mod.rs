//! Image building system for kiln.
//!
//! This module provides Dockerfile parsing, build plans, build graph
//! construction, layer caching, and build execution for creating kiln
//! images.

pub mod base;
pub mod build;
pub mod cache;
pub mod context;
pub mod executor;
pub mod graph;
pub mod image;
pub mod parser;
pub mod plan;
pub mod runner;
pub mod snapshot;
pub mod store;

pub use base::{BaseImage, BaseResolver, LocalBaseStore, ResolveError};
pub use build::{build_image, load_plan, BuildOptions, BuildResult, ImageBuilder, PlanSource};
pub use cache::{CacheError, CacheLookupResult, CacheManager, CacheStats, LayerMetadata};
pub use context::{BuildContext, ContextError};
pub use executor::{BuildError, BuildOutput, BuildStats, Executor, StepEvent, StepReport};
pub use graph::{BuildGraph, BuildNode, GraphError};
pub use image::{ImageConfig, ImageManifest, LaunchSpec, LayerDescriptor, LayerHistory};
pub use parser::{parse_dockerfile, Dockerfile, ImageRef, Instruction, ParseError, RunCommand};
pub use plan::{BuildPlan, PlanError, Preset, Stage, StageKind};
pub use runner::{ChrootRunner, CommandRunner, RunInvocation, RunOutcome, RunnerError};
pub use snapshot::{Entry, Layer, Snapshot};
pub use store::{ImageStore, ImageSummary, StoreError};
