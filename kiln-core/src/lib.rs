//! kiln core library
//!
//! Descriptor parsing, build plans, layer caching, build execution and the
//! local image store behind the `kiln` CLI.

pub mod builder;
pub mod config;
pub mod error;
pub mod observability;
pub mod paths;

// Re-export commonly used items
pub use builder::{
    build_image, BuildOptions, BuildPlan, BuildResult, ImageBuilder, ImageManifest, ImageStore,
    PlanSource, Preset,
};
pub use config::Config;
pub use error::{KilnError, Result};
pub use observability::init as init_observability;
