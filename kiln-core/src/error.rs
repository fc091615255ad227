//! Error types for kiln.
//!
//! Each builder module owns a `thiserror` enum; `KilnError` is the
//! crate-level error that wraps them so callers can use a single `Result`.

use crate::builder::cache::CacheError;
use crate::builder::executor::BuildError;
use crate::builder::plan::PlanError;
use crate::builder::store::StoreError;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for kiln operations.
pub type Result<T> = std::result::Result<T, KilnError>;

/// Main error type for kiln.
#[derive(Error, Debug)]
pub enum KilnError {
    // Descriptor errors
    #[error("Invalid Dockerfile at {path:?}: {reason}")]
    InvalidDockerfile { path: PathBuf, reason: String },

    #[error("Invalid build plan: {0}")]
    InvalidPlan(#[from] PlanError),

    #[error("Unknown preset: {name}. Available presets: {available}")]
    UnknownPreset { name: String, available: String },

    // Build context errors
    #[error("Build context not found: {path:?}")]
    ContextNotFound { path: PathBuf },

    #[error("Build context error: {reason}")]
    Context { reason: String },

    // Build errors
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("Layer cache error: {0}")]
    Cache(#[from] CacheError),

    // Image errors
    #[error(transparent)]
    Store(#[from] StoreError),

    // Configuration errors
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl KilnError {
    /// Step number of the failing build stage, if the error came from one.
    pub fn failed_step(&self) -> Option<usize> {
        match self {
            Self::Build(err) => err.step(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_step() {
        let err: KilnError = BuildError::DependencyInstall {
            step: 5,
            description: "RUN pip install -r requirements.txt".to_string(),
            reason: "exit code 1".to_string(),
        }
        .into();
        assert_eq!(err.failed_step(), Some(5));
        assert!(err.to_string().starts_with("Step 5 (RUN pip install"));

        let err: KilnError = PlanError::MissingBase.into();
        assert_eq!(err.failed_step(), None);
    }
}
