//! Image manifest and runtime config.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

/// Current manifest schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Runtime configuration recorded in an image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Process argv started by a container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub working_dir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Declared ports, `<port>/<protocol>`. Documentation only.
    #[serde(default)]
    pub exposed_ports: BTreeSet<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// What a container runtime must execute to start the image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchSpec {
    pub argv: Vec<String>,
    pub working_dir: String,
    pub env: BTreeMap<String, String>,
    pub user: Option<String>,
}

impl ImageConfig {
    /// The launch contract, or `None` when no command was declared.
    pub fn launch_spec(&self) -> Option<LaunchSpec> {
        let argv = self.command.clone().filter(|argv| !argv.is_empty())?;
        let working_dir =
            if self.working_dir.is_empty() { "/".to_string() } else { self.working_dir.clone() };

        Some(LaunchSpec { argv, working_dir, env: self.env.clone(), user: self.user.clone() })
    }
}

/// One layer of an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerDescriptor {
    /// `sha256:<hex>` of the uncompressed layer archive
    pub digest: String,
    /// Size of the uncompressed archive in bytes
    pub size: u64,
}

/// History entry per build step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerHistory {
    pub step: usize,
    pub created_by: String,
    /// True for steps that changed only metadata
    #[serde(default)]
    pub empty_layer: bool,
}

/// Published image manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageManifest {
    pub schema_version: u32,
    pub name: String,
    pub tag: String,
    pub created: DateTime<Utc>,
    pub architecture: String,
    pub os: String,
    pub config: ImageConfig,
    pub layers: Vec<LayerDescriptor>,
    pub history: Vec<LayerHistory>,
}

impl ImageManifest {
    pub fn new(name: &str, tag: &str, config: ImageConfig) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            name: name.to_string(),
            tag: tag.to_string(),
            created: Utc::now(),
            architecture: host_architecture().to_string(),
            os: "linux".to_string(),
            config,
            layers: Vec::new(),
            history: Vec::new(),
        }
    }

    /// Content-derived image id (hex). Name, tag, creation time and history
    /// do not contribute, so rebuilding unchanged inputs gives the same id.
    pub fn image_id(&self) -> String {
        #[derive(Serialize)]
        struct Identity<'a> {
            architecture: &'a str,
            os: &'a str,
            config: &'a ImageConfig,
            layers: &'a [LayerDescriptor],
        }

        let identity = Identity {
            architecture: &self.architecture,
            os: &self.os,
            config: &self.config,
            layers: &self.layers,
        };
        // Serializing plain structs and BTreeMaps cannot fail
        let bytes = serde_json::to_vec(&identity).unwrap_or_default();
        format!("{:x}", Sha256::digest(&bytes))
    }

    /// Sum of layer sizes in bytes.
    pub fn total_size(&self) -> u64 {
        self.layers.iter().map(|l| l.size).sum()
    }

    pub fn reference(&self) -> String {
        format!("{}:{}", self.name, self.tag)
    }
}

/// Architecture name in OCI terms.
pub fn host_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "arm" => "arm",
        other => other,
    }
}

/// First 12 characters of an id, for display.
pub fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}
