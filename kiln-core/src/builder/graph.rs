//! Build graph (DAG) for kiln image building.
//!
//! Converts a build plan into a graph of build steps with chained cache
//! keys and a topological execution order. A single-base plan always forms
//! a chain, but execution still goes through the sort so a malformed graph
//! is caught before any stage runs.

use crate::builder::context::{BuildContext, ContextError};
use crate::builder::plan::{BuildPlan, Stage};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;

/// A directed acyclic graph representing a build plan.
#[derive(Debug, Clone)]
pub struct BuildGraph {
    /// All nodes in the graph
    pub nodes: Vec<BuildNode>,
    /// Adjacency list: node_id -> [dependent_node_ids]
    pub edges: HashMap<usize, Vec<usize>>,
    /// Root nodes (no dependencies)
    pub roots: Vec<usize>,
}

/// A single node in the build graph (one build step).
#[derive(Debug, Clone)]
pub struct BuildNode {
    /// Unique node ID
    pub id: usize,
    /// 1-based step number shown to the user
    pub step: usize,
    /// The stage to execute
    pub stage: Stage,
    /// Cache key (sha256 of parent key, stage and input digest)
    pub cache_key: String,
    /// Parent node ID (for sequential dependencies)
    pub parent: Option<usize>,
    /// Digest of the build context files this step reads
    pub input_digest: Option<String>,
}

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Circular dependency detected: {cycle:?}")]
    CircularDependency { cycle: Vec<usize> },

    #[error("Invalid graph: {message}")]
    InvalidGraph { message: String },

    #[error("Step {step}: {source}")]
    Context {
        step: usize,
        #[source]
        source: ContextError,
    },
}

impl BuildGraph {
    /// Creates a build graph from a plan.
    ///
    /// `base_digest` is the content digest of the resolved base image; it
    /// seeds the key chain so a changed base invalidates every step.
    pub fn from_plan(
        plan: &BuildPlan,
        context: &BuildContext,
        base_digest: &str,
    ) -> Result<Self, GraphError> {
        GraphBuilder::new(context, base_digest).build(plan)
    }

    /// Returns nodes in topological order (execution order).
    pub fn topological_sort(&self) -> Result<Vec<usize>, GraphError> {
        // Kahn's algorithm
        let mut in_degree: HashMap<usize, usize> = self.nodes.iter().map(|n| (n.id, 0)).collect();
        let mut result = Vec::with_capacity(self.nodes.len());
        let mut queue = VecDeque::new();

        for neighbors in self.edges.values() {
            for neighbor in neighbors {
                let degree = in_degree.get_mut(neighbor).ok_or_else(|| GraphError::InvalidGraph {
                    message: format!("Edge to unknown node {}", neighbor),
                })?;
                *degree += 1;
            }
        }

        for node in &self.nodes {
            if in_degree[&node.id] == 0 {
                queue.push_back(node.id);
            }
        }

        while let Some(node_id) = queue.pop_front() {
            result.push(node_id);

            if let Some(neighbors) = self.edges.get(&node_id) {
                for neighbor in neighbors {
                    if let Some(degree) = in_degree.get_mut(neighbor) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(*neighbor);
                        }
                    }
                }
            }
        }

        if result.len() != self.nodes.len() {
            let done: HashSet<usize> = result.iter().copied().collect();
            let cycle = self.nodes.iter().map(|n| n.id).filter(|id| !done.contains(id)).collect();
            return Err(GraphError::CircularDependency { cycle });
        }

        Ok(result)
    }

    /// Gets a node by ID.
    pub fn get_node(&self, id: usize) -> Option<&BuildNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Nodes in execution order.
    pub fn ordered_nodes(&self) -> Result<Vec<&BuildNode>, GraphError> {
        self.topological_sort()?
            .into_iter()
            .map(|id| {
                self.get_node(id).ok_or_else(|| GraphError::InvalidGraph {
                    message: format!("Unknown node {}", id),
                })
            })
            .collect()
    }

    /// Cache key of the last step; identifies the whole build.
    pub fn final_key(&self) -> Option<&str> {
        self.nodes.last().map(|n| n.cache_key.as_str())
    }
}

/// Internal builder for constructing the build graph.
struct GraphBuilder<'a> {
    context: &'a BuildContext,
    base_digest: &'a str,
    nodes: Vec<BuildNode>,
    edges: HashMap<usize, Vec<usize>>,
}

impl<'a> GraphBuilder<'a> {
    fn new(context: &'a BuildContext, base_digest: &'a str) -> Self {
        Self { context, base_digest, nodes: Vec::new(), edges: HashMap::new() }
    }

    fn build(mut self, plan: &BuildPlan) -> Result<BuildGraph, GraphError> {
        let mut parent: Option<usize> = None;

        for stage in &plan.stages {
            let node_id = self.create_node(stage.clone(), parent)?;
            if let Some(parent_id) = parent {
                self.edges.entry(parent_id).or_default().push(node_id);
            }
            parent = Some(node_id);
        }

        let targets: HashSet<usize> = self.edges.values().flatten().copied().collect();
        let roots = self.nodes.iter().filter(|n| !targets.contains(&n.id)).map(|n| n.id).collect();

        Ok(BuildGraph { nodes: self.nodes, edges: self.edges, roots })
    }

    fn create_node(&mut self, stage: Stage, parent: Option<usize>) -> Result<usize, GraphError> {
        let id = self.nodes.len();
        let step = id + 1;

        let sources = stage.context_sources();
        let input_digest = if sources.is_empty() {
            None
        } else {
            Some(
                self.context
                    .digest_sources(sources)
                    .map_err(|source| GraphError::Context { step, source })?,
            )
        };

        let cache_key = self.compute_cache_key(&stage, parent, input_digest.as_deref());
        self.nodes.push(BuildNode { id, step, stage, cache_key, parent, input_digest });
        Ok(id)
    }

    fn compute_cache_key(
        &self,
        stage: &Stage,
        parent: Option<usize>,
        input_digest: Option<&str>,
    ) -> String {
        let mut hasher = Sha256::new();

        // Chain on the parent key; the first step chains on the base content
        match parent.and_then(|id| self.nodes.get(id)) {
            Some(parent_node) => hasher.update(parent_node.cache_key.as_bytes()),
            None => hasher.update(self.base_digest.as_bytes()),
        }

        hasher.update(stage.describe().as_bytes());
        if let Some(digest) = input_digest {
            hasher.update(b"\0");
            hasher.update(digest.as_bytes());
        }

        format!("{:x}", hasher.finalize())
    }
}
