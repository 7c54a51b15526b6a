//! Dependency graph of installed packages.
//!
//! Nodes are [`PackageKey`]s, an edge `a -> b` means "a depends on b". The
//! graph is a cache derived from the install manifests and persisted next
//! to them (see [`GraphCache`]).

mod cache;
mod protection;
mod removal;

pub use cache::{CACHE_FILE_NAME, CACHE_FORMAT, CACHE_SCHEMA_VERSION, GraphCache};
pub use protection::ProtectionRecord;

use log::{debug, warn};
use petgraph::Direction;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::unionfind::UnionFind;
use petgraph::visit::{EdgeRef, IntoEdgeReferences, NodeIndexable};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

use crate::package::{Manifest, PackageKey};
use crate::protection::RuleError;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("no dependency {from} -> {to} in the dependency graph")]
    EdgeNotFound { from: PackageKey, to: PackageKey },

    #[error("package {0} is not in the dependency graph")]
    NodeNotFound(PackageKey),

    #[error("package {0} does not belong to any dependency subgraph (run with --dep-recache)")]
    NotInSubgraph(PackageKey),

    #[error("invalid wildcard '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("dependency graph cache {path:?} is corrupt: {reason}")]
    CorruptCache { path: PathBuf, reason: String },

    #[error("dependency graph cache {path:?} has unsupported format '{format}' version {version}")]
    SchemaMismatch { path: PathBuf, format: String, version: u32 },

    #[error(transparent)]
    Rule(#[from] RuleError),
}

/// Weakly-connected component of the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subgraph {
    pub nodes: Vec<PackageKey>,
    pub edges: Vec<(PackageKey, PackageKey)>,
}

#[derive(Debug, Default)]
pub struct DependencyGraph {
    graph: StableDiGraph<PackageKey, ()>,
    indices: HashMap<PackageKey, NodeIndex>,
    dirty: bool,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph from install manifests. The result is marked dirty.
    pub fn from_manifests<'m>(manifests: impl IntoIterator<Item = &'m Manifest>) -> Self {
        let mut graph = Self::new();
        let mut edges = Vec::new();
        for manifest in manifests {
            let key = manifest.key();
            graph.add_node(&key);
            for dep in &manifest.dependencies {
                edges.push((key.clone(), dep.clone()));
            }
        }
        for (pkg, dep) in &edges {
            graph.add(pkg, dep);
        }
        graph.dirty = true;
        graph
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn contains(&self, pkg: &PackageKey) -> bool {
        self.indices.contains_key(pkg)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// All nodes in insertion order.
    pub fn nodes(&self) -> Vec<PackageKey> {
        self.graph.node_indices().map(|idx| self.graph[idx].clone()).collect()
    }

    /// All edges as `(dependent, dependency)` pairs.
    pub fn edges(&self) -> Vec<(PackageKey, PackageKey)> {
        let mut edges: Vec<_> = self
            .graph
            .edge_references()
            .map(|e| (self.graph[e.source()].clone(), self.graph[e.target()].clone()))
            .collect();
        edges.sort();
        edges
    }

    fn ensure_node(&mut self, pkg: &PackageKey) -> NodeIndex {
        if let Some(&idx) = self.indices.get(pkg) {
            return idx;
        }
        let idx = self.graph.add_node(pkg.clone());
        self.indices.insert(pkg.clone(), idx);
        self.dirty = true;
        idx
    }

    fn index_of(&self, pkg: &PackageKey) -> Result<NodeIndex, GraphError> {
        self.indices
            .get(pkg)
            .copied()
            .ok_or_else(|| GraphError::NodeNotFound(pkg.clone()))
    }

    /// Record that `pkg` depends on `dep`, creating missing nodes.
    pub fn add(&mut self, pkg: &PackageKey, dep: &PackageKey) {
        let from = self.ensure_node(pkg);
        let to = self.ensure_node(dep);
        if self.graph.find_edge(from, to).is_none() {
            self.graph.add_edge(from, to, ());
        }
        self.dirty = true;
    }

    /// Add a package without dependencies.
    pub fn add_node(&mut self, pkg: &PackageKey) {
        self.ensure_node(pkg);
        self.dirty = true;
    }

    /// Forget that `pkg` depends on `dep`.
    pub fn remove(&mut self, pkg: &PackageKey, dep: &PackageKey) -> Result<(), GraphError> {
        let edge = match (self.indices.get(pkg), self.indices.get(dep)) {
            (Some(&from), Some(&to)) => self.graph.find_edge(from, to),
            _ => None,
        };
        let edge = edge.ok_or_else(|| GraphError::EdgeNotFound {
            from: pkg.clone(),
            to: dep.clone(),
        })?;
        self.graph.remove_edge(edge);
        self.dirty = true;
        Ok(())
    }

    /// Remove a package and every edge touching it.
    ///
    /// Outgoing edges are expected to be removed beforehand; any left over
    /// is reported as a warning.
    pub fn remove_node(&mut self, pkg: &PackageKey) -> Result<(), GraphError> {
        let idx = self.index_of(pkg)?;
        debug!("Removing {} from the dependency graph", pkg);
        for dep in self.depends_on(pkg)? {
            warn!(
                "Dependency graph remnant will be forgotten: {} depends on {}",
                pkg, dep
            );
        }
        self.graph.remove_node(idx);
        self.indices.remove(pkg);
        self.dirty = true;
        Ok(())
    }

    fn neighbors(&self, pkg: &PackageKey, direction: Direction) -> Result<Vec<PackageKey>, GraphError> {
        let idx = self.index_of(pkg)?;
        let mut result: Vec<_> = self
            .graph
            .neighbors_directed(idx, direction)
            .map(|n| self.graph[n].clone())
            .collect();
        result.sort();
        Ok(result)
    }

    /// Packages that depend on `pkg`.
    pub fn dependency_of(&self, pkg: &PackageKey) -> Result<Vec<PackageKey>, GraphError> {
        self.neighbors(pkg, Direction::Incoming)
    }

    /// Packages `pkg` depends on.
    pub fn depends_on(&self, pkg: &PackageKey) -> Result<Vec<PackageKey>, GraphError> {
        self.neighbors(pkg, Direction::Outgoing)
    }

    /// Node indices grouped by weakly-connected component.
    ///
    /// Components and their members follow node insertion order.
    fn components(&self) -> Vec<Vec<NodeIndex>> {
        let mut sets = UnionFind::new(self.graph.node_bound());
        for edge in self.graph.edge_references() {
            sets.union(edge.source().index(), edge.target().index());
        }

        let mut slot_of_root: HashMap<usize, usize> = HashMap::new();
        let mut components: Vec<Vec<NodeIndex>> = Vec::new();
        for idx in self.graph.node_indices() {
            let root = sets.find(idx.index());
            let slot = *slot_of_root.entry(root).or_insert_with(|| {
                components.push(Vec::new());
                components.len() - 1
            });
            components[slot].push(idx);
        }
        components
    }

    /// Weakly-connected components with their edges.
    pub fn isolated_subgraphs(&self) -> Vec<Subgraph> {
        self.components()
            .into_iter()
            .map(|members| {
                let mut edges = Vec::new();
                for &idx in &members {
                    for edge in self.graph.edges_directed(idx, Direction::Outgoing) {
                        edges.push((self.graph[edge.source()].clone(), self.graph[edge.target()].clone()));
                    }
                }
                edges.sort();
                Subgraph {
                    nodes: members.iter().map(|&idx| self.graph[idx].clone()).collect(),
                    edges,
                }
            })
            .collect()
    }
}
