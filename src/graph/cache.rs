//! On-disk cache of the dependency graph.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::package::{PackageKey, PackageRegistry};
use crate::runtime::Runtime;

use super::{DependencyGraph, GraphError};

pub const CACHE_FILE_NAME: &str = "deps.graph.json";
pub const CACHE_FORMAT: &str = "sharepkg-dependency-graph";
pub const CACHE_SCHEMA_VERSION: u32 = 1;

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct CacheDocument {
    format: String,
    schema_version: u32,
    /// Manifests the graph was built from, relative to the registry root.
    manifests: Vec<String>,
    nodes: Vec<PackageKey>,
    /// Pairs of indices into `nodes`.
    edges: Vec<(usize, usize)>,
}

impl CacheDocument {
    fn from_graph(graph: &DependencyGraph, manifests: Vec<String>) -> Self {
        let nodes = graph.nodes();
        let position = |key: &PackageKey| nodes.iter().position(|n| n == key);
        let edges = graph
            .edges()
            .iter()
            .filter_map(|(from, to)| Some((position(from)?, position(to)?)))
            .collect();
        Self {
            format: CACHE_FORMAT.to_string(),
            schema_version: CACHE_SCHEMA_VERSION,
            manifests,
            nodes,
            edges,
        }
    }

    fn parse(path: &Path, content: &str) -> Result<Self, GraphError> {
        let document: CacheDocument = serde_json::from_str(content).map_err(|e| GraphError::CorruptCache {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        if document.format != CACHE_FORMAT || document.schema_version != CACHE_SCHEMA_VERSION {
            return Err(GraphError::SchemaMismatch {
                path: path.to_path_buf(),
                format: document.format,
                version: document.schema_version,
            });
        }
        Ok(document)
    }

    fn into_graph(self, path: &Path) -> Result<DependencyGraph, GraphError> {
        let mut graph = DependencyGraph::new();
        for node in &self.nodes {
            graph.add_node(node);
        }
        for (from, to) in self.edges {
            match (self.nodes.get(from), self.nodes.get(to)) {
                (Some(from), Some(to)) => graph.add(from, to),
                _ => {
                    return Err(GraphError::CorruptCache {
                        path: path.to_path_buf(),
                        reason: format!("edge ({}, {}) refers to a missing node", from, to),
                    });
                }
            }
        }
        graph.mark_clean();
        Ok(graph)
    }
}

/// Dependency graph loaded from, and written back to, the registry.
///
/// A fresh graph is built from the manifests when the cache file is absent,
/// unreadable, stale or a rebuild is forced. Nothing is written until
/// [`GraphCache::close`], so a read-only registry still gets an in-memory
/// graph.
pub struct GraphCache<'a, R: Runtime> {
    registry: &'a PackageRegistry<'a, R>,
    path: PathBuf,
    graph: DependencyGraph,
}

impl<'a, R: Runtime> GraphCache<'a, R> {
    #[tracing::instrument(skip(registry))]
    pub fn open(registry: &'a PackageRegistry<'a, R>, force_rebuild: bool) -> Result<Self> {
        let path = registry.root().join(CACHE_FILE_NAME);
        let manifests = registry.manifest_list()?;

        let cached = if force_rebuild {
            debug!("Dependency graph rebuild forced");
            None
        } else {
            Self::read_cached(registry.runtime(), &path, &manifests)
        };

        let graph = match cached {
            Some(graph) => {
                debug!("Using dependency graph cache from {:?}", path);
                graph
            }
            None => {
                debug!("Re-generating dependency graph from {} manifests", manifests.len());
                let loaded = registry.all_manifests()?;
                DependencyGraph::from_manifests(loaded.iter().map(|(_, m)| m))
            }
        };

        Ok(Self { registry, path, graph })
    }

    fn read_cached(runtime: &R, path: &Path, manifests: &[String]) -> Option<DependencyGraph> {
        if !runtime.exists(path) {
            debug!("No dependency graph cache at {:?}", path);
            return None;
        }
        let content = match runtime.read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                warn!("Failed to read dependency graph cache: {:#}", e);
                return None;
            }
        };
        let document = match CacheDocument::parse(path, &content) {
            Ok(document) => document,
            Err(e) => {
                warn!("{}, rebuilding", e);
                return None;
            }
        };
        if document.manifests != manifests {
            info!("Dependency graph cache is stale, rebuilding");
            return None;
        }
        match document.into_graph(path) {
            Ok(graph) => Some(graph),
            Err(e) => {
                warn!("{}, rebuilding", e);
                None
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut DependencyGraph {
        &mut self.graph
    }

    /// Write the graph back if it changed.
    #[tracing::instrument(skip(self))]
    pub fn close(mut self) -> Result<()> {
        if !self.graph.is_dirty() {
            debug!("Dependency graph did not change");
            return Ok(());
        }

        let manifests = self.registry.manifest_list()?;
        let document = CacheDocument::from_graph(&self.graph, manifests);
        let content = serde_json::to_string_pretty(&document)?;
        self.registry
            .runtime()
            .write(&self.path, content.as_bytes())
            .with_context(|| format!("Failed to write dependency graph cache {:?}", self.path))?;
        self.graph.mark_clean();
        debug!("Dependency graph cached at {:?}", self.path);
        Ok(())
    }
}
