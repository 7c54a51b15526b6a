use petgraph::stable_graph::NodeIndex;
use petgraph::visit::{DfsPostOrder, NodeFiltered};
use std::collections::HashSet;

use crate::package::PackageKey;

use super::{DependencyGraph, GraphError};

impl DependencyGraph {
    /// Order `packages` so each one comes after everything it depends on.
    ///
    /// Returns one tier per weakly-connected component holding requested
    /// packages. Only edges between requested packages are followed.
    pub fn sort_for_removal<'p>(
        &self,
        packages: impl IntoIterator<Item = &'p PackageKey>,
    ) -> Result<Vec<Vec<PackageKey>>, GraphError> {
        let mut requested: HashSet<NodeIndex> = HashSet::new();
        for pkg in packages {
            let idx = self
                .indices
                .get(pkg)
                .copied()
                .ok_or_else(|| GraphError::NotInSubgraph(pkg.clone()))?;
            requested.insert(idx);
        }

        let induced = NodeFiltered::from_fn(&self.graph, |idx| requested.contains(&idx));
        let mut tiers = Vec::new();
        for component in self.components() {
            let starts: Vec<NodeIndex> = component.into_iter().filter(|idx| requested.contains(idx)).collect();
            if starts.is_empty() {
                continue;
            }

            let mut dfs = DfsPostOrder::empty(&induced);
            let mut tier = Vec::with_capacity(starts.len());
            for start in starts {
                dfs.move_to(start);
                while let Some(idx) = dfs.next(&induced) {
                    tier.push(self.graph[idx].clone());
                }
            }
            tiers.push(tier);
        }
        Ok(tiers)
    }
}
