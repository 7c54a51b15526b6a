//! Protection queries over the dependency graph.
//!
//! A package is protected when a rule matches it directly, or when some
//! package depending on it is protected.

use glob::Pattern;
use petgraph::Direction;
use petgraph::stable_graph::NodeIndex;
use petgraph::visit::{Dfs, Walker};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

use crate::package::PackageKey;
use crate::protection::ProtectionRuleSet;

use super::{DependencyGraph, GraphError};

/// Why a package is protected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectionRecord {
    pub name: String,
    pub version: String,
    /// Labels of rules matching this package directly.
    pub rule_labels: Vec<String>,
    /// Protecting records of the packages depending on this one.
    pub dependents: Vec<ProtectionRecord>,
}

impl ProtectionRecord {
    pub fn key(&self) -> PackageKey {
        PackageKey::new(&self.name, &self.version)
    }

    pub fn is_protecting(&self) -> bool {
        !self.rule_labels.is_empty() || self.dependents.iter().any(ProtectionRecord::is_protecting)
    }

    /// Indented list of the packages providing protection, one per line.
    pub fn write_tree(&self, f: &mut impl fmt::Write, depth: usize) -> fmt::Result {
        write!(f, "{:indent$}\"{}/{}\"", "", self.name, self.version, indent = depth * 4)?;
        if !self.rule_labels.is_empty() {
            write!(f, " protected by rules: {}", self.rule_labels.join(", "))?;
        }
        writeln!(f)?;
        for dependent in &self.dependents {
            dependent.write_tree(f, depth + 1)?;
        }
        Ok(())
    }
}

struct Walk<'g> {
    graph: &'g DependencyGraph,
    rules: &'g ProtectionRuleSet,
    on_stack: HashSet<NodeIndex>,
    done: HashMap<NodeIndex, ProtectionRecord>,
}

impl Walk<'_> {
    fn record(&mut self, idx: NodeIndex) -> Result<ProtectionRecord, GraphError> {
        self.visit(idx).map(|(record, _)| record)
    }

    /// The record of `idx` and whether it is complete. A record that had to
    /// skip a dependent already on the stack only holds for the current path
    /// and is not memoised.
    fn visit(&mut self, idx: NodeIndex) -> Result<(ProtectionRecord, bool), GraphError> {
        if let Some(record) = self.done.get(&idx) {
            return Ok((record.clone(), true));
        }

        let key = &self.graph.graph[idx];
        let rule_labels = self.rules.matching_labels(key)?;
        self.on_stack.insert(idx);

        let mut sources: Vec<NodeIndex> = self.graph.graph.neighbors_directed(idx, Direction::Incoming).collect();
        sources.sort_by(|a, b| self.graph.graph[*a].cmp(&self.graph.graph[*b]));

        let mut dependents = Vec::new();
        let mut complete = true;
        for source in sources {
            // A cycle leads back to a package already being examined.
            if self.on_stack.contains(&source) {
                complete = false;
                continue;
            }
            let (dependent, dependent_complete) = self.visit(source)?;
            complete &= dependent_complete;
            if dependent.is_protecting() {
                dependents.push(dependent);
            }
        }

        self.on_stack.remove(&idx);
        let key = &self.graph.graph[idx];
        let record = ProtectionRecord {
            name: key.name.clone(),
            version: key.version.clone(),
            rule_labels,
            dependents,
        };
        if complete {
            self.done.insert(idx, record.clone());
        }
        Ok((record, complete))
    }
}

impl DependencyGraph {
    /// Rules protecting `pkg`, directly or (`recursive`) through its dependents.
    pub fn protecting_rules(
        &self,
        pkg: &PackageKey,
        rules: &ProtectionRuleSet,
        recursive: bool,
    ) -> Result<ProtectionRecord, GraphError> {
        if !recursive {
            return Ok(ProtectionRecord {
                name: pkg.name.clone(),
                version: pkg.version.clone(),
                rule_labels: rules.matching_labels(pkg)?,
                dependents: Vec::new(),
            });
        }

        let idx = self.index_of(pkg)?;
        let mut walk = Walk {
            graph: self,
            rules,
            on_stack: HashSet::new(),
            done: HashMap::new(),
        };
        walk.record(idx)
    }

    /// Nodes matched directly by at least one rule, with their sorted labels.
    pub fn protected_rules_by_pkg(
        &self,
        rules: &ProtectionRuleSet,
    ) -> Result<BTreeMap<PackageKey, Vec<String>>, GraphError> {
        let mut result = BTreeMap::new();
        for idx in self.graph.node_indices() {
            let key = &self.graph[idx];
            let labels: BTreeSet<String> = rules.matching_labels(key)?.into_iter().collect();
            if !labels.is_empty() {
                result.insert(key.clone(), labels.into_iter().collect());
            }
        }
        Ok(result)
    }

    /// Directly protected nodes and everything they depend on, transitively.
    pub fn protected_pkgs(&self, rules: &ProtectionRuleSet) -> Result<BTreeSet<PackageKey>, GraphError> {
        let direct = self.protected_rules_by_pkg(rules)?;
        let mut protected = BTreeSet::new();
        for key in direct.keys() {
            let start = self.index_of(key)?;
            if protected.contains(key) {
                continue;
            }
            for idx in Dfs::new(&self.graph, start).iter(&self.graph) {
                protected.insert(self.graph[idx].clone());
            }
        }
        Ok(protected)
    }

    pub fn unprotected_pkgs(&self, rules: &ProtectionRuleSet) -> Result<BTreeSet<PackageKey>, GraphError> {
        let protected = self.protected_pkgs(rules)?;
        Ok(self
            .graph
            .node_weights()
            .filter(|key| !protected.contains(*key))
            .cloned()
            .collect())
    }

    /// Nodes matching both globs that no rule protects directly.
    pub fn matching_pkgs(
        &self,
        name_pattern: &str,
        version_pattern: &str,
        rules: &ProtectionRuleSet,
    ) -> Result<BTreeSet<PackageKey>, GraphError> {
        let compile = |pattern: &str| {
            Pattern::new(pattern).map_err(|e| GraphError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })
        };
        let name_pat = compile(name_pattern)?;
        let version_pat = compile(version_pattern)?;

        let mut result = BTreeSet::new();
        for key in self.graph.node_weights() {
            if name_pat.matches(&key.name)
                && version_pat.matches(&key.version)
                && rules.matching_labels(key)?.is_empty()
            {
                result.insert(key.clone());
            }
        }
        Ok(result)
    }
}
