//! Remove action - resolves, verifies and executes removal requests.

use anyhow::{Context, Result, bail};
use log::{debug, error, info, warn};
use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::graph::{DependencyGraph, ProtectionRecord};
use crate::package::{PackageKey, PackageRegistry};
use crate::protection::ProtectionRuleSet;
use crate::runtime::Runtime;

/// Request token selecting every package not protected by a rule.
pub const GC_TOKEN: &str = "@unprotected";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemovalRequest {
    Exact { name: String, version_pattern: String },
    Wildcard { name_pattern: String, version_pattern: String },
    Unprotected,
}

impl RemovalRequest {
    /// Version pattern defaults to `*`.
    pub fn parse(name: &str, version: Option<&str>) -> Self {
        if name == GC_TOKEN {
            if let Some(version) = version {
                warn!("Version \"{}\" is ignored for {}", version, GC_TOKEN);
            }
            return RemovalRequest::Unprotected;
        }
        let version_pattern = version.unwrap_or("*").to_string();
        if name.contains(['*', '?', '[']) {
            RemovalRequest::Wildcard {
                name_pattern: name.to_string(),
                version_pattern,
            }
        } else {
            RemovalRequest::Exact {
                name: name.to_string(),
                version_pattern,
            }
        }
    }
}

impl fmt::Display for RemovalRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemovalRequest::Exact { name, version_pattern } => write!(f, "{}/{}", name, version_pattern),
            RemovalRequest::Wildcard {
                name_pattern,
                version_pattern,
            } => write!(f, "{}/{}", name_pattern, version_pattern),
            RemovalRequest::Unprotected => f.write_str(GC_TOKEN),
        }
    }
}

/// Why a removal request can not proceed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConflictReport {
    /// Candidates protected by a rule, directly or through dependents.
    pub protected: Vec<ProtectionRecord>,
    /// Candidates other installed packages depend on, with those packages.
    pub needed_by: Vec<(PackageKey, Vec<PackageKey>)>,
}

impl ConflictReport {
    pub fn is_empty(&self) -> bool {
        self.protected.is_empty() && self.needed_by.is_empty()
    }
}

impl fmt::Display for ConflictReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Following issues found for deletion request:")?;
        for record in &self.protected {
            record.write_tree(f, 1)?;
        }
        for (key, dependents) in &self.needed_by {
            let names: Vec<String> = dependents.iter().map(ToString::to_string).collect();
            writeln!(f, "    {} is needed by {}", key, names.join(", "))?;
        }
        Ok(())
    }
}

impl std::error::Error for ConflictReport {}

/// Resolves requests against the graph and verifies them.
pub struct RemovalPlanner<'g> {
    graph: &'g DependencyGraph,
    rules: &'g ProtectionRuleSet,
}

impl<'g> RemovalPlanner<'g> {
    pub fn new(graph: &'g DependencyGraph, rules: &'g ProtectionRuleSet) -> Self {
        Self { graph, rules }
    }

    /// Packages selected by `request`. Empty only for [`RemovalRequest::Unprotected`].
    pub fn resolve(&self, request: &RemovalRequest) -> Result<BTreeSet<PackageKey>> {
        let (name, version) = match request {
            RemovalRequest::Unprotected => return Ok(self.graph.unprotected_pkgs(self.rules)?),
            RemovalRequest::Exact { name, version_pattern } => (name, version_pattern),
            RemovalRequest::Wildcard {
                name_pattern,
                version_pattern,
            } => (name_pattern, version_pattern),
        };

        let found = self.graph.matching_pkgs(name, version, self.rules)?;
        if found.is_empty() {
            let installed = self.graph.matching_pkgs(name, version, &ProtectionRuleSet::new())?;
            if installed.is_empty() {
                bail!("Package is not installed: nothing matches \"{}\"", request);
            }
            let names: Vec<String> = installed.iter().map(ToString::to_string).collect();
            bail!(
                "Every package matching \"{}\" is protected by a rule: {}",
                request,
                names.join(", ")
            );
        }
        Ok(found)
    }

    /// Verify `candidates` and order them in removal tiers.
    ///
    /// A conflict fails the whole request with a [`ConflictReport`].
    pub fn plan(&self, candidates: &BTreeSet<PackageKey>) -> Result<Vec<Vec<PackageKey>>> {
        let mut report = ConflictReport::default();
        for candidate in candidates {
            let record = self.graph.protecting_rules(candidate, self.rules, true)?;
            if record.is_protecting() {
                report.protected.push(record);
                continue;
            }
            let outside: Vec<PackageKey> = self
                .graph
                .dependency_of(candidate)?
                .into_iter()
                .filter(|dependent| !candidates.contains(dependent))
                .collect();
            if !outside.is_empty() {
                report.needed_by.push((candidate.clone(), outside));
            }
        }
        if !report.is_empty() {
            return Err(report.into());
        }
        Ok(self.graph.sort_for_removal(candidates)?)
    }

    pub fn protection_status(&self, name: &str, version: &str) -> Result<ProtectionRecord> {
        Ok(self
            .graph
            .protecting_rules(&PackageKey::new(name, version), self.rules, true)?)
    }
}

/// Packages removed by one request.
#[derive(Debug, Default, PartialEq)]
pub struct RemovalSummary {
    pub removed: Vec<PackageKey>,
    pub cancelled: bool,
}

pub struct RemoveAction<'a, R: Runtime> {
    runtime: &'a R,
    registry: &'a PackageRegistry<'a, R>,
}

impl<'a, R: Runtime> RemoveAction<'a, R> {
    pub fn new(runtime: &'a R, registry: &'a PackageRegistry<'a, R>) -> Self {
        Self { runtime, registry }
    }

    /// Resolve, verify, confirm and execute `request`.
    #[tracing::instrument(skip(self, rules, graph))]
    pub fn run(
        &self,
        request: &RemovalRequest,
        rules: &ProtectionRuleSet,
        graph: &mut DependencyGraph,
        yes: bool,
    ) -> Result<RemovalSummary> {
        let tiers = {
            let planner = RemovalPlanner::new(graph, rules);
            let candidates = planner.resolve(request)?;
            if candidates.is_empty() {
                info!("Nothing to remove for {}", request);
                return Ok(RemovalSummary::default());
            }
            planner.plan(&candidates)?
        };
        let total: usize = tiers.iter().map(Vec::len).sum();

        self.show_plan(&tiers, total);
        if !yes {
            if !self.runtime.is_interactive() {
                bail!(
                    "Automatic confirmation is not set and terminal is not a TTY, refusing to delete {} package(s)",
                    total
                );
            }
            if !self.runtime.confirm("Proceed with removal?")? {
                println!("Removal cancelled.");
                return Ok(RemovalSummary {
                    cancelled: true,
                    ..Default::default()
                });
            }
        }

        info!("Deleting package(s)...");
        let mut summary = RemovalSummary::default();
        let mut failed = Vec::new();
        for key in tiers.iter().flatten() {
            match self.remove_package(key, graph) {
                Ok(()) => summary.removed.push(key.clone()),
                Err(e) => {
                    error!("Failed to remove {}: {:#}", key, e);
                    failed.push(key.to_string());
                }
            }
        }
        if !failed.is_empty() {
            bail!("{} package(s) could not be removed: {}", failed.len(), failed.join(", "));
        }
        Ok(summary)
    }

    fn show_plan(&self, tiers: &[Vec<PackageKey>], total: usize) {
        println!("Packages selected for deletion ({}):", total);
        for key in tiers.iter().flatten() {
            match self.registry.load(&key.name, &key.version) {
                Ok(Some(manifest)) => println!("  {:>24} {:<24} {}", key.name, key.version, manifest.stats.summary()),
                _ => println!("  {:>24} {:<24} (no manifest)", key.name, key.version),
            }
        }
    }

    /// Delete one package's files and manifest, then drop it from the graph.
    ///
    /// On error the manifest and the graph are left as they were.
    #[tracing::instrument(skip(self, graph))]
    pub fn remove_package(&self, key: &PackageKey, graph: &mut DependencyGraph) -> Result<()> {
        let manifest = self.registry.load_required(key)?;
        info!(
            "Removing package \"{}\" of version \"{}\" ({}), installed at {}",
            manifest.package,
            manifest.full_version(),
            manifest.stats.summary(),
            manifest.installed_at
        );

        let manifest_path = self.registry.manifest_path(&key.name, &key.version);
        self.remove_entries(&manifest.fs_entries)
            .with_context(|| format!("Manifest {:?} kept for further investigation", manifest_path))?;

        info!("Deleting package manifest {:?}", manifest_path);
        self.registry.delete(key)?;

        // Dependencies removed earlier in the batch took their edges along.
        let present: Vec<&PackageKey> = manifest.dependencies.iter().filter(|dep| graph.contains(dep)).collect();
        for dep in present {
            if let Err(e) = graph.remove(key, dep) {
                error!("Failed to update dependency graph ({}); run with --dep-recache to fix it", e);
            }
        }
        if let Err(e) = graph.remove_node(key) {
            error!("Failed to update dependency graph ({}); run with --dep-recache to fix it", e);
        }
        info!("\"{}\" of version \"{}\" removed", key.name, key.version);
        Ok(())
    }

    /// Files and links first, then directories deepest first. Directories
    /// still holding something are left in place.
    fn remove_entries(&self, entries: &[PathBuf]) -> Result<()> {
        let runtime = self.runtime;
        let mut dirs = BTreeSet::new();
        for entry in entries {
            if runtime.is_symlink(entry) {
                debug!("Un-linking {:?}", entry);
                runtime.remove_symlink(entry)?;
            } else if runtime.is_dir(entry) {
                dirs.insert(entry.clone());
                continue;
            } else if runtime.is_file(entry) {
                debug!("Deleting file {:?}", entry);
                runtime.remove_file(entry)?;
            } else {
                warn!("Unknown or missing filesystem entry: {:?}", entry);
                continue;
            }
            if let Some(parent) = entry.parent() {
                dirs.insert(parent.to_path_buf());
            }
        }

        let mut dirs: Vec<PathBuf> = dirs.into_iter().collect();
        dirs.sort_by_key(|dir| Reverse(dir.components().count()));
        for dir in dirs {
            self.remove_if_empty(&dir)?;
        }
        Ok(())
    }

    fn remove_if_empty(&self, dir: &Path) -> Result<()> {
        if !self.runtime.is_dir(dir) {
            return Ok(());
        }
        if !self.runtime.read_dir(dir)?.is_empty() {
            debug!("Directory {:?} is not empty, kept", dir);
            return Ok(());
        }
        debug!("Removing empty directory {:?}", dir);
        self.runtime.remove_dir(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests::{key, scenario_graph};
    use crate::protection::{KeepAll, KeepVersion};
    use crate::runtime::{MockRuntime, RealRuntime};
    use crate::test_utils::manifest_json;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    fn scenario_rules() -> ProtectionRuleSet {
        let mut rules = ProtectionRuleSet::new();
        rules.insert("a", Box::new(KeepVersion::new("keep-a1", "1").unwrap()));
        rules.insert("a", Box::new(KeepVersion::new("keep-a3", "3").unwrap()));
        rules.insert("b", Box::new(KeepVersion::new("keep-b3", "3").unwrap()));
        rules
    }

    #[test]
    fn test_parse_request() {
        assert_eq!(RemovalRequest::parse(GC_TOKEN, None), RemovalRequest::Unprotected);
        assert_eq!(
            RemovalRequest::parse("root", Some("6.*")),
            RemovalRequest::Exact {
                name: "root".into(),
                version_pattern: "6.*".into()
            }
        );
        assert_eq!(
            RemovalRequest::parse("py-*", None),
            RemovalRequest::Wildcard {
                name_pattern: "py-*".into(),
                version_pattern: "*".into()
            }
        );
        assert_eq!(RemovalRequest::parse("py-*", None).to_string(), "py-*/*");
    }

    #[test]
    fn test_resolve_unprotected() {
        let graph = scenario_graph();
        let rules = scenario_rules();
        let planner = RemovalPlanner::new(&graph, &rules);

        let found = planner.resolve(&RemovalRequest::Unprotected).unwrap();
        let expected: BTreeSet<_> = ["b/1", "b/2", "c/1", "c/2", "d/1"].iter().map(|s| key(s)).collect();
        assert_eq!(found, expected);
    }

    #[test]
    fn test_resolve_nothing_or_protected() {
        let graph = scenario_graph();
        let rules = scenario_rules();
        let planner = RemovalPlanner::new(&graph, &rules);

        let err = planner.resolve(&RemovalRequest::parse("zlib", None)).unwrap_err();
        assert!(err.to_string().contains("nothing matches"));

        let err = planner.resolve(&RemovalRequest::parse("a", Some("1"))).unwrap_err();
        assert!(err.to_string().contains("protected"));

        let found = planner.resolve(&RemovalRequest::parse("b", None)).unwrap();
        assert_eq!(found, [key("b/1"), key("b/2")].into_iter().collect());
    }

    #[test]
    fn test_gc_on_fully_protected_graph_is_noop() {
        let graph = scenario_graph();
        let mut rules = ProtectionRuleSet::new();
        for name in ["a", "b", "c", "d"] {
            rules.insert(name, Box::new(KeepAll::new("keep-all")));
        }
        let planner = RemovalPlanner::new(&graph, &rules);
        assert!(planner.resolve(&RemovalRequest::Unprotected).unwrap().is_empty());
    }

    #[test]
    fn test_plan_orders_tiers() {
        let graph = scenario_graph();
        let rules = scenario_rules();
        let planner = RemovalPlanner::new(&graph, &rules);

        let candidates = planner.resolve(&RemovalRequest::Unprotected).unwrap();
        let tiers = planner.plan(&candidates).unwrap();

        let flat: BTreeSet<_> = tiers.iter().flatten().cloned().collect();
        assert_eq!(flat, candidates);
        for tier in &tiers {
            for (i, pkg) in tier.iter().enumerate() {
                for dep in graph.depends_on(pkg).unwrap() {
                    if let Some(j) = tier.iter().position(|p| *p == dep) {
                        assert!(j < i, "{} must precede {}", dep, pkg);
                    }
                }
            }
        }
    }

    #[test]
    fn test_plan_reports_protected_dependents() {
        let graph = scenario_graph();
        let mut rules = ProtectionRuleSet::new();
        rules.insert("c", Box::new(KeepVersion::new("keep-c1", "1").unwrap()));
        let planner = RemovalPlanner::new(&graph, &rules);

        let candidates: BTreeSet<_> = [key("a/2"), key("b/3")].into_iter().collect();
        let err = planner.plan(&candidates).unwrap_err();
        let report = err.downcast_ref::<ConflictReport>().unwrap();

        assert_eq!(report.protected.len(), 2);
        assert_eq!(report.protected[1].key(), key("b/3"));
        assert_eq!(report.protected[1].dependents[0].rule_labels, vec!["keep-c1"]);
        let text = report.to_string();
        assert!(text.starts_with("Following issues found for deletion request:\n"));
        assert!(text.contains("        \"c/1\" protected by rules: keep-c1\n"));
    }

    #[test]
    fn test_plan_reports_dependents_outside_request() {
        let graph = scenario_graph();
        let rules = ProtectionRuleSet::new();
        let planner = RemovalPlanner::new(&graph, &rules);

        let candidates: BTreeSet<_> = [key("a/1"), key("b/1")].into_iter().collect();
        let err = planner.plan(&candidates).unwrap_err();
        let report = err.downcast_ref::<ConflictReport>().unwrap();
        assert_eq!(report.needed_by, vec![(key("a/1"), vec![key("b/2")])]);
        assert!(report.to_string().contains("a/1 is needed by b/2"));
    }

    #[test]
    fn test_protection_status() {
        let graph = scenario_graph();
        let rules = scenario_rules();
        let planner = RemovalPlanner::new(&graph, &rules);

        assert!(planner.protection_status("a", "2").unwrap().is_protecting());
        assert!(!planner.protection_status("b", "1").unwrap().is_protecting());
        assert!(planner.protection_status("x", "1").is_err());
    }

    struct Installed {
        dir: TempDir,
    }

    impl Installed {
        /// Registry with packages whose files live under `<dir>/opt/<name>/<version>`.
        fn new(packages: &[(&str, &str, &[(&str, &str)])]) -> Self {
            let dir = tempdir().unwrap();
            for (name, version, deps) in packages {
                let prefix = dir.path().join("opt").join(name).join(version);
                fs::create_dir_all(prefix.join("bin")).unwrap();
                fs::write(prefix.join("bin").join(name), "bin").unwrap();
                let mut manifest: serde_json::Value = serde_json::from_str(&manifest_json(name, version, deps)).unwrap();
                manifest["fsEntries"] = serde_json::json!([prefix, prefix.join("bin"), prefix.join("bin").join(name)]);
                fs::create_dir_all(dir.path().join("registry").join(name)).unwrap();
                fs::write(
                    dir.path().join("registry").join(name).join(format!("{}.json", version)),
                    manifest.to_string(),
                )
                .unwrap();
            }
            Self { dir }
        }

        fn registry_root(&self) -> PathBuf {
            self.dir.path().join("registry")
        }
    }

    #[test]
    fn test_run_removes_files_manifest_and_node() {
        let installed = Installed::new(&[("root", "6.30", &[("xz", "5.6")]), ("xz", "5.6", &[])]);
        let runtime = RealRuntime;
        let registry = PackageRegistry::new(&runtime, installed.registry_root());
        let mut graph = DependencyGraph::new();
        graph.add(&key("root/6.30"), &key("xz/5.6"));
        let rules = ProtectionRuleSet::new();

        let action = RemoveAction::new(&runtime, &registry);
        let summary = action
            .run(&RemovalRequest::Unprotected, &rules, &mut graph, true)
            .unwrap();

        assert_eq!(summary.removed, vec![key("xz/5.6"), key("root/6.30")]);
        assert_eq!(graph.node_count(), 0);
        assert!(!installed.dir.path().join("opt/root/6.30").exists());
        assert!(installed.dir.path().join("opt").exists());
        assert!(!registry.is_installed("root", "6.30"));
        assert!(!installed.registry_root().join("xz").exists());
    }

    #[test]
    fn test_remove_dependent_keeps_its_dependencies() {
        let installed = Installed::new(&[("root", "6.30", &[("xz", "5.6")]), ("xz", "5.6", &[])]);
        let runtime = RealRuntime;
        let registry = PackageRegistry::new(&runtime, installed.registry_root());
        let mut graph = DependencyGraph::new();
        graph.add(&key("root/6.30"), &key("xz/5.6"));

        RemoveAction::new(&runtime, &registry)
            .remove_package(&key("root/6.30"), &mut graph)
            .unwrap();

        assert!(!graph.contains(&key("root/6.30")));
        assert!(graph.contains(&key("xz/5.6")));
        assert_eq!(graph.edge_count(), 0);
        assert!(graph.dependency_of(&key("xz/5.6")).unwrap().is_empty());
        assert!(registry.is_installed("xz", "5.6"));
    }

    #[test]
    fn test_non_empty_directories_are_kept() {
        let installed = Installed::new(&[("xz", "5.6", &[])]);
        let extra = installed.dir.path().join("opt/xz/5.6/bin/local-tool");
        fs::write(&extra, "mine").unwrap();
        let runtime = RealRuntime;
        let registry = PackageRegistry::new(&runtime, installed.registry_root());
        let mut graph = DependencyGraph::new();
        graph.add_node(&key("xz/5.6"));

        RemoveAction::new(&runtime, &registry)
            .remove_package(&key("xz/5.6"), &mut graph)
            .unwrap();

        assert!(extra.exists());
        assert!(!installed.dir.path().join("opt/xz/5.6/bin/xz").exists());
        assert!(!registry.is_installed("xz", "5.6"));
    }

    #[test]
    fn test_non_interactive_without_yes_refuses() {
        let mut runtime = MockRuntime::new();
        runtime.expect_exists().returning(|_| false);
        runtime.expect_is_interactive().returning(|| false);
        runtime.expect_confirm().never();
        runtime.expect_remove_file().never();
        let registry = PackageRegistry::new(&runtime, PathBuf::from("/registry"));
        let mut graph = DependencyGraph::new();
        graph.add_node(&key("xz/5.6"));
        let rules = ProtectionRuleSet::new();

        let err = RemoveAction::new(&runtime, &registry)
            .run(&RemovalRequest::parse("xz", None), &rules, &mut graph, false)
            .unwrap_err();

        assert!(err.to_string().contains("refusing"));
        assert!(graph.contains(&key("xz/5.6")));
    }

    #[test]
    fn test_declined_confirmation_cancels() {
        let mut runtime = MockRuntime::new();
        runtime.expect_exists().returning(|_| false);
        runtime.expect_is_interactive().returning(|| true);
        runtime.expect_confirm().times(1).returning(|_| Ok(false));
        runtime.expect_remove_file().never();
        let registry = PackageRegistry::new(&runtime, PathBuf::from("/registry"));
        let mut graph = DependencyGraph::new();
        graph.add_node(&key("xz/5.6"));
        let rules = ProtectionRuleSet::new();

        let summary = RemoveAction::new(&runtime, &registry)
            .run(&RemovalRequest::parse("xz", None), &rules, &mut graph, false)
            .unwrap();

        assert!(summary.cancelled);
        assert!(graph.contains(&key("xz/5.6")));
    }

    #[test]
    fn test_failed_package_keeps_manifest_and_batch_continues() {
        let installed = Installed::new(&[("xz", "5.6", &[]), ("gsl", "2.7", &[])]);
        let runtime = RealRuntime;
        let registry = PackageRegistry::new(&runtime, installed.registry_root());
        fs::write(installed.registry_root().join("gsl/2.7.json"), "{broken").unwrap();
        let mut graph = DependencyGraph::new();
        graph.add_node(&key("xz/5.6"));
        graph.add_node(&key("gsl/2.7"));
        let rules = ProtectionRuleSet::new();

        let err = RemoveAction::new(&runtime, &registry)
            .run(&RemovalRequest::Unprotected, &rules, &mut graph, true)
            .unwrap_err();

        assert!(err.to_string().contains("gsl/2.7"));
        assert!(graph.contains(&key("gsl/2.7")));
        assert!(!graph.contains(&key("xz/5.6")));
        assert!(installed.registry_root().join("gsl/2.7.json").exists());
        assert!(!registry.is_installed("xz", "5.6"));
    }
}
