//! Show action - renders installed packages, details and the dependency graph.

use anyhow::{Result, bail};
use std::fmt::Write;

use crate::graph::DependencyGraph;
use crate::package::{PackageRegistry, format_size};
use crate::protection::ProtectionRuleSet;
use crate::runtime::Runtime;

use super::remove::RemovalPlanner;

const TIME_FORMAT: &str = "%d/%m/%y, %H:%M";

pub struct ShowAction<'a, R: Runtime> {
    registry: &'a PackageRegistry<'a, R>,
}

impl<'a, R: Runtime> ShowAction<'a, R> {
    pub fn new(registry: &'a PackageRegistry<'a, R>) -> Self {
        Self { registry }
    }

    /// Table of installed packages whose name matches `name_pattern`.
    #[tracing::instrument(skip(self))]
    pub fn table(&self, name_pattern: Option<&str>) -> Result<String> {
        let mut manifests = self.registry.matching(name_pattern.unwrap_or("*"), "*")?;
        manifests.sort_by(|a, b| a.key().cmp(&b.key()));

        let mut out = String::new();
        if manifests.is_empty() {
            writeln!(
                out,
                " (no packages installed -- \"{}\" is empty).",
                self.registry.root().display()
            )?;
            return Ok(out);
        }

        let rows: Vec<[String; 5]> = manifests
            .iter()
            .map(|m| {
                let deps = if m.dependencies.is_empty() {
                    "N/A".to_string()
                } else {
                    m.dependencies.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
                };
                [
                    m.package.clone(),
                    m.full_version().to_string(),
                    format_size(m.stats.size),
                    m.installed_at.format(TIME_FORMAT).to_string(),
                    deps,
                ]
            })
            .collect();

        let header = ["Package", "Version", "Size", "Time", "Depends"];
        let mut widths = header.map(str::len);
        for row in &rows {
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = (*width).max(cell.chars().count());
            }
        }

        let line = |out: &mut String, cells: [&str; 5]| -> std::fmt::Result {
            writeln!(
                out,
                "{:>w0$}  {:<w1$}  {:>w2$}  {:<w3$}  {}",
                cells[0],
                cells[1],
                cells[2],
                cells[3],
                cells[4],
                w0 = widths[0],
                w1 = widths[1],
                w2 = widths[2],
                w3 = widths[3],
            )
        };
        line(&mut out, header)?;
        for row in &rows {
            line(&mut out, [&row[0], &row[1], &row[2], &row[3], &row[4]])?;
        }

        let total: u64 = manifests.iter().map(|m| m.stats.size).sum();
        writeln!(out, "{} overall", format_size(total))?;
        Ok(out)
    }

    /// Manifest JSON of one package plus its protection status.
    #[tracing::instrument(skip(self, graph, rules))]
    pub fn details(&self, name: &str, version: &str, graph: &DependencyGraph, rules: &ProtectionRuleSet) -> Result<String> {
        let Some(manifest) = self.registry.load(name, version)? else {
            bail!("Package \"{}\" of version \"{}\" is not installed", name, version);
        };

        let mut out = serde_json::to_string_pretty(&manifest)?;
        out.push('\n');

        let record = RemovalPlanner::new(graph, rules).protection_status(name, version)?;
        if record.is_protecting() {
            writeln!(out, "Protected:")?;
            record.write_tree(&mut out, 1)?;
        } else {
            writeln!(out, "Not protected")?;
        }
        Ok(out)
    }
}

/// Every weakly-connected component with its edges.
pub fn dependency_tree(graph: &DependencyGraph) -> Result<String> {
    let mut out = String::new();
    let subgraphs = graph.isolated_subgraphs();
    if subgraphs.is_empty() {
        writeln!(out, " (dependency graph is empty)")?;
    }
    for (n, subgraph) in subgraphs.iter().enumerate() {
        writeln!(out, "Component #{} ({} packages):", n + 1, subgraph.nodes.len())?;
        if subgraph.edges.is_empty() {
            for node in &subgraph.nodes {
                writeln!(out, "    {}", node)?;
            }
        }
        for (from, to) in &subgraph.edges {
            writeln!(out, "    {} -> {}", from, to)?;
        }
    }
    Ok(out)
}
