use anyhow::{Context, Result};
use log::{debug, warn};

use crate::application::{RemovalRequest, RemoveAction};
use crate::graph::GraphCache;
use crate::runtime::Runtime;

use super::config::{Config, open_registry, protection_rules};

/// Remove packages matching `name` and `version`, or every unprotected one
#[tracing::instrument(skip(runtime, config))]
pub fn remove<R: Runtime>(
    runtime: R,
    name: &str,
    version: Option<&str>,
    yes: bool,
    keep: &[String],
    config: Config,
) -> Result<()> {
    let settings = config.load_settings(&runtime)?;
    let registry = open_registry(&runtime, &settings)?;

    let mut rules = protection_rules(&settings, &registry)?;
    for spec in keep {
        rules.keep(spec).with_context(|| format!("Invalid --keep {}", spec))?;
    }

    let request = RemovalRequest::parse(name, version);
    debug!("Removal request: {}", request);

    let mut cache = GraphCache::open(&registry, config.dep_recache)?;
    let outcome = RemoveAction::new(&runtime, &registry).run(&request, &rules, cache.graph_mut(), yes);
    // Packages removed before a failure are gone from the graph as well.
    if let Err(e) = cache.close() {
        warn!("{:#}; run with --dep-recache to rebuild the dependency graph", e);
    }

    let summary = outcome?;
    if !summary.cancelled && !summary.removed.is_empty() {
        println!("Removed {} package(s)", summary.removed.len());
    }
    Ok(())
}
