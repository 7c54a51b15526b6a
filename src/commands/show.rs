use anyhow::Result;
use log::debug;

use crate::application::{ShowAction, dependency_tree};
use crate::graph::GraphCache;
use crate::runtime::Runtime;

use super::config::{Config, open_registry, protection_rules};

/// Show installed packages, one package's details, or the dependency graph
#[tracing::instrument(skip(runtime, config))]
pub fn show<R: Runtime>(
    runtime: R,
    name: Option<&str>,
    version: Option<&str>,
    tree: bool,
    config: Config,
) -> Result<()> {
    let settings = config.load_settings(&runtime)?;
    let registry = open_registry(&runtime, &settings)?;
    debug!("Using registry {:?}", registry.root());

    let output = if tree {
        let cache = GraphCache::open(&registry, config.dep_recache)?;
        let output = dependency_tree(cache.graph())?;
        cache.close()?;
        output
    } else if let (Some(name), Some(version)) = (name, version) {
        let rules = protection_rules(&settings, &registry)?;
        let cache = GraphCache::open(&registry, config.dep_recache)?;
        let output = ShowAction::new(&registry).details(name, version, cache.graph(), &rules)?;
        cache.close()?;
        output
    } else {
        ShowAction::new(&registry).table(name)?
    };

    print!("{}", output);
    Ok(())
}
