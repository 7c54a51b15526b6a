use anyhow::{Context, Result};
use log::debug;
use std::path::PathBuf;

use crate::application::{InstallAction, InstallRequest};
use crate::graph::GraphCache;
use crate::package::PackageKey;
use crate::runtime::Runtime;

use super::config::{Config, open_registry};

/// Install a package version
#[tracing::instrument(skip(runtime, config))]
pub fn install<R: Runtime>(
    runtime: R,
    name: &str,
    version: &str,
    uses: &[String],
    modulescript: Option<PathBuf>,
    config: Config,
) -> Result<()> {
    let settings = config.load_settings(&runtime)?;
    let registry = open_registry(&runtime, &settings)?;
    debug!("Using registry {:?}", registry.root());

    let uses = uses
        .iter()
        .map(|u| u.parse::<PackageKey>().with_context(|| format!("Invalid --use {}", u)))
        .collect::<Result<Vec<_>>>()?;
    let request = InstallRequest {
        name: name.to_string(),
        version: version.to_string(),
        uses,
        modulescript,
    };

    let mut cache = GraphCache::open(&registry, config.dep_recache)?;
    let manifest = InstallAction::new(&runtime, &registry, &settings).install(&request, cache.graph_mut())?;
    cache.close()?;

    println!(
        "Installed {} ({})",
        manifest.key(),
        manifest.stats.summary()
    );
    Ok(())
}
