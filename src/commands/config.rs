use anyhow::{Result, bail};
use log::debug;
use std::path::PathBuf;

use crate::package::PackageRegistry;
use crate::protection::ProtectionRuleSet;
use crate::runtime::Runtime;
use crate::settings::{DEFAULT_SETTINGS_FILE, Settings};

/// Global command line options.
#[derive(Debug, Clone)]
pub struct Config {
    pub settings_file: PathBuf,
    /// `key=value` definitions overriding the settings file.
    pub defines: Vec<String>,
    /// Rebuild the dependency graph from the manifests.
    pub dep_recache: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            settings_file: PathBuf::from(DEFAULT_SETTINGS_FILE),
            defines: Vec::new(),
            dep_recache: false,
        }
    }
}

impl Config {
    pub fn load_settings<R: Runtime>(&self, runtime: &R) -> Result<Settings> {
        debug!("Using settings file {:?}", self.settings_file);
        Settings::load(runtime, &self.settings_file, &self.defines)
    }
}

/// Registry of `settings`; the directory has to exist.
pub fn open_registry<'a, R: Runtime>(runtime: &'a R, settings: &Settings) -> Result<PackageRegistry<'a, R>> {
    if !runtime.is_dir(&settings.registry_dir) {
        bail!("Registry directory {:?} does not exist", settings.registry_dir);
    }
    Ok(PackageRegistry::new(runtime, settings.registry_dir.clone()))
}

/// Protection rules of every configured package.
pub fn protection_rules<R: Runtime>(settings: &Settings, registry: &PackageRegistry<'_, R>) -> Result<ProtectionRuleSet> {
    ProtectionRuleSet::build(settings.protection_definitions(), |name| registry.version_records(name))
}
