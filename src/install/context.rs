use anyhow::{Result, anyhow, bail};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::cleanup::CleanupContext;
use crate::package::{Manifest, PackageKey, PackageRegistry, Stats, VersionAttributes};
use crate::runtime::Runtime;
use crate::settings::{Settings, format_value, resolve_definitions};

pub const DEFAULT_PLATFORM: &str = "x86_64-linux-unknown";

/// State shared by the install stages of one package version.
pub struct InstallContext<'a, R: Runtime> {
    pub(crate) runtime: &'a R,
    pub(crate) registry: &'a PackageRegistry<'a, R>,
    pub(crate) settings: &'a Settings,
    pub package: String,
    pub version: VersionAttributes,
    pub definitions: BTreeMap<String, String>,
    /// Environment modules initialisation script passed to shell commands.
    pub modulescript: Option<PathBuf>,
    package_files: BTreeMap<String, PathBuf>,
    installed: Vec<PathBuf>,
    dependencies: Vec<Manifest>,
    cleanup: CleanupContext,
}

impl<'a, R: Runtime> InstallContext<'a, R> {
    pub fn new(
        runtime: &'a R,
        registry: &'a PackageRegistry<'a, R>,
        settings: &'a Settings,
        package: &str,
        version: VersionAttributes,
    ) -> Result<Self> {
        let definitions = resolve_definitions(settings.definitions_for(package, &version))?;
        Ok(Self {
            runtime,
            registry,
            settings,
            package: package.to_string(),
            version,
            definitions,
            modulescript: None,
            package_files: BTreeMap::new(),
            installed: Vec::new(),
            dependencies: Vec::new(),
            cleanup: CleanupContext::new(),
        })
    }

    pub fn key(&self) -> PackageKey {
        PackageKey::new(&self.package, self.version.full_version())
    }

    /// Substitute placeholders and environment variables in a step parameter.
    pub fn format(&self, template: &str) -> String {
        format_value(self.runtime, template, &self.definitions)
    }

    /// A file published by an earlier stage.
    pub fn package_file(&self, name: &str) -> Result<&Path> {
        self.package_files
            .get(name)
            .map(PathBuf::as_path)
            .ok_or_else(|| anyhow!("No \"{}\" among the files provided by previous stage(s)", name))
    }

    pub fn set_package_file(&mut self, name: &str, path: PathBuf) {
        if let Some(previous) = self.package_files.insert(name.to_string(), path) {
            debug!("Package file \"{}\" replaces {:?}", name, previous);
        }
    }

    /// Record a path as part of the installation.
    pub fn record(&mut self, path: PathBuf) {
        self.installed.push(path);
    }

    pub fn record_all(&mut self, paths: impl IntoIterator<Item = PathBuf>) {
        self.installed.extend(paths);
    }

    pub fn installed_entries(&self) -> &[PathBuf] {
        &self.installed
    }

    pub fn stats(&self) -> Stats {
        Stats::collect(self.runtime, &self.installed)
    }

    /// Register an installed dependency. Repeated calls for the same
    /// package are no-ops.
    pub fn resolve_dependency(&mut self, key: &PackageKey) -> Result<()> {
        if self.dependencies.iter().any(|m| &m.key() == key) {
            return Ok(());
        }
        let manifest = self.registry.load_required(key)?;
        info!("Using {} for {}", key, self.package);
        self.dependencies.push(manifest);
        Ok(())
    }

    pub fn depends(&mut self, name: &str, version: &str) -> Result<()> {
        self.resolve_dependency(&PackageKey::new(name, version))
    }

    pub fn dependencies(&self) -> &[Manifest] {
        &self.dependencies
    }

    pub fn dependency_keys(&self) -> Vec<PackageKey> {
        self.dependencies.iter().map(Manifest::key).collect()
    }

    pub fn cleanup_mut(&mut self) -> &mut CleanupContext {
        &mut self.cleanup
    }

    /// Fresh scratch directory; its deletion is up to the caller.
    pub fn temp_dir(&self) -> Result<PathBuf> {
        self.runtime.create_temp_dir(self.settings.tmp_dir_prefix.as_deref())
    }

    /// Environment passed to shell commands.
    pub fn command_env(&self) -> Result<Vec<(String, String)>> {
        let dependencies: Vec<String> = self.dependencies.iter().map(|m| m.key().to_string()).collect();
        let platform = self
            .definitions
            .get("platform")
            .cloned()
            .unwrap_or_else(|| DEFAULT_PLATFORM.to_string());

        let mut env = vec![
            ("SHAREPKG_DEPENDENCIES".to_string(), dependencies.join(":")),
            ("SHAREPKG_PLATFORM".to_string(), platform),
            (
                "MODULEPATH".to_string(),
                self.settings.modulepath.to_string_lossy().into_owned(),
            ),
        ];
        match &self.modulescript {
            Some(script) => {
                if !self.runtime.is_file(script) {
                    bail!("Module script {:?} is not a file", script);
                }
                env.push((
                    "SHAREPKG_MODULESCRIPT".to_string(),
                    script.to_string_lossy().into_owned(),
                ));
            }
            None => warn!("Shell command runs without SHAREPKG_MODULESCRIPT (no --module-script given)"),
        }
        Ok(env)
    }

    /// Run the on-exit handling of temporary paths.
    pub fn finish(&mut self, emergency: bool) {
        self.cleanup.finish(self.runtime, emergency);
    }
}
