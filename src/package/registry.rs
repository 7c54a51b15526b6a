//! Registry of installed package manifests.
//!
//! All reads and writes of `<registry>/<name>/<version>.json` go through
//! [`PackageRegistry`].

use anyhow::{Context, Result, anyhow};
use glob::Pattern;
use log::{debug, warn};
use std::path::{Path, PathBuf};

use crate::runtime::Runtime;

use super::discovery::find_all_manifests;
use super::key::PackageKey;
use super::manifest::Manifest;
use super::order::VersionRecord;

pub struct PackageRegistry<'a, R: Runtime> {
    runtime: &'a R,
    root: PathBuf,
}

impl<'a, R: Runtime> PackageRegistry<'a, R> {
    pub fn new(runtime: &'a R, root: PathBuf) -> Self {
        Self { runtime, root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn runtime(&self) -> &'a R {
        self.runtime
    }

    /// Returns: `<root>/<name>/<version>.json`
    pub fn manifest_path(&self, name: &str, version: &str) -> PathBuf {
        self.root.join(name).join(format!("{}.json", version))
    }

    pub fn is_installed(&self, name: &str, version: &str) -> bool {
        self.runtime.exists(&self.manifest_path(name, version))
    }

    /// Load a manifest, `None` if the version is not installed.
    pub fn load(&self, name: &str, version: &str) -> Result<Option<Manifest>> {
        let path = self.manifest_path(name, version);
        if !self.runtime.exists(&path) {
            return Ok(None);
        }
        Manifest::load(self.runtime, &path).map(Some)
    }

    pub fn load_required(&self, key: &PackageKey) -> Result<Manifest> {
        self.load(&key.name, &key.version)?.ok_or_else(|| {
            anyhow!(
                "Package {} is not installed (no manifest at {:?})",
                key,
                self.manifest_path(&key.name, &key.version)
            )
        })
    }

    #[tracing::instrument(skip(self, manifest), fields(package = %manifest.key()))]
    pub fn save(&self, manifest: &Manifest) -> Result<PathBuf> {
        let path = self.manifest_path(&manifest.package, manifest.full_version());

        if let Some(parent) = path.parent()
            && !self.runtime.exists(parent)
        {
            self.runtime.create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(manifest)?;
        self.runtime
            .write(&path, content.as_bytes())
            .with_context(|| format!("Failed to save manifest to {:?}", path))?;
        Ok(path)
    }

    /// Delete a manifest and, if it was the last one, the package directory.
    pub fn delete(&self, key: &PackageKey) -> Result<()> {
        let path = self.manifest_path(&key.name, &key.version);
        debug!("Deleting manifest {:?}", path);
        self.runtime.remove_file(&path)?;

        if let Some(dir) = path.parent()
            && let Ok(entries) = self.runtime.read_dir(dir)
            && entries.is_empty()
            && let Err(e) = self.runtime.remove_dir(dir)
        {
            warn!("Failed to remove empty package directory {:?}: {:#}", dir, e);
        }
        Ok(())
    }

    pub fn find_all(&self) -> Result<Vec<PathBuf>> {
        find_all_manifests(self.runtime, &self.root)
    }

    /// Manifest paths relative to the registry root, sorted.
    pub fn manifest_list(&self) -> Result<Vec<String>> {
        Ok(self
            .find_all()?
            .iter()
            .filter_map(|p| p.strip_prefix(&self.root).ok())
            .map(|p| p.to_string_lossy().into_owned())
            .collect())
    }

    /// Load every manifest. Unreadable or foreign JSON files are skipped with a warning.
    pub fn all_manifests(&self) -> Result<Vec<(PathBuf, Manifest)>> {
        let paths = self.find_all()?;
        let mut results = Vec::with_capacity(paths.len());

        for path in paths {
            match Manifest::load(self.runtime, &path) {
                Ok(manifest) => results.push((path, manifest)),
                Err(e) => {
                    warn!("File {:?} does not seem to be a package manifest (ignored): {:#}", path, e);
                }
            }
        }

        Ok(results)
    }

    /// Manifests whose package name and full version match the glob patterns.
    pub fn matching(&self, name_pattern: &str, version_pattern: &str) -> Result<Vec<Manifest>> {
        let name_pat =
            Pattern::new(name_pattern).with_context(|| format!("Invalid package name pattern '{}'", name_pattern))?;
        let version_pat = Pattern::new(version_pattern)
            .with_context(|| format!("Invalid version pattern '{}'", version_pattern))?;

        Ok(self
            .all_manifests()?
            .into_iter()
            .map(|(_, m)| m)
            .filter(|m| name_pat.matches(&m.package) && version_pat.matches(m.full_version()))
            .collect())
    }

    /// Version history of every manifest stored under `<root>/<name>/`.
    ///
    /// The package name recorded inside each manifest is kept as is so that
    /// callers can detect misplaced manifests.
    pub fn version_records(&self, name: &str) -> Result<Vec<VersionRecord>> {
        let dir = self.root.join(name);
        Ok(self
            .all_manifests()?
            .into_iter()
            .filter(|(path, _)| path.parent() == Some(dir.as_path()))
            .map(|(_, m)| m.version_record())
            .collect())
    }
}
