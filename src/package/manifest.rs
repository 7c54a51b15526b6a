use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::runtime::Runtime;

use super::key::PackageKey;
use super::order::VersionRecord;
use super::version::VersionAttributes;

/// Install manifest of one package version.
///
/// Stored as `<registry>/<name>/<version>.json`. Manifests are the source of
/// truth for what is installed; the dependency graph is derived from them.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub package: String,
    pub version: VersionAttributes,
    pub installed_at: NaiveDateTime,
    #[serde(default)]
    pub fs_entries: Vec<PathBuf>,
    #[serde(default)]
    pub stats: Stats,
    #[serde(default)]
    pub dependencies: Vec<PackageKey>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub size: u64,
    pub n_files: u64,
    pub n_dirs: u64,
    pub n_links: u64,
}

impl Stats {
    /// Aggregate sizes and counts over installed entries.
    pub fn collect<R: Runtime>(runtime: &R, entries: &[PathBuf]) -> Self {
        let mut stats = Stats::default();
        for entry in entries {
            if runtime.is_symlink(entry) {
                stats.n_links += 1;
            } else if runtime.is_file(entry) {
                stats.n_files += 1;
                match runtime.file_size(entry) {
                    Ok(size) => stats.size += size,
                    Err(e) => warn!("Could not get size of {:?}: {}", entry, e),
                }
            } else if runtime.is_dir(entry) {
                stats.n_dirs += 1;
            } else {
                warn!("Unknown or missing filesystem entry: {:?}", entry);
            }
        }
        stats
    }

    pub fn summary(&self) -> String {
        format!("{} in {} files", format_size(self.size), self.n_files)
    }
}

impl Manifest {
    pub fn key(&self) -> PackageKey {
        PackageKey::new(&self.package, self.full_version())
    }

    pub fn full_version(&self) -> &str {
        self.version.full_version()
    }

    pub fn version_record(&self) -> VersionRecord {
        VersionRecord {
            package: self.package.clone(),
            attributes: self.version.clone(),
            installed_at: self.installed_at,
        }
    }

    #[tracing::instrument(skip(runtime, path))]
    pub fn load<R: Runtime>(runtime: &R, path: &Path) -> Result<Self> {
        let content = runtime.read_to_string(path)?;
        let manifest: Manifest =
            serde_json::from_str(&content).with_context(|| format!("Malformed package manifest {:?}", path))?;
        Ok(manifest)
    }
}

/// Human readable size with binary prefixes, e.g. `1.5MiB`.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 8] = ["", "Ki", "Mi", "Gi", "Ti", "Pi", "Ei", "Zi"];
    let mut value = bytes as f64;
    for unit in UNITS {
        if value < 1024.0 {
            return format!("{:.1}{}B", value, unit);
        }
        value /= 1024.0;
    }
    format!("{:.1}YiB", value)
}
